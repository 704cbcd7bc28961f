//! Pipeline steps and the published-step registry.
//!
//! Steps flow `StepData` values: most carry a scalar sample series, while
//! the synthetic `electrodes` step publishes the whole per-tick channel
//! map (the archival writer consumes that form). Published steps live
//! behind shared handles so both the tick loop (writing) and pipelines
//! (reading) can reach them; a resolved handle is typed, letting consumers
//! choose between the bulk cache and the last-tick result.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::store::data_buffer::DataBuffer;

/// Value flowing between pipeline steps.
#[derive(Debug, Clone)]
pub enum StepData {
    /// One channel's sample run.
    Samples(Vec<f32>),
    /// Per-series sample runs for the whole electrode array.
    Channels(HashMap<String, Vec<f32>>),
}

impl StepData {
    pub fn as_samples(&self) -> Option<&[f32]> {
        match self {
            StepData::Samples(samples) => Some(samples),
            StepData::Channels(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StepData::Samples(samples) => samples.is_empty(),
            StepData::Channels(channels) => channels.is_empty(),
        }
    }
}

/// A configured DSP or sink unit. Steps are invoked serially by their
/// owning pipeline; `None` or empty input must produce `None` without
/// touching state, and outputs are always fresh values.
pub trait Step: Send {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData>;

    /// Release per-step resources. Called when the pipeline is deleted.
    fn finalize(&mut self) {}
}

/// Shared slot holding the latest result of a non-buffered published step.
pub type SharedResult = Arc<Mutex<Option<StepData>>>;

/// Shared handle to one published step.
#[derive(Clone)]
pub enum PublishedHandle {
    /// A ring-buffered channel store (`<n>_ac` / `<n>_dc`).
    Buffer(Arc<Mutex<DataBuffer>>),
    /// A live value republished every tick (`electrodes`).
    Latest(SharedResult),
}

impl PublishedHandle {
    /// The step's result for the current tick.
    pub fn result(&self) -> Option<StepData> {
        match self {
            PublishedHandle::Buffer(buffer) => buffer
                .lock()
                .result()
                .map(|samples| StepData::Samples(samples.to_vec())),
            PublishedHandle::Latest(slot) => slot.lock().clone(),
        }
    }

    pub fn reset_result(&self) {
        match self {
            PublishedHandle::Buffer(buffer) => buffer.lock().reset_result(),
            PublishedHandle::Latest(slot) => *slot.lock() = None,
        }
    }
}

/// Name-keyed registry of published steps, rebuilt on device attach.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, PublishedHandle>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, handle: PublishedHandle) {
        self.steps.insert(name, handle);
    }

    pub fn get(&self, name: &str) -> Result<PublishedHandle> {
        self.steps
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn reset_results(&self) {
        for handle in self.steps.values() {
            handle.reset_result();
        }
    }
}
