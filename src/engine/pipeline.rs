//! A pipeline: an ordered chain of steps producing one output per tick.
//!
//! The first stage is normally a published step acting as the source. On
//! the very first run of a pipeline whose source is a ring-buffered store,
//! the store's full cached window seeds the chain, so downstream filter
//! state starts from realistic history instead of silence; every later run
//! uses just the current tick's increment.

use uuid::Uuid;

use crate::engine::step::{PublishedHandle, Step, StepData};

pub enum PipelineStage {
    /// A published step resolved by name; acts as a source.
    Published {
        id: Uuid,
        handle: PublishedHandle,
    },
    /// A configured filter or sink.
    Filter {
        id: Uuid,
        step: Box<dyn Step>,
    },
}

impl PipelineStage {
    pub fn published(handle: PublishedHandle) -> Self {
        Self::Published {
            id: Uuid::new_v4(),
            handle,
        }
    }

    pub fn filter(step: Box<dyn Step>) -> Self {
        Self::Filter {
            id: Uuid::new_v4(),
            step,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Published { id, .. } | Self::Filter { id, .. } => *id,
        }
    }
}

pub struct Pipeline {
    pub id: Uuid,
    stages: Vec<PipelineStage>,
    is_first_run: bool,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stages,
            is_first_run: true,
        }
    }

    pub fn stage_ids(&self) -> Vec<Uuid> {
        self.stages.iter().map(PipelineStage::id).collect()
    }

    /// Run every stage in order, feeding each the previous stage's result.
    pub fn do_step(&mut self) -> Option<StepData> {
        let mut result: Option<StepData> = None;
        let mut is_first_stage = true;

        for stage in &mut self.stages {
            let was_first_stage = is_first_stage;
            is_first_stage = false;

            match stage {
                PipelineStage::Published { handle, .. } => {
                    if was_first_stage && self.is_first_run {
                        self.is_first_run = false;

                        if let PublishedHandle::Buffer(buffer) = handle {
                            result = Some(StepData::Samples(buffer.lock().cache().to_vec()));
                            continue;
                        }
                    }

                    result = handle.result();
                }
                PipelineStage::Filter { step, .. } => {
                    if was_first_stage {
                        // A filter placed first has no source; it never runs.
                        if self.is_first_run {
                            self.is_first_run = false;
                        }
                        result = None;
                        continue;
                    }

                    result = step.do_step(result.as_ref());
                }
            }
        }

        result
    }

    /// Release every stage's resources; called on pipeline deletion.
    pub fn finalize(&mut self) {
        for stage in &mut self.stages {
            if let PipelineStage::Filter { step, .. } = stage {
                step.finalize();
            }
        }
    }
}
