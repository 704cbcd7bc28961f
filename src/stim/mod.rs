//! Stimulation command generation.
//!
//! A stimulator turns its configuration into per-chip streams of 32-bit
//! command words. All participating chips step through the event in
//! synchronized 4-word blocks; streams are padded with the benign
//! read-chip-id command to keep the alignment.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Result;

pub mod biphasic;
pub mod rhs2116;
pub mod wav;

pub use biphasic::BiphasicStimulator;
pub use wav::WavStimulator;

/// Command bytes destined for each chip's FIFO, keyed by chip index.
pub type ChipCommands = HashMap<usize, Vec<u8>>;

/// Pulse parameters shared by the stimulator kinds. Currents are amps,
/// durations are seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseConfig {
    #[serde(default)]
    pub phase1_current: f64,
    #[serde(default)]
    pub phase2_current: f64,
    #[serde(default)]
    pub phase1_duration: f64,
    #[serde(default)]
    pub phase2_duration: f64,
    #[serde(default)]
    pub interphase_duration: f64,
    /// Waveform files, one per pulse source, for file-driven stimulation.
    #[serde(default)]
    pub file_paths: Vec<String>,
}

fn default_step_size_index() -> usize {
    rhs2116::STIM_STEP_SIZE_1_UA
}

/// Full stimulation configuration, as delivered by a `pulseConfig` device
/// message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimConfig {
    pub pulse_type: String,
    pub max_frequency: u32,
    #[serde(default = "default_step_size_index")]
    pub stim_step_size_index: usize,
    /// Electrodes driven by each pulse source; biphasic uses entry 0.
    #[serde(default)]
    pub electrodes_by_pulse: Vec<Vec<usize>>,
    /// Electrodes driven with inverted polarity. Not populated by any
    /// current client; handled symmetrically when present.
    #[serde(default)]
    pub inverse_electrodes: Vec<usize>,
    #[serde(default)]
    pub loop_forever: bool,
    pub pulse_config: PulseConfig,
}

/// Command emitter for one kind of stimulation.
///
/// The device controller drives this from its loop: once stimulation is
/// started, every iteration calls `emit_next_commands` and forwards the
/// returned streams to the chip FIFOs until `is_done` reports true.
pub trait Stimulator: Send {
    fn pulse_type(&self) -> &'static str;

    fn update_config(&mut self, config: &StimConfig) -> Result<()>;

    /// Called when stimulation is about to start; opens files and resets
    /// emission state.
    fn on_stimulation_starting(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next per-chip command chunk. An empty map means there is
    /// nothing to emit right now.
    fn emit_next_commands(&mut self) -> Result<ChipCommands>;

    /// Request a stop; the stimulator winds down on the next emit call.
    fn stop_stimulation(&mut self) {}

    fn is_done(&self) -> bool {
        true
    }

    /// Called after the last commands have been emitted; releases files.
    fn on_stimulation_done(&mut self) {}
}

/// Placeholder installed before any pulse configuration arrives.
pub struct NullStimulator;

impl Stimulator for NullStimulator {
    fn pulse_type(&self) -> &'static str {
        "none"
    }

    fn update_config(&mut self, _config: &StimConfig) -> Result<()> {
        Ok(())
    }

    fn emit_next_commands(&mut self) -> Result<ChipCommands> {
        Ok(ChipCommands::new())
    }
}

#[cfg(test)]
pub(crate) fn words(stream: &[u8]) -> Vec<u32> {
    stream
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
