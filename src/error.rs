//! Engine error taxonomy.
//! Variants are grouped by surface behavior rather than by origin type:
//! transport failures flip `isConnected`, format failures flip the init
//! state, queue overflows are log-only at the call site.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Remote shell or socket unreachable. The background reconnect loop
    /// re-establishes; no retry happens inside a single call.
    #[error("transport down: {0}")]
    TransportDown(String),

    /// The parsed device state indicates a failed boot or unexpected mode.
    #[error("device initialization failed: {0}")]
    InitFailed(String),

    /// A recording target exists but is not usable (not a regular file, or
    /// an opened recording does not parse).
    #[error("rejected recording file {path}: {reason}")]
    FormatRejected { path: String, reason: String },

    /// Heterogeneous sampling rates or other violated structural assumption.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("unknown published step \"{0}\"")]
    UnknownStep(String),

    #[error("unknown step type \"{0}\"")]
    UnknownStepType(String),

    #[error("unknown pipeline {0}")]
    UnknownPipeline(uuid::Uuid),

    #[error("unknown module \"{0}\"")]
    UnknownModule(String),

    #[error("unknown device \"{0}\"")]
    UnknownDevice(String),

    #[error("bad step config: {0}")]
    BadStepConfig(String),

    #[error("bad stimulation config: {0}")]
    BadStimConfig(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("recording error: {0}")]
    Recording(String),

    #[error("engine is shut down")]
    EngineGone,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<hdf5::Error> for EngineError {
    fn from(e: hdf5::Error) -> Self {
        EngineError::Recording(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
