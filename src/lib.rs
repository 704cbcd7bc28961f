//! mea-engine: acquisition and stimulation engine for multi-electrode-array
//! headstages.
//!
//! Electrode arrays stream bit-packed sample words over UDP; the engine
//! decodes them into per-electrode AC/DC series, runs user-configured DSP
//! pipelines at a fixed 120 Hz tick cadence, records to chunked compressed
//! datasets, and generates 4-word-aligned stimulation command streams that
//! are uploaded to the remote headstage.
//!
//! The HTTP control surface and the WebSocket fan-out live outside this
//! crate: control arrives through [`engine::EngineHandle`] and outbound
//! traffic leaves on the [`engine::OutboundEvent`] channel. Likewise the
//! concrete shell client is external, plugged in through
//! [`device::transport::CommandTransport`].

pub mod config;
pub mod device;
pub mod electrode;
pub mod engine;
pub mod error;
pub mod filters;
pub mod module;
pub mod sink;
pub mod stim;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, OutboundEvent};
pub use error::{EngineError, Result};
