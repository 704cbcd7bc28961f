//! Data sinks: steps that consume samples instead of transforming them.

pub mod nwb_writer;

pub use nwb_writer::{NwbFileWriter, NwbFileWriterConfig};
