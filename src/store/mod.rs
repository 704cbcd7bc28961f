//! Sample stores backing the published steps.

pub mod data_buffer;

pub use data_buffer::{DataBuffer, CACHE_SIZE};
