//! Devices: acquisition/stimulation hardware attached to the engine.
//!
//! A device front owns its UDP ingestor and its control worker and is
//! polled once per engine tick via `collect_updates`. Control messages go
//! the other way through `run_command`.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::electrode::DeviceProps;

pub mod controller;
pub mod neuroprobe;
pub mod openmea;
pub mod transport;
pub mod udp;

pub use controller::{DeviceController, SCLK_FREQ};
pub use neuroprobe::NeuroprobeDevice;
pub use openmea::OpenMeaDevice;

/// Device initialization phase, orthogonal to sampling and stimulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitState {
    NotInitialized,
    Initializing,
    Initialized,
    InitFailed,
}

/// One state-change event, forwarded verbatim onto the outbound stream.
/// Only the populated fields are serialized.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_state: Option<InitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sampling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_stimulating: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_step_done: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_init_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reset_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_props: Option<Value>,
}

impl DeviceStateEvent {
    pub fn connected(is_connected: bool) -> Self {
        Self {
            is_connected: Some(is_connected),
            ..Self::default()
        }
    }
}

/// Everything a device produced since the previous tick.
#[derive(Debug, Default)]
pub struct DeviceUpdates {
    pub state: Vec<DeviceStateEvent>,
    /// Decoded samples keyed by series name (`<n>_ac` / `<n>_dc`).
    pub data: HashMap<String, Vec<f32>>,
    /// Set when the device's timebase restarted; all caches must clear.
    pub was_reset: bool,
}

pub trait Device: Send {
    fn name(&self) -> &'static str;

    fn num_electrodes(&self) -> usize;

    fn properties(&self) -> &DeviceProps;

    /// Drain everything the device workers produced since the last call.
    fn collect_updates(&mut self) -> DeviceUpdates;

    /// Forward a tagged control message to the device worker.
    fn run_command(&self, msg: Value);

    /// Tear down workers and sockets. Called on device switch.
    fn close(&mut self);
}

/// Placeholder before any device is attached.
pub struct NullDevice {
    props: DeviceProps,
}

impl NullDevice {
    pub fn new() -> Self {
        Self {
            props: DeviceProps {
                name: "None",
                can_control_replay: false,
                can_control_sampling: false,
                can_record_to_file: false,
                can_stimulate: false,
                can_sample_dc: false,
                num_electrodes: 0,
                num_electrode_rows: 0,
                electrode_map: Vec::new(),
                electrode_exists: Vec::new(),
                electrode_names: Vec::new(),
            },
        }
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for NullDevice {
    fn name(&self) -> &'static str {
        "None"
    }

    fn num_electrodes(&self) -> usize {
        0
    }

    fn properties(&self) -> &DeviceProps {
        &self.props
    }

    fn collect_updates(&mut self) -> DeviceUpdates {
        DeviceUpdates::default()
    }

    fn run_command(&self, _msg: Value) {}

    fn close(&mut self) {}
}
