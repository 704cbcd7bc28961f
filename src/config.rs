//! Engine configuration.
//!
//! Loaded from `config.yml`, falling back to `config.prod.yml`. Each device
//! key carries the shell endpoint, the per-chip command FIFO paths, and the
//! scripted init sequence for that headstage.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Shell endpoint and command conventions for one device type.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,

    /// Command FIFO device node per chip, in chip order.
    #[serde(default)]
    pub fifo_dev_files: Vec<String>,

    /// Directory on the remote side where command files are staged.
    pub remote_file_location: String,

    /// Remove staged command files after they have been drained into the
    /// FIFOs.
    #[serde(default)]
    pub remove_remote_files: bool,

    /// Tool that interleaves staged command files into the chip FIFOs.
    #[serde(default)]
    pub write_evenly_tool: String,

    /// Format string for general device commands; `{}` is replaced by the
    /// command text.
    pub device_command_format: String,

    /// Command whose CSV-hex output describes the device state.
    pub get_device_state_command: String,

    /// Commands run, in order, by `initializeDevice`.
    #[serde(default)]
    pub device_init_commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    pub openmea: Option<DeviceConfig>,
    pub neuroprobe: Option<DeviceConfig>,
}

impl EngineConfig {
    /// Load `config.yml` if present, otherwise `config.prod.yml`.
    pub fn load() -> Result<Self> {
        if Path::new("config.yml").is_file() {
            return Self::load_from("config.yml");
        }

        Self::load_from("config.prod.yml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| EngineError::Config(format!("{path}: {e}")))
    }
}
