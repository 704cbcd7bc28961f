//! Engine modules: pluggable units stepped once per tick.
//!
//! A module receives opaque JSON commands from the control surface and may
//! return a payload each tick, which the engine routes onto a stream named
//! after the module. Modules are registered explicitly on the engine;
//! there is no runtime discovery.
//!
//! Module names are short, capitalized, human-readable: "Stim", not
//! "stim_module".

use serde_json::Value;

use crate::error::Result;

pub trait EngineModule: Send {
    fn name(&self) -> &str;

    /// Called once per engine tick; a returned value is emitted on the
    /// module's stream.
    fn do_step(&mut self) -> Option<Value>;

    /// Handle an opaque command from the control surface.
    fn handle_command(&mut self, command: Value) -> Result<()>;
}

/// Stimulation pacing module: publishes the running tick number on the
/// `Stim` stream so the stimulation UI can track engine progress.
pub struct StimModule {
    step_num: u64,
}

impl StimModule {
    pub fn new() -> Self {
        Self { step_num: 0 }
    }
}

impl Default for StimModule {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineModule for StimModule {
    fn name(&self) -> &str {
        "Stim"
    }

    fn do_step(&mut self) -> Option<Value> {
        self.step_num += 1;
        Some(Value::from(self.step_num))
    }

    fn handle_command(&mut self, _command: Value) -> Result<()> {
        // No configuration needed here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stim_module_counts_ticks() {
        let mut module = StimModule::new();
        assert_eq!(module.name(), "Stim");

        assert_eq!(module.do_step(), Some(Value::from(1u64)));
        assert_eq!(module.do_step(), Some(Value::from(2u64)));
        assert_eq!(module.do_step(), Some(Value::from(3u64)));
    }

    #[test]
    fn test_stim_module_accepts_any_command() {
        let mut module = StimModule::new();
        assert!(module
            .handle_command(serde_json::json!({"anything": "goes"}))
            .is_ok());

        // Commands do not disturb the tick counter.
        module.do_step();
        module.handle_command(Value::Null).unwrap();
        assert_eq!(module.do_step(), Some(Value::from(2u64)));
    }
}
