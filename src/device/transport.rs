//! Command transport to the remote headstage.
//!
//! The engine talks to the device through a remote shell with a
//! file-staging convention: per-chip command files are uploaded, drained
//! into the per-chip FIFO device nodes by an on-device interleaving tool,
//! and optionally deleted. The shell client itself lives outside this crate;
//! `CommandTransport` is the seam it plugs into.

use std::time::Duration;

use log::warn;

use crate::config::DeviceConfig;
use crate::error::Result;
use crate::stim::ChipCommands;

/// Minimal operations a remote shell must provide.
pub trait CommandTransport: Send {
    /// (Re-)establish the connection. Does not retry.
    fn connect(&mut self) -> Result<()>;

    /// Liveness probe with a short timeout; a trivial command must succeed.
    fn is_alive(&mut self, timeout: Duration) -> bool;

    /// Run a shell command, returning combined stdout and stderr.
    fn exec(&mut self, command: &str) -> Result<String>;

    /// Upload a file to the remote side.
    fn upload(&mut self, remote_path: &str, data: &[u8]) -> Result<()>;
}

/// If the transport is down, check again. Returns the resulting status.
pub fn ensure_connection(transport: &mut dyn CommandTransport, timeout: Duration) -> bool {
    if transport.is_alive(timeout) {
        return true;
    }

    if let Err(e) = transport.connect() {
        warn!("transport reconnect failed: {e}");
        return false;
    }

    true
}

/// Stages per-chip command streams into the remote FIFO device nodes.
pub struct ChipCommandStager {
    remote_file_location: String,
    fifo_dev_files: Vec<String>,
    write_evenly_tool: String,
    remove_remote_files: bool,
    sequence: u64,
}

impl ChipCommandStager {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            remote_file_location: config.remote_file_location.clone(),
            fifo_dev_files: config.fifo_dev_files.clone(),
            write_evenly_tool: config.write_evenly_tool.clone(),
            remove_remote_files: config.remove_remote_files,
            sequence: 0,
        }
    }

    pub fn num_chips(&self) -> usize {
        self.fifo_dev_files.len()
    }

    fn commands_file(&mut self, chip: usize) -> String {
        self.sequence += 1;
        format!("{}/cmd_{}_{}.bin", self.remote_file_location, chip, self.sequence)
    }

    /// Upload each chip's stream and drain all of them into the chip FIFOs
    /// in one shell invocation, so the chips advance in lock-step.
    pub fn send(
        &mut self,
        transport: &mut dyn CommandTransport,
        commands: &ChipCommands,
    ) -> Result<()> {
        let mut staged: Vec<(usize, String)> = Vec::new();

        for (&chip, stream) in commands {
            if stream.is_empty() {
                continue;
            }

            let remote_file = self.commands_file(chip);
            transport.upload(&remote_file, stream)?;
            staged.push((chip, remote_file));
        }

        if staged.is_empty() {
            return Ok(());
        }

        staged.sort_by_key(|&(chip, _)| chip);

        let mut command_str = self.write_evenly_tool.clone();

        for (_, remote_file) in &staged {
            command_str.push_str(&format!(" {remote_file} "));
        }

        for (chip, _) in &staged {
            command_str.push_str(&format!(" {}", self.fifo_dev_files[*chip]));
        }

        if self.remove_remote_files {
            for (_, remote_file) in &staged {
                command_str.push_str(&format!("; rm {remote_file}"));
            }
        }

        transport.exec(&command_str)?;
        Ok(())
    }

    /// Send the same command bytes to every chip.
    pub fn send_to_all(
        &mut self,
        transport: &mut dyn CommandTransport,
        commands: &[u8],
    ) -> Result<()> {
        let all: ChipCommands = (0..self.num_chips())
            .map(|chip| (chip, commands.to_vec()))
            .collect();

        self.send(transport, &all)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Observable state of a `RecordingTransport`, shared with the test.
    #[derive(Default)]
    pub struct TransportLog {
        pub alive: bool,
        pub connect_succeeds: bool,
        pub uploads: Vec<(String, Vec<u8>)>,
        pub execs: Vec<String>,
        pub responses: HashMap<String, String>,
    }

    /// Scripted transport for tests: records uploads and executed commands,
    /// answers `exec` from a canned response table. The log is shared so the
    /// test keeps visibility after the transport is boxed away.
    pub struct RecordingTransport {
        pub log: Arc<Mutex<TransportLog>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(TransportLog {
                    alive: true,
                    connect_succeeds: true,
                    ..TransportLog::default()
                })),
            }
        }

        pub fn log_handle(&self) -> Arc<Mutex<TransportLog>> {
            self.log.clone()
        }
    }

    impl CommandTransport for RecordingTransport {
        fn connect(&mut self) -> Result<()> {
            let mut log = self.log.lock();
            if log.connect_succeeds {
                log.alive = true;
                Ok(())
            } else {
                Err(crate::error::EngineError::TransportDown("scripted".into()))
            }
        }

        fn is_alive(&mut self, _timeout: Duration) -> bool {
            self.log.lock().alive
        }

        fn exec(&mut self, command: &str) -> Result<String> {
            let mut log = self.log.lock();
            log.execs.push(command.to_string());
            Ok(log.responses.get(command).cloned().unwrap_or_default())
        }

        fn upload(&mut self, remote_path: &str, data: &[u8]) -> Result<()> {
            self.log
                .lock()
                .uploads
                .push((remote_path.to_string(), data.to_vec()));
            Ok(())
        }
    }
}
