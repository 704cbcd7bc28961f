//! Engine entry point.
//!
//! Loads the YAML configuration, wires the engine and its outbound stream,
//! and runs the tick loop on the main thread. When launched by the UI the
//! first argument is the parent process id; a watchdog aborts this process
//! within a second of the parent disappearing, so no orphan keeps the UDP
//! ports and the device shell occupied.
//!
//! The HTTP control surface, the WebSocket fan-out and the device shell
//! client attach from outside: the control surface drives
//! [`mea_engine::EngineHandle`], the fan-out drains the outbound channel,
//! and the shell client implements `CommandTransport`.

use std::process;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::{debug, error, info};

use mea_engine::device::transport::CommandTransport;
use mea_engine::{Engine, EngineConfig, OutboundEvent};

/// Stand-in transport used until an external shell client is attached;
/// reports the device as unreachable.
struct DisconnectedTransport;

impl CommandTransport for DisconnectedTransport {
    fn connect(&mut self) -> mea_engine::Result<()> {
        Err(mea_engine::EngineError::TransportDown(
            "no shell client attached".into(),
        ))
    }

    fn is_alive(&mut self, _timeout: Duration) -> bool {
        false
    }

    fn exec(&mut self, _command: &str) -> mea_engine::Result<String> {
        Err(mea_engine::EngineError::TransportDown(
            "no shell client attached".into(),
        ))
    }

    fn upload(&mut self, _remote_path: &str, _data: &[u8]) -> mea_engine::Result<()> {
        Err(mea_engine::EngineError::TransportDown(
            "no shell client attached".into(),
        ))
    }
}

/// Abort once the parent process disappears. The UI may die without a
/// chance to terminate us; every worker must go down with it.
fn watch_parent(parent_pid: i32) {
    loop {
        thread::sleep(Duration::from_secs(1));

        let alive = unsafe { libc::kill(parent_pid, 0) } == 0
            || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);

        if !alive {
            error!("parent process {parent_pid} is gone; aborting");
            process::abort();
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Some(parent_pid) = std::env::args().nth(1).and_then(|arg| {
        arg.trim_matches(|c| c == '"' || c == '\'').parse::<i32>().ok()
    }) {
        thread::Builder::new()
            .name("parent-watchdog".to_string())
            .spawn(move || watch_parent(parent_pid))
            .expect("failed to spawn parent watchdog");
    }

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("cannot load configuration: {e}");
            process::exit(1);
        }
    };

    let (out_tx, out_rx) = bounded::<OutboundEvent>(4096);

    // Placeholder consumer; the streaming fan-out replaces this drain.
    thread::Builder::new()
        .name("outbound-drain".to_string())
        .spawn(move || {
            for event in out_rx {
                match event {
                    OutboundEvent::Message(message) => debug!("msg: {message}"),
                    OutboundEvent::Module { name, payload } => debug!("{name}: {payload}"),
                }
            }
        })
        .expect("failed to spawn outbound drain");

    let mut engine = Engine::new(config, out_tx, Box::new(|_| Box::new(DisconnectedTransport)));

    info!("mea-engine up; control handle ready");
    engine.run();
}
