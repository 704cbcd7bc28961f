//! Per-device control worker.
//!
//! One controller runs per attached device, on its own thread with a ~1 ms
//! cadence. It owns the command transport, probes liveness every five
//! seconds from a detached thread, executes the scripted initialization
//! sequence, parses the device status line, and drives the active
//! stimulator by uploading its command chunks to the chip FIFOs.
//!
//! Connection, initialization, sampling and stimulating are orthogonal
//! flags; the status parse decides the first three, the stim tick the last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::DeviceConfig;
use crate::device::transport::{ensure_connection, ChipCommandStager, CommandTransport};
use crate::device::{DeviceStateEvent, InitState};
use crate::stim::rhs2116::{set_stim_step_size, STIM_STEP_SIZE_1_UA};
use crate::stim::{BiphasicStimulator, NullStimulator, StimConfig, Stimulator, WavStimulator};

/// Device master clock; the sample period is programmed in SCLK ticks.
pub const SCLK_FREQ: f64 = 200_000_000.0;

/// Hard ceiling on the programmable sampling rate.
const MAX_SAMPLES_PER_SEC: f64 = 40_000.0;

/// Liveness probe timeout; a healthy shell answers well inside this.
const CONNECTION_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

const CONNECTION_CHECK_PERIOD: Duration = Duration::from_secs(5);

const LOOP_SLEEP: Duration = Duration::from_millis(1);

/// Outcome of parsing one device status line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusParse {
    NotInitialized,
    InitFailed,
    Initialized {
        is_sampling: bool,
        sample_duration_sclk: u32,
    },
}

/// Differences between device families the controller must know about.
#[derive(Clone, Copy)]
pub struct ControllerProfile {
    pub start_sampling_command: &'static str,
    pub stop_sampling_command: &'static str,
    /// Command word that programs the sample period, in SCLK ticks.
    pub sample_duration_command: &'static str,
    pub supports_stimulation: bool,
    pub parse_status: fn(&str) -> StatusParse,
}

/// Handle held by the device front: commands in, state events out.
pub struct ControllerHandle {
    cmd_tx: Sender<Value>,
    state_rx: Receiver<DeviceStateEvent>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn send_command(&self, msg: Value) {
        if let Err(TrySendError::Full(_)) = self.cmd_tx.try_send(msg) {
            warn!("device command queue is full; command dropped");
        }
    }

    /// Non-blocking drain of pending state events.
    pub fn drain_state(&self) -> Vec<DeviceStateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.state_rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct DeviceController {
    cmd_rx: Receiver<Value>,
    state_tx: Sender<DeviceStateEvent>,
    transport: Arc<Mutex<Box<dyn CommandTransport>>>,
    stager: ChipCommandStager,
    profile: ControllerProfile,
    config: DeviceConfig,

    connected: Arc<AtomicBool>,
    is_stimulating: Arc<AtomicBool>,
    initialized_stim: Arc<AtomicBool>,
    running: Arc<AtomicBool>,

    stimulator: Box<dyn Stimulator>,
    stim_step_size_index: usize,
    max_frequency: u32,
    last_connection_check: Instant,
}

impl DeviceController {
    /// Spawn the control worker and return its handle.
    pub fn spawn(
        config: DeviceConfig,
        profile: ControllerProfile,
        transport: Box<dyn CommandTransport>,
    ) -> ControllerHandle {
        let (controller, mut handle) = Self::new(config, profile, transport);

        let thread = thread::Builder::new()
            .name("device-controller".to_string())
            .spawn(move || controller.run_loop())
            .expect("failed to spawn device controller thread");

        handle.thread = Some(thread);
        handle
    }

    fn new(
        config: DeviceConfig,
        profile: ControllerProfile,
        transport: Box<dyn CommandTransport>,
    ) -> (Self, ControllerHandle) {
        let (cmd_tx, cmd_rx) = bounded(1024);
        let (state_tx, state_rx) = bounded(4096);
        let running = Arc::new(AtomicBool::new(true));

        let controller = Self {
            cmd_rx,
            state_tx,
            transport: Arc::new(Mutex::new(transport)),
            stager: ChipCommandStager::new(&config),
            profile,
            config,
            connected: Arc::new(AtomicBool::new(false)),
            is_stimulating: Arc::new(AtomicBool::new(false)),
            initialized_stim: Arc::new(AtomicBool::new(false)),
            running: running.clone(),
            stimulator: Box::new(NullStimulator),
            stim_step_size_index: STIM_STEP_SIZE_1_UA,
            max_frequency: 20_000,
            last_connection_check: Instant::now(),
        };

        // Starting in "not connected" keeps device-switch logic simple; the
        // first connection check corrects it.
        controller.emit_state(DeviceStateEvent::connected(false));

        let handle = ControllerHandle {
            cmd_tx,
            state_rx,
            running,
            thread: None,
        };

        (controller, handle)
    }

    fn run_loop(mut self) {
        while self.running.load(Ordering::SeqCst) {
            if self.last_connection_check.elapsed() > CONNECTION_CHECK_PERIOD {
                self.last_connection_check = Instant::now();
                self.spawn_connection_check();
            }

            self.process_messages();
            self.continue_stim();
            thread::sleep(LOOP_SLEEP);
        }
    }

    /// Probe the transport from a detached thread so a hung shell cannot
    /// stall command processing.
    fn spawn_connection_check(&self) {
        let transport = self.transport.clone();
        let connected = self.connected.clone();
        let initialized_stim = self.initialized_stim.clone();
        let is_stimulating = self.is_stimulating.clone();
        let state_tx = self.state_tx.clone();
        let profile = self.profile;
        let get_state_command = self.config.get_device_state_command.clone();

        let result = thread::Builder::new()
            .name("device-conn-check".to_string())
            .spawn(move || {
                let was_connected = connected.load(Ordering::SeqCst);

                let now_connected = {
                    let mut transport = transport.lock();
                    ensure_connection(transport.as_mut(), CONNECTION_PROBE_TIMEOUT)
                };

                connected.store(now_connected, Ordering::SeqCst);

                if !now_connected {
                    initialized_stim.store(false, Ordering::SeqCst);
                }

                let _ = state_tx.try_send(DeviceStateEvent::connected(now_connected));

                if !was_connected && now_connected {
                    info!("device transport reconnected");
                    let mut transport = transport.lock();
                    let event = query_device_state(
                        transport.as_mut(),
                        &get_state_command,
                        profile,
                        is_stimulating.load(Ordering::SeqCst),
                    );
                    let _ = state_tx.try_send(event);
                }
            });

        if let Err(e) = result {
            error!("failed to spawn connection check thread: {e}");
        }
    }

    fn process_messages(&mut self) {
        while let Ok(msg) = self.cmd_rx.try_recv() {
            self.process_message(&msg);
        }
    }

    fn process_message(&mut self, msg: &Value) {
        if msg.get("checkDeviceState").is_some() {
            self.check_and_send_device_state();
        }

        if msg.get("initializeDevice").is_some() {
            self.initialize_device();
        }

        if let Some(command) = msg.get("command").and_then(Value::as_str) {
            self.exec_device_command(command);
        }

        if self.profile.supports_stimulation {
            if msg.get("pulseConfig").is_some() {
                self.configure_stimulator(msg);
            }

            if msg.get("startStim").is_some() {
                self.start_stim();
            }

            if msg.get("stopStim").is_some() {
                self.stimulator.stop_stimulation();
            }
        }

        if let Some(rate) = msg.get("setSamplingRate").and_then(Value::as_f64) {
            self.set_sampling_rate(rate);
        }

        if msg.get("startSampling").is_some() {
            self.exec_device_command(self.profile.start_sampling_command);
        }

        if msg.get("stopSampling").is_some() {
            self.exec_device_command(self.profile.stop_sampling_command);
        }
    }

    fn configure_stimulator(&mut self, msg: &Value) {
        let config: StimConfig = match serde_json::from_value(msg.clone()) {
            Ok(config) => config,
            Err(e) => {
                warn!("rejected stimulation config: {e}");
                return;
            }
        };

        if self.stim_step_size_index != config.stim_step_size_index {
            self.stim_step_size_index = config.stim_step_size_index;

            if self.connected.load(Ordering::SeqCst) && self.initialized_stim.load(Ordering::SeqCst)
            {
                let commands = set_stim_step_size(self.stim_step_size_index);
                let mut transport = self.transport.lock();
                if let Err(e) = self.stager.send_to_all(transport.as_mut(), &commands) {
                    warn!("failed to push stim step size: {e}");
                }
            }
            // Otherwise the step size is programmed on the first pulse.
        }

        self.max_frequency = config.max_frequency;

        if self.stimulator.pulse_type() == config.pulse_type {
            if let Err(e) = self.stimulator.update_config(&config) {
                warn!("stimulator reconfiguration failed: {e}");
            }
            return;
        }

        self.stimulator.on_stimulation_done();

        match config.pulse_type.as_str() {
            "wav_files" => match WavStimulator::new(&config) {
                Ok(stimulator) => self.stimulator = Box::new(stimulator),
                Err(e) => warn!("waveform stimulator rejected: {e}"),
            },
            "biphasic" => {
                self.stimulator = Box::new(BiphasicStimulator::new(
                    &config,
                    self.stim_step_size_index,
                    self.max_frequency,
                ))
            }
            other => warn!("unknown pulse type \"{other}\""),
        }
    }

    fn start_stim(&mut self) {
        self.is_stimulating.store(true, Ordering::SeqCst);

        if let Err(e) = self.stimulator.on_stimulation_starting() {
            error!("stimulation failed to start: {e}");
            self.is_stimulating.store(false, Ordering::SeqCst);
            return;
        }

        self.emit_state(DeviceStateEvent {
            is_stimulating: Some(true),
            ..DeviceStateEvent::default()
        });
    }

    /// One stimulation tick: emit the next command chunk and upload it to
    /// every chip FIFO; flip the flag off once the stimulator reports done.
    fn continue_stim(&mut self) {
        if !self.connected.load(Ordering::SeqCst) || !self.is_stimulating.load(Ordering::SeqCst) {
            return;
        }

        if !self.initialized_stim.load(Ordering::SeqCst) {
            let commands = set_stim_step_size(self.stim_step_size_index);
            let mut transport = self.transport.lock();
            if let Err(e) = self.stager.send_to_all(transport.as_mut(), &commands) {
                warn!("failed to initialize stimulation: {e}");
                return;
            }
            self.initialized_stim.store(true, Ordering::SeqCst);
        }

        let generate_start = Instant::now();
        let commands = match self.stimulator.emit_next_commands() {
            Ok(commands) => commands,
            Err(e) => {
                error!("stimulator failed: {e}");
                self.is_stimulating.store(false, Ordering::SeqCst);
                self.emit_state(DeviceStateEvent {
                    is_stimulating: Some(false),
                    ..DeviceStateEvent::default()
                });
                return;
            }
        };

        let still_stimulating = !self.stimulator.is_done();
        self.is_stimulating.store(still_stimulating, Ordering::SeqCst);

        let send_start = Instant::now();
        {
            let mut transport = self.transport.lock();
            if let Err(e) = self.stager.send(transport.as_mut(), &commands) {
                warn!("failed to upload stimulation commands: {e}");
            }
        }

        debug!(
            "stim tick: generate {:.1} ms, send {:.1} ms",
            send_start.duration_since(generate_start).as_secs_f64() * 1000.0,
            send_start.elapsed().as_secs_f64() * 1000.0,
        );

        if !still_stimulating {
            self.emit_state(DeviceStateEvent {
                is_stimulating: Some(false),
                ..DeviceStateEvent::default()
            });
        }
    }

    /// Run the scripted init sequence, reporting progress per step.
    fn initialize_device(&mut self) {
        let num_init_steps = self.config.device_init_commands.len();

        self.emit_state(DeviceStateEvent {
            init_state: Some(InitState::Initializing),
            init_step_done: Some(0),
            num_init_steps: Some(num_init_steps),
            ..DeviceStateEvent::default()
        });

        for i in 0..num_init_steps {
            let command = self.config.device_init_commands[i].clone();

            self.emit_state(DeviceStateEvent {
                log: Some(command.clone()),
                ..DeviceStateEvent::default()
            });

            let output = {
                let mut transport = self.transport.lock();
                match transport.exec(&command) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!("init step \"{command}\" failed: {e}");
                        String::new()
                    }
                }
            };

            self.emit_state(DeviceStateEvent {
                init_state: Some(InitState::Initializing),
                init_step_done: Some(i),
                num_init_steps: Some(num_init_steps),
                log: Some(output),
                ..DeviceStateEvent::default()
            });
        }

        self.check_and_send_device_state();
    }

    fn check_and_send_device_state(&self) {
        let event = {
            let mut transport = self.transport.lock();
            query_device_state(
                transport.as_mut(),
                &self.config.get_device_state_command,
                self.profile,
                self.is_stimulating.load(Ordering::SeqCst),
            )
        };

        self.emit_state(event);
    }

    fn exec_device_command(&self, command: &str) {
        let command_str = self.config.device_command_format.replace("{}", command);

        {
            let mut transport = self.transport.lock();
            if let Err(e) = transport.exec(&command_str) {
                warn!("device command \"{command}\" failed: {e}");
            }
        }

        self.check_and_send_device_state();
    }

    fn set_sampling_rate(&self, rate: f64) {
        let adjusted_rate = rate.min(MAX_SAMPLES_PER_SEC);
        let sample_duration_sclk = (SCLK_FREQ / adjusted_rate).round() as u64;
        self.exec_device_command(&format!(
            "{} {}",
            self.profile.sample_duration_command, sample_duration_sclk
        ));
    }

    fn emit_state(&self, event: DeviceStateEvent) {
        if self.state_tx.try_send(event).is_err() {
            warn!("device state queue is full; event dropped");
        }
    }
}

/// Execute the status command and fold its parse into a state event.
fn query_device_state(
    transport: &mut dyn CommandTransport,
    get_state_command: &str,
    profile: ControllerProfile,
    is_stimulating: bool,
) -> DeviceStateEvent {
    let status = match transport.exec(get_state_command) {
        Ok(status) => status,
        Err(e) => {
            debug!("device state query failed: {e}");
            return DeviceStateEvent::connected(false);
        }
    };

    let mut event = DeviceStateEvent::connected(true);

    match (profile.parse_status)(&status) {
        StatusParse::NotInitialized => {
            event.init_state = Some(InitState::NotInitialized);
        }
        StatusParse::InitFailed => {
            event.init_state = Some(InitState::InitFailed);
        }
        StatusParse::Initialized {
            is_sampling,
            sample_duration_sclk,
        } => {
            event.init_state = Some(InitState::Initialized);
            event.is_sampling = Some(is_sampling);
            event.samples_per_sec = Some(SCLK_FREQ / f64::from(sample_duration_sclk));

            if profile.supports_stimulation {
                event.is_stimulating = Some(is_stimulating);
            }
        }
    }

    event
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_bit(s: &str) -> bool {
    s == "0" || s == "1"
}

/// Status line `hex,hex,int,bit,bit`: magic, sample duration (SCLK, hex),
/// mode word, boot-failed flag, sampling flag.
pub fn parse_openmea_status(status: &str) -> StatusParse {
    let fields: Vec<&str> = status.trim().split(',').collect();

    if fields.len() < 5
        || !is_hex(fields[0])
        || !is_hex(fields[1])
        || !fields[2].chars().all(|c| c.is_ascii_digit())
        || fields[2].is_empty()
        || !is_bit(fields[3])
        || !is_bit(fields[4])
    {
        return StatusParse::NotInitialized;
    }

    if fields[3] != "0" || fields[2] != "00000002" {
        return StatusParse::InitFailed;
    }

    match u32::from_str_radix(fields[1], 16) {
        Ok(sample_duration_sclk) if sample_duration_sclk > 0 => StatusParse::Initialized {
            is_sampling: fields[4] == "1",
            sample_duration_sclk,
        },
        _ => StatusParse::NotInitialized,
    }
}

/// Status line `hex,hex,bit,bit,bit,bit,bit,bit,hex,bit,bit`; field 9 is the
/// sample duration, field 10 the boot-failed flag, field 11 the sampling
/// flag.
pub fn parse_neuroprobe_status(status: &str) -> StatusParse {
    let fields: Vec<&str> = status.trim().split(',').collect();

    if fields.len() < 11
        || !is_hex(fields[0])
        || !is_hex(fields[1])
        || !fields[2..8].iter().all(|f| is_bit(f))
        || !is_hex(fields[8])
        || !is_bit(fields[9])
        || !is_bit(fields[10])
    {
        return StatusParse::NotInitialized;
    }

    if fields[9] != "0" {
        return StatusParse::InitFailed;
    }

    match u32::from_str_radix(fields[8], 16) {
        Ok(sample_duration_sclk) if sample_duration_sclk > 0 => StatusParse::Initialized {
            is_sampling: fields[10] == "1",
            sample_duration_sclk,
        },
        _ => StatusParse::NotInitialized,
    }
}
