//! The engine: a fixed-cadence tick loop driving data collection, the DSP
//! pipelines, and the outbound stream.
//!
//! Each tick collects the device's updates, feeds the per-channel caches,
//! runs every pipeline in order, and emits one message keyed by pipeline
//! id. Pacing never builds a backlog: the next deadline is
//! `max(previous + 1/120 s, now)`, so a slow tick shifts the schedule
//! instead of causing a catch-up burst.
//!
//! Control (pipeline management, device switching, module commands) comes
//! in through a command channel processed between ticks; the HTTP surface
//! talks to `EngineHandle`.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{DeviceConfig, EngineConfig};
use crate::device::transport::CommandTransport;
use crate::device::{Device, DeviceStateEvent, NeuroprobeDevice, NullDevice, OpenMeaDevice};
use crate::electrode::electrode_name;
use crate::engine::pipeline::Pipeline;
use crate::engine::step::{PublishedHandle, StepData, StepRegistry};
use crate::error::{EngineError, Result};
use crate::filters::build_stage;
use crate::module::EngineModule;
use crate::store::data_buffer::DataBuffer;

pub mod pipeline;
pub mod step;

pub const STEPS_PER_SEC: f64 = 120.0;

/// Everything the engine pushes toward the streaming fan-out.
#[derive(Debug)]
pub enum OutboundEvent {
    /// The per-tick general message: device state plus pipeline outputs.
    Message(Value),
    /// A module's payload, routed to the module-named stream.
    Module { name: String, payload: Value },
}

#[derive(Debug, Clone)]
pub struct PipelineInfo {
    pub id: Uuid,
    pub steps: Vec<Uuid>,
}

enum EngineCommand {
    AddPipeline {
        steps: Vec<Value>,
        reply: Sender<Result<PipelineInfo>>,
    },
    DeletePipeline {
        id: Uuid,
        reply: Sender<Result<()>>,
    },
    ConnectDevice {
        name: String,
        reply: Sender<Result<()>>,
    },
    DeviceCommand {
        msg: Value,
    },
    ModuleCommand {
        name: String,
        command: Value,
        reply: Sender<Result<()>>,
    },
    Shutdown,
}

/// Cloneable control handle; the seam the HTTP surface calls into.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: Sender<EngineCommand>,
}

impl EngineHandle {
    fn request<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> EngineCommand) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| EngineError::EngineGone)?;
        reply_rx.recv().map_err(|_| EngineError::EngineGone)?
    }

    pub fn add_pipeline(&self, steps: Vec<Value>) -> Result<PipelineInfo> {
        self.request(|reply| EngineCommand::AddPipeline { steps, reply })
    }

    pub fn delete_pipeline(&self, id: Uuid) -> Result<()> {
        self.request(|reply| EngineCommand::DeletePipeline { id, reply })
    }

    pub fn connect_to_device(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| EngineCommand::ConnectDevice { name, reply })
    }

    pub fn send_device_command(&self, msg: Value) -> Result<()> {
        self.cmd_tx
            .send(EngineCommand::DeviceCommand { msg })
            .map_err(|_| EngineError::EngineGone)
    }

    pub fn module_command(&self, name: &str, command: Value) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| EngineCommand::ModuleCommand {
            name,
            command,
            reply,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
    }
}

/// Builds the command transport for a device when it is attached.
pub type TransportFactory = Box<dyn Fn(&DeviceConfig) -> Box<dyn CommandTransport> + Send>;

pub struct Engine {
    config: EngineConfig,
    device: Box<dyn Device>,
    registry: StepRegistry,
    pipelines: HashMap<Uuid, Pipeline>,
    modules: HashMap<String, Box<dyn EngineModule>>,

    out_tx: Sender<OutboundEvent>,
    cmd_tx: Sender<EngineCommand>,
    cmd_rx: Receiver<EngineCommand>,
    transport_factory: TransportFactory,

    next_step_time: Instant,
    running: bool,
    tick_count: u64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        out_tx: Sender<OutboundEvent>,
        transport_factory: TransportFactory,
    ) -> Self {
        let (cmd_tx, cmd_rx) = bounded(256);

        let mut engine = Self {
            config,
            device: Box::new(NullDevice::new()),
            registry: StepRegistry::new(),
            pipelines: HashMap::new(),
            modules: HashMap::new(),
            out_tx,
            cmd_tx,
            cmd_rx,
            transport_factory,
            next_step_time: Instant::now() + tick_period(),
            running: true,
            tick_count: 0,
        };

        engine.initialize();
        engine
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn register_module(&mut self, module: Box<dyn EngineModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Install a device directly. Used by tests and custom wiring; the
    /// control surface goes through `connect_to_device`.
    pub fn set_device(&mut self, device: Box<dyn Device>) {
        self.device.close();
        self.device = device;
        self.initialize();
    }

    /// Rebuild the published steps for the current device: one ring buffer
    /// per series plus the aggregate `electrodes` step.
    pub fn initialize(&mut self) {
        self.registry.clear();

        for i in 0..self.device.num_electrodes() {
            self.registry.insert(
                electrode_name(i, "ac"),
                PublishedHandle::Buffer(Arc::new(Mutex::new(DataBuffer::new()))),
            );
            self.registry.insert(
                electrode_name(i, "dc"),
                PublishedHandle::Buffer(Arc::new(Mutex::new(DataBuffer::new()))),
            );
        }

        self.registry.insert(
            "electrodes".to_string(),
            PublishedHandle::Latest(Arc::new(Mutex::new(None))),
        );
    }

    /// Run until shut down. Consumes the current thread.
    pub fn run(&mut self) {
        info!("engine loop starting at {STEPS_PER_SEC} ticks/sec");

        while self.running {
            self.tick_count += 1;
            self.process_commands();
            self.do_step();

            // Pace the loop; a missed deadline resets the schedule to now,
            // so slippage never accumulates into a burst of ticks.
            let now = Instant::now();
            let next_step_time = (self.next_step_time + tick_period()).max(now);
            self.next_step_time = next_step_time;
            thread::sleep(next_step_time - now);
        }

        info!("engine loop stopped after {} ticks", self.tick_count);
        for pipeline in self.pipelines.values_mut() {
            pipeline.finalize();
        }
        self.device.close();
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                EngineCommand::AddPipeline { steps, reply } => {
                    let _ = reply.send(self.add_pipeline(&steps));
                }
                EngineCommand::DeletePipeline { id, reply } => {
                    let _ = reply.send(self.delete_pipeline(id));
                }
                EngineCommand::ConnectDevice { name, reply } => {
                    let _ = reply.send(self.connect_to_device(&name));
                }
                EngineCommand::DeviceCommand { msg } => self.device.run_command(msg),
                EngineCommand::ModuleCommand {
                    name,
                    command,
                    reply,
                } => {
                    let result = match self.modules.get_mut(&name) {
                        Some(module) => module.handle_command(command),
                        None => Err(EngineError::UnknownModule(name.clone())),
                    };
                    let _ = reply.send(result);
                }
                EngineCommand::Shutdown => self.running = false,
            }
        }
    }

    fn do_step(&mut self) {
        let mut message = serde_json::Map::new();
        let updates = self.device.collect_updates();

        if !updates.state.is_empty() {
            if let Ok(state) = serde_json::to_value(&updates.state) {
                message.insert("deviceState".to_string(), state);
            }
        }

        self.registry.reset_results();

        if updates.was_reset {
            let reset_event = DeviceStateEvent {
                last_reset_time: Some(epoch_now()),
                ..DeviceStateEvent::default()
            };

            let entry = message
                .entry("deviceState".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let (Value::Array(events), Ok(event)) = (entry, serde_json::to_value(&reset_event)) {
                events.push(event);
            }

            self.clear_channel_buffers();
        }

        // Pipelines see one frozen snapshot for the whole tick: the
        // aggregate map and the per-channel appends both happen before any
        // pipeline runs.
        if let Ok(PublishedHandle::Latest(slot)) = self.registry.get("electrodes") {
            *slot.lock() = Some(StepData::Channels(updates.data.clone()));
        }

        for (key, data) in &updates.data {
            match self.registry.get(key) {
                Ok(PublishedHandle::Buffer(buffer)) => buffer.lock().add_data(data),
                Ok(PublishedHandle::Latest(slot)) => {
                    *slot.lock() = Some(StepData::Samples(data.clone()))
                }
                Err(_) => warn!("device produced samples for unknown series {key}"),
            }
        }

        for pipeline in self.pipelines.values_mut() {
            if let Some(StepData::Samples(samples)) = pipeline.do_step() {
                if let Ok(value) = serde_json::to_value(&samples) {
                    message.insert(pipeline.id.to_string(), value);
                }
            }
        }

        if self
            .out_tx
            .send(OutboundEvent::Message(Value::Object(message)))
            .is_err()
        {
            // The fan-out side is gone; there is nobody left to serve.
            self.running = false;
            return;
        }

        for module in self.modules.values_mut() {
            if let Some(payload) = module.do_step() {
                let event = OutboundEvent::Module {
                    name: module.name().to_string(),
                    payload,
                };
                if self.out_tx.send(event).is_err() {
                    self.running = false;
                    return;
                }
            }
        }
    }

    fn clear_channel_buffers(&mut self) {
        for i in 0..self.device.num_electrodes() {
            for kind in ["ac", "dc"] {
                if let Ok(PublishedHandle::Buffer(buffer)) =
                    self.registry.get(&electrode_name(i, kind))
                {
                    buffer.lock().clear();
                }
            }
        }
    }

    fn add_pipeline(&mut self, steps: &[Value]) -> Result<PipelineInfo> {
        let mut stages = Vec::with_capacity(steps.len());

        for spec in steps {
            stages.push(build_stage(spec, &self.registry, self.device.properties())?);
        }

        let pipeline = Pipeline::new(stages);
        let info = PipelineInfo {
            id: pipeline.id,
            steps: pipeline.stage_ids(),
        };

        info!("pipeline {} created with {} steps", info.id, info.steps.len());
        self.pipelines.insert(pipeline.id, pipeline);
        Ok(info)
    }

    fn delete_pipeline(&mut self, id: Uuid) -> Result<()> {
        let mut pipeline = self
            .pipelines
            .remove(&id)
            .ok_or(EngineError::UnknownPipeline(id))?;

        pipeline.finalize();
        info!("pipeline {id} deleted");
        Ok(())
    }

    fn connect_to_device(&mut self, device_name: &str) -> Result<()> {
        if self.device.name() == device_name {
            return Ok(());
        }

        let new_device: Box<dyn Device> = match device_name {
            "OpenMEA" => {
                let device_config = self
                    .config
                    .openmea
                    .clone()
                    .ok_or_else(|| EngineError::Config("no openmea config section".into()))?;
                let transport = (self.transport_factory)(&device_config);
                Box::new(OpenMeaDevice::attach(device_config, transport)?)
            }
            "Neuroprobe" => {
                let device_config = self
                    .config
                    .neuroprobe
                    .clone()
                    .ok_or_else(|| EngineError::Config("no neuroprobe config section".into()))?;
                let transport = (self.transport_factory)(&device_config);
                Box::new(NeuroprobeDevice::attach(device_config, transport)?)
            }
            other => return Err(EngineError::UnknownDevice(other.to_string())),
        };

        info!("switching device to {device_name}");
        self.device.close();
        self.device = new_device;
        self.initialize();
        Ok(())
    }
}

fn tick_period() -> Duration {
    Duration::from_secs_f64(1.0 / STEPS_PER_SEC)
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceUpdates;
    use crate::electrode::DeviceProps;
    use std::collections::VecDeque;

    fn test_props(num_electrodes: usize) -> DeviceProps {
        DeviceProps {
            name: "Scripted",
            can_control_replay: false,
            can_control_sampling: true,
            can_record_to_file: true,
            can_stimulate: false,
            can_sample_dc: true,
            num_electrodes,
            num_electrode_rows: 1,
            electrode_map: (0..num_electrodes).map(Some).collect(),
            electrode_exists: vec![true; num_electrodes],
            electrode_names: (0..num_electrodes).map(|i| Some(i.to_string())).collect(),
        }
    }

    struct ScriptedDevice {
        props: DeviceProps,
        updates: Arc<Mutex<VecDeque<DeviceUpdates>>>,
        collect_times: Arc<Mutex<Vec<Instant>>>,
        block_on_tick: Option<(usize, Duration)>,
        collects: usize,
    }

    impl ScriptedDevice {
        fn new(num_electrodes: usize, updates: Vec<DeviceUpdates>) -> Self {
            Self {
                props: test_props(num_electrodes),
                updates: Arc::new(Mutex::new(updates.into())),
                collect_times: Arc::new(Mutex::new(Vec::new())),
                block_on_tick: None,
                collects: 0,
            }
        }

        /// Shared handle for feeding updates while the engine runs.
        fn update_queue(&self) -> Arc<Mutex<VecDeque<DeviceUpdates>>> {
            self.updates.clone()
        }
    }

    impl Device for ScriptedDevice {
        fn name(&self) -> &'static str {
            "Scripted"
        }

        fn num_electrodes(&self) -> usize {
            self.props.num_electrodes
        }

        fn properties(&self) -> &DeviceProps {
            &self.props
        }

        fn collect_updates(&mut self) -> DeviceUpdates {
            self.collect_times.lock().push(Instant::now());

            if let Some((tick, duration)) = self.block_on_tick {
                if self.collects == tick {
                    thread::sleep(duration);
                }
            }

            self.collects += 1;
            self.updates.lock().pop_front().unwrap_or_default()
        }

        fn run_command(&self, _msg: Value) {}

        fn close(&mut self) {}
    }

    fn engine_with_device(
        device: ScriptedDevice,
    ) -> (Engine, EngineHandle, Receiver<OutboundEvent>) {
        let (out_tx, out_rx) = bounded(100_000);
        let mut engine = Engine::new(
            EngineConfig::default(),
            out_tx,
            Box::new(|_| panic!("no transport in tests")),
        );
        engine.set_device(Box::new(device));
        let handle = engine.handle();
        (engine, handle, out_rx)
    }

    fn data_update(samples: &[f32]) -> DeviceUpdates {
        let mut updates = DeviceUpdates::default();
        updates
            .data
            .insert("0_ac".to_string(), samples.to_vec());
        updates.data.insert("0_dc".to_string(), samples.to_vec());
        updates
    }

    #[test]
    fn test_pipeline_output_reaches_outbound_stream() {
        let device = ScriptedDevice::new(1, Vec::new());
        let update_queue = device.update_queue();
        let (mut engine, handle, out_rx) = engine_with_device(device);

        let engine_thread = thread::spawn(move || engine.run());

        let info = handle
            .add_pipeline(vec![
                serde_json::json!("0_ac"),
                serde_json::json!({"name": "RescalingFilter", "offset": 0.0, "multiplier": 2.0}),
            ])
            .unwrap();
        assert_eq!(info.steps.len(), 2);

        // Feed two ticks worth of samples after the pipeline exists.
        {
            let mut queue = update_queue.lock();
            queue.push_back(data_update(&[1.0, 2.0]));
            queue.push_back(data_update(&[3.0]));
        }

        // Let a few ticks pass, then stop.
        thread::sleep(Duration::from_millis(100));
        handle.shutdown();
        engine_thread.join().unwrap();

        let mut saw_pipeline_output = false;
        while let Ok(event) = out_rx.try_recv() {
            if let OutboundEvent::Message(Value::Object(map)) = event {
                for (key, value) in &map {
                    if key != "deviceState" && value.is_array() {
                        saw_pipeline_output = true;
                        let samples: Vec<f64> = value
                            .as_array()
                            .unwrap()
                            .iter()
                            .filter_map(Value::as_f64)
                            .collect();
                        assert!(samples == vec![2.0, 4.0] || samples == vec![6.0]);
                    }
                }
            }
        }
        assert!(saw_pipeline_output);
    }

    #[test]
    fn test_reset_clears_buffers_and_reports_time() {
        let mut reset = DeviceUpdates::default();
        reset.was_reset = true;

        let device = ScriptedDevice::new(1, vec![data_update(&[1.0, 2.0]), reset]);
        let (mut engine, handle, out_rx) = engine_with_device(device);

        let buffer = match engine.registry.get("0_ac").unwrap() {
            PublishedHandle::Buffer(buffer) => buffer,
            _ => unreachable!(),
        };

        let engine_thread = thread::spawn(move || engine.run());
        thread::sleep(Duration::from_millis(80));
        handle.shutdown();
        engine_thread.join().unwrap();

        // The reset on tick 2 wiped tick 1's samples.
        assert_eq!(buffer.lock().cache_end(), 0);

        let mut saw_reset_event = false;
        while let Ok(event) = out_rx.try_recv() {
            if let OutboundEvent::Message(Value::Object(map)) = event {
                if let Some(Value::Array(events)) = map.get("deviceState") {
                    if events.iter().any(|e| e.get("lastResetTime").is_some()) {
                        saw_reset_event = true;
                    }
                }
            }
        }
        assert!(saw_reset_event);
    }

    #[test]
    fn test_missed_tick_does_not_cause_catchup_burst() {
        let mut device = ScriptedDevice::new(1, Vec::new());
        device.block_on_tick = Some((5, Duration::from_millis(30)));
        let collect_times = device.collect_times.clone();

        let (mut engine, handle, _out_rx) = engine_with_device(device);

        let engine_thread = thread::spawn(move || engine.run());
        thread::sleep(Duration::from_millis(150));
        handle.shutdown();
        engine_thread.join().unwrap();

        let times = collect_times.lock();
        assert!(times.len() >= 10, "only {} ticks ran", times.len());

        // After the stalled tick the schedule resets to "now": following
        // ticks resume on the nominal cadence with no back-to-back burst.
        for i in 7..times.len().min(12) {
            let interval = times[i].duration_since(times[i - 1]);
            assert!(
                interval >= Duration::from_millis(4),
                "catch-up burst: tick {i} came {interval:?} after tick {}",
                i - 1
            );
        }
    }

    #[test]
    fn test_module_payloads_reach_module_stream() {
        let device = ScriptedDevice::new(1, Vec::new());
        let (mut engine, handle, out_rx) = engine_with_device(device);
        engine.register_module(Box::new(crate::module::StimModule::new()));

        let engine_thread = thread::spawn(move || engine.run());
        thread::sleep(Duration::from_millis(80));
        handle.shutdown();
        engine_thread.join().unwrap();

        // The module ran on every tick and its payloads went out on the
        // module-named stream, in tick order.
        let mut payloads = Vec::new();
        while let Ok(event) = out_rx.try_recv() {
            if let OutboundEvent::Module { name, payload } = event {
                assert_eq!(name, "Stim");
                payloads.push(payload.as_u64().unwrap());
            }
        }

        assert!(payloads.len() >= 3, "only {} module events", payloads.len());
        for (i, &payload) in payloads.iter().enumerate() {
            assert_eq!(payload, i as u64 + 1);
        }
    }

    #[test]
    fn test_module_command_routing() {
        let device = ScriptedDevice::new(1, Vec::new());
        let (mut engine, handle, _out_rx) = engine_with_device(device);
        engine.register_module(Box::new(crate::module::StimModule::new()));

        let engine_thread = thread::spawn(move || engine.run());

        handle
            .module_command("Stim", serde_json::json!({"enabled": true}))
            .unwrap();

        assert!(matches!(
            handle.module_command("Imaginary", Value::Null),
            Err(EngineError::UnknownModule(_))
        ));

        handle.shutdown();
        engine_thread.join().unwrap();
    }

    #[test]
    fn test_delete_pipeline_unknown_id_errors() {
        let device = ScriptedDevice::new(1, Vec::new());
        let (mut engine, handle, _out_rx) = engine_with_device(device);

        let engine_thread = thread::spawn(move || engine.run());

        let info = handle
            .add_pipeline(vec![serde_json::json!("0_ac")])
            .unwrap();
        assert_eq!(info.steps.len(), 1);

        handle.delete_pipeline(info.id).unwrap();
        assert!(matches!(
            handle.delete_pipeline(info.id),
            Err(EngineError::UnknownPipeline(_))
        ));

        handle.shutdown();
        engine_thread.join().unwrap();
    }

    #[test]
    fn test_unknown_device_rejected() {
        let device = ScriptedDevice::new(1, Vec::new());
        let (mut engine, handle, _out_rx) = engine_with_device(device);

        let engine_thread = thread::spawn(move || engine.run());

        assert!(matches!(
            handle.connect_to_device("Imaginary"),
            Err(EngineError::UnknownDevice(_))
        ));

        handle.shutdown();
        engine_thread.join().unwrap();
    }
}
