//! OpenMEA device front: four 16-channel chips streaming on UDP ports
//! 5051-5054, with DC sampling and stimulation support.

use serde_json::Value;

use crate::config::DeviceConfig;
use crate::device::controller::{
    parse_openmea_status, ControllerHandle, ControllerProfile, DeviceController,
};
use crate::device::transport::CommandTransport;
use crate::device::udp::UdpDataReceiver;
use crate::device::{Device, DeviceStateEvent, DeviceUpdates};
use crate::electrode::DeviceProps;
use crate::error::Result;

pub const OPENMEA_NUM_ELECTRODES: usize = 64;

const UDP_PORTS: [u16; 4] = [5051, 5052, 5053, 5054];
const CHANNELS_PER_PORT: usize = 16;
const DWORDS_PER_BATCH: usize = 20;

const PROFILE: ControllerProfile = ControllerProfile {
    start_sampling_command: "start",
    stop_sampling_command: "stop",
    sample_duration_command: "sampledur",
    supports_stimulation: true,
    parse_status: parse_openmea_status,
};

/// Electrode number at each position of the 8x8 grid; the corners hold no
/// electrode.
const ELECTRODE_MAP: [Option<usize>; 64] = [
    None,       Some(0x3e), Some(0x3c), Some(0x39), Some(0x36), Some(0x33), Some(0x31), None,
    Some(0x02), Some(0x01), Some(0x3d), Some(0x38), Some(0x37), Some(0x32), Some(0x2e), Some(0x2d),
    Some(0x04), Some(0x03), Some(0x00), Some(0x3a), Some(0x35), Some(0x30), Some(0x2c), Some(0x2b),
    Some(0x07), Some(0x06), Some(0x05), Some(0x3b), Some(0x34), Some(0x2a), Some(0x29), Some(0x28),
    Some(0x08), Some(0x09), Some(0x0a), Some(0x14), Some(0x1b), Some(0x25), Some(0x26), Some(0x27),
    Some(0x0b), Some(0x0c), Some(0x10), Some(0x15), Some(0x1a), Some(0x20), Some(0x23), Some(0x24),
    Some(0x0d), Some(0x0e), Some(0x12), Some(0x17), Some(0x18), Some(0x1d), Some(0x21), Some(0x22),
    None,       Some(0x11), Some(0x13), Some(0x16), Some(0x19), Some(0x1c), Some(0x1e), None,
];

fn device_props() -> DeviceProps {
    let electrode_map = ELECTRODE_MAP.to_vec();
    let electrode_names =
        DeviceProps::grid_names(OPENMEA_NUM_ELECTRODES, 8, &electrode_map);

    DeviceProps {
        name: "OpenMEA",
        can_control_replay: false,
        can_control_sampling: true,
        can_record_to_file: true,
        can_stimulate: true,
        can_sample_dc: true,
        num_electrodes: OPENMEA_NUM_ELECTRODES,
        num_electrode_rows: 8,
        electrode_map,
        electrode_exists: (0..OPENMEA_NUM_ELECTRODES).map(|i| i % 16 != 0).collect(),
        electrode_names,
    }
}

pub struct OpenMeaDevice {
    props: DeviceProps,
    receiver: UdpDataReceiver,
    controller: ControllerHandle,
    sent_device_config: bool,
    is_closed: bool,
}

impl OpenMeaDevice {
    pub fn attach(config: DeviceConfig, transport: Box<dyn CommandTransport>) -> Result<Self> {
        let receiver =
            UdpDataReceiver::new(&UDP_PORTS, CHANNELS_PER_PORT, DWORDS_PER_BATCH, true)?;
        let controller = DeviceController::spawn(config, PROFILE, transport);

        Ok(Self {
            props: device_props(),
            receiver,
            controller,
            sent_device_config: false,
            is_closed: false,
        })
    }
}

impl Device for OpenMeaDevice {
    fn name(&self) -> &'static str {
        "OpenMEA"
    }

    fn num_electrodes(&self) -> usize {
        OPENMEA_NUM_ELECTRODES
    }

    fn properties(&self) -> &DeviceProps {
        &self.props
    }

    fn collect_updates(&mut self) -> DeviceUpdates {
        if self.is_closed {
            return DeviceUpdates::default();
        }

        let mut updates = DeviceUpdates {
            data: self.receiver.collect_data(),
            ..DeviceUpdates::default()
        };

        if !self.sent_device_config {
            self.sent_device_config = true;
            updates.state.push(DeviceStateEvent {
                device_props: serde_json::to_value(&self.props).ok(),
                ..DeviceStateEvent::default()
            });
        }

        updates.state.extend(self.controller.drain_state());
        updates
    }

    fn run_command(&self, msg: Value) {
        if self.is_closed {
            return;
        }

        self.controller.send_command(msg);
    }

    fn close(&mut self) {
        self.is_closed = true;
        self.receiver.close();
        self.controller.close();
    }
}
