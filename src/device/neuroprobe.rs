//! Neuroprobe device front: one 18-channel probe streaming on UDP port
//! 5052. AC only; samples still arrive on 20-dword batch boundaries.

use serde_json::Value;

use crate::config::DeviceConfig;
use crate::device::controller::{
    parse_neuroprobe_status, ControllerHandle, ControllerProfile, DeviceController,
};
use crate::device::transport::CommandTransport;
use crate::device::udp::UdpDataReceiver;
use crate::device::{Device, DeviceStateEvent, DeviceUpdates};
use crate::electrode::DeviceProps;
use crate::error::Result;

pub const NEUROPROBE_NUM_ELECTRODES: usize = 18;

const UDP_PORTS: [u16; 1] = [5052];
const DWORDS_PER_BATCH: usize = 20;

const PROFILE: ControllerProfile = ControllerProfile {
    start_sampling_command: "rhd_sample_en",
    stop_sampling_command: "rhd_sample_dis",
    sample_duration_command: "rhd_sample_dur",
    supports_stimulation: false,
    parse_status: parse_neuroprobe_status,
};

const ELECTRODE_MAP: [usize; 18] = [17, 0, 8, 9, 16, 1, 7, 10, 15, 2, 6, 11, 14, 3, 5, 12, 13, 4];

fn device_props() -> DeviceProps {
    DeviceProps {
        name: "Neuroprobe",
        can_control_replay: false,
        can_control_sampling: true,
        can_record_to_file: true,
        can_stimulate: true,
        can_sample_dc: false,
        num_electrodes: NEUROPROBE_NUM_ELECTRODES,
        num_electrode_rows: 9,
        electrode_map: ELECTRODE_MAP.iter().copied().map(Some).collect(),
        electrode_exists: vec![true; NEUROPROBE_NUM_ELECTRODES],
        electrode_names: (8..26).map(|n| Some(n.to_string())).collect(),
    }
}

pub struct NeuroprobeDevice {
    props: DeviceProps,
    receiver: UdpDataReceiver,
    controller: ControllerHandle,
    sent_device_config: bool,
    is_closed: bool,
}

impl NeuroprobeDevice {
    pub fn attach(config: DeviceConfig, transport: Box<dyn CommandTransport>) -> Result<Self> {
        let receiver = UdpDataReceiver::new(
            &UDP_PORTS,
            NEUROPROBE_NUM_ELECTRODES,
            DWORDS_PER_BATCH,
            false,
        )?;
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

impl Device for NeuroprobeDevice {
    fn name(&self) -> &'static str {
        "Neuroprobe"
    }

    fn num_electrodes(&self) -> usize {
        NEUROPROBE_NUM_ELECTRODES
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
