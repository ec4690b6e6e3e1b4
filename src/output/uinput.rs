//! uinput-backed output device
//!
//! Creates one virtual device that can emit every key code and the usual
//! relative axes. Script actions from all devices funnel through its mutex.

use std::sync::Mutex;

use evdev::{
    uinput::{VirtualDevice, VirtualDeviceBuilder},
    AttributeSet, EventType, InputEvent, Key, RelativeAxisType,
};
use tracing::{debug, info};

use super::{OutputError, OutputSink};
use crate::device::capabilities::KEY_COUNT;

const RELATIVE_AXES: &[RelativeAxisType] = &[
    RelativeAxisType::REL_X,
    RelativeAxisType::REL_Y,
    RelativeAxisType::REL_Z,
    RelativeAxisType::REL_RX,
    RelativeAxisType::REL_RY,
    RelativeAxisType::REL_RZ,
    RelativeAxisType::REL_HWHEEL,
    RelativeAxisType::REL_DIAL,
    RelativeAxisType::REL_WHEEL,
    RelativeAxisType::REL_MISC,
];

pub struct UinputSink {
    device: Mutex<VirtualDevice>,
}

impl UinputSink {
    pub fn create(name: &str) -> Result<Self, OutputError> {
        let mut keys = AttributeSet::<Key>::new();
        (1..KEY_COUNT as u16).for_each(|code| keys.insert(Key::new(code)));

        let mut relative = AttributeSet::<RelativeAxisType>::new();
        RELATIVE_AXES.iter().for_each(|axis| relative.insert(*axis));

        let mut device = VirtualDeviceBuilder::new()
            .map_err(|e| OutputError::CreateDevice(e.to_string()))?
            .name(name)
            .with_keys(&keys)
            .map_err(|e| OutputError::CreateDevice(e.to_string()))?
            .with_relative_axes(&relative)
            .map_err(|e| OutputError::CreateDevice(e.to_string()))?
            .build()
            .map_err(|e| OutputError::CreateDevice(e.to_string()))?;

        match device.enumerate_dev_nodes_blocking() {
            Ok(mut nodes) => {
                if let Some(Ok(path)) = nodes.next() {
                    info!("Output device '{}' available as {}", name, path.display());
                }
            }
            Err(e) => debug!("Could not enumerate output device nodes: {}", e),
        }

        Ok(Self {
            device: Mutex::new(device),
        })
    }

    fn emit(&self, event: InputEvent) -> Result<(), OutputError> {
        let mut device = self.device.lock().map_err(|_| OutputError::Poisoned)?;
        device
            .emit(&[event])
            .map_err(|e| OutputError::Emit(e.to_string()))
    }
}

impl OutputSink for UinputSink {
    fn press_key(&self, code: u16) -> Result<(), OutputError> {
        self.emit(InputEvent::new(EventType::KEY, code, 1))
    }

    fn release_key(&self, code: u16) -> Result<(), OutputError> {
        self.emit(InputEvent::new(EventType::KEY, code, 0))
    }

    fn move_relative(&self, code: u16, delta: i32) -> Result<(), OutputError> {
        self.emit(InputEvent::new(EventType::RELATIVE, code, delta))
    }
}
