pub mod capabilities;
pub mod control;
pub mod device_handle;
pub mod joystick;
pub mod state;

pub use capabilities::{AxisRange, Capabilities};
pub use control::{Control, ControlEvent, ControlId, ControlKind};
pub use device_handle::{DeviceCommand, DeviceHandle};
pub use joystick::Joystick;

use crate::script::ScriptError;

// Device errors
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to open {0}: {1}")]
    Open(String, String),

    #[error("Script environment error: {0}")]
    Script(#[from] ScriptError),

    #[error("Failed to start device thread: {0}")]
    Thread(String),

    #[error("Device {0} is no longer running")]
    Stopped(String),
}
