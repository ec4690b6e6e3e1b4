pub mod device_registry;
pub mod watcher;

pub use device_registry::{
    AttachedDevice, DeviceFactory, DeviceRegistry, EvdevDeviceFactory, RegistryCommand,
};
pub use watcher::{DeviceFileEvent, DeviceWatcher, WatchError};
