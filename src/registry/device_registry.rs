//! Live mapping from device file name to attached device
//!
//! The registry is the only owner of attached devices. It reacts to
//! [`DeviceFileEvent`]s from the watcher, to devices reporting themselves
//! lost and to commands from the daemon (program replacement, reports).
//! Opening and validating a candidate is delegated to a [`DeviceFactory`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::capabilities::Capabilities;
use crate::device::device_handle::{DeviceCommand, DeviceHandle, DeviceLost, DeviceSetup};
use crate::device::DeviceError;
use crate::output::OutputSink;
use crate::registry::watcher::DeviceFileEvent;
use crate::script::ScriptSettings;

/// A device owned by the registry
pub trait AttachedDevice {
    /// Resets the device's script environment with `program`
    fn load_program(&self, program: Option<Arc<str>>) -> Result<(), DeviceError>;

    fn report(&self) -> Result<(), DeviceError>;
}

/// Parameters of one attachment attempt
#[derive(Clone, Debug)]
pub struct Attach {
    pub path: PathBuf,
    pub generation: u64,
    pub program: Option<Arc<str>>,
}

/// Opens and validates candidate device files
pub trait DeviceFactory {
    type Device: AttachedDevice;

    /// `Ok(None)` means the file is not a controllable device
    fn open(&self, name: &str, attach: Attach) -> Result<Option<Self::Device>, DeviceError>;
}

/// Commands accepted by a running registry
#[derive(Clone, Debug)]
pub enum RegistryCommand {
    /// Replace the active program on every device and for future ones
    LoadProgram(Option<Arc<str>>),
    /// Log every attached device
    Report,
}

impl AttachedDevice for DeviceHandle {
    fn load_program(&self, program: Option<Arc<str>>) -> Result<(), DeviceError> {
        self.send(DeviceCommand::LoadProgram(program))
    }

    fn report(&self) -> Result<(), DeviceError> {
        self.send(DeviceCommand::Report)
    }
}

/// Opens real evdev nodes and runs each on its own thread
pub struct EvdevDeviceFactory {
    sink: Arc<dyn OutputSink>,
    settings: ScriptSettings,
    lost: mpsc::UnboundedSender<DeviceLost>,
}

impl EvdevDeviceFactory {
    pub fn new(
        sink: Arc<dyn OutputSink>,
        settings: ScriptSettings,
        lost: mpsc::UnboundedSender<DeviceLost>,
    ) -> Self {
        Self {
            sink,
            settings,
            lost,
        }
    }
}

impl DeviceFactory for EvdevDeviceFactory {
    type Device = DeviceHandle;

    fn open(&self, name: &str, attach: Attach) -> Result<Option<DeviceHandle>, DeviceError> {
        let device = evdev::Device::open(&attach.path)
            .map_err(|e| DeviceError::Open(attach.path.display().to_string(), e.to_string()))?;

        let Some(capabilities) = Capabilities::query(&device) else {
            debug!(
                "{} ({}) is not a controllable device",
                name,
                device.name().unwrap_or("unnamed")
            );
            return Ok(None);
        };
        info!(
            "{} is '{}'",
            name,
            device.name().unwrap_or("unnamed device")
        );

        let setup = DeviceSetup {
            sink: self.sink.clone(),
            settings: self.settings,
            program: attach.program,
            generation: attach.generation,
            lost: self.lost.clone(),
        };
        DeviceHandle::spawn(name, device, capabilities, setup).map(Some)
    }
}

struct Entry<D> {
    device: D,
    generation: u64,
    attached_at: DateTime<Local>,
}

pub struct DeviceRegistry<F: DeviceFactory> {
    factory: F,
    directory: PathBuf,
    devices: HashMap<String, Entry<F::Device>>,
    program: Option<Arc<str>>,
    next_generation: u64,
}

impl<F: DeviceFactory> DeviceRegistry<F> {
    pub fn new(factory: F, directory: impl Into<PathBuf>, program: Option<Arc<str>>) -> Self {
        Self {
            factory,
            directory: directory.into(),
            devices: HashMap::new(),
            program,
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&F::Device> {
        self.devices.get(name).map(|entry| &entry.device)
    }

    /// Names of the attached devices, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn program(&self) -> Option<&Arc<str>> {
        self.program.as_ref()
    }

    pub fn apply(&mut self, event: DeviceFileEvent) {
        match event {
            DeviceFileEvent::Appeared(name) => self.attach(name),
            DeviceFileEvent::Disappeared(name) => self.detach(&name),
        }
    }

    fn attach(&mut self, name: String) {
        if self.devices.contains_key(&name) {
            debug!("{} is already attached", name);
            return;
        }

        self.next_generation += 1;
        let attach = Attach {
            path: self.directory.join(&name),
            generation: self.next_generation,
            program: self.program.clone(),
        };

        match self.factory.open(&name, attach) {
            Ok(Some(device)) => {
                let entry = Entry {
                    device,
                    generation: self.next_generation,
                    attached_at: Local::now(),
                };
                self.devices.insert(name, entry);
                info!("{} device(s) attached", self.devices.len());
            }
            Ok(None) => {}
            // The file may be gone already, or not accessible to us
            Err(e) => warn!("Skipping {}: {}", name, e),
        }
    }

    fn detach(&mut self, name: &str) {
        match self.devices.remove(name) {
            Some(_) => info!("Device {} removed", name),
            None => debug!("{} was not attached", name),
        }
    }

    /// Forgets a device whose thread stopped on its own
    pub fn device_lost(&mut self, lost: DeviceLost) {
        let current = self
            .devices
            .get(&lost.name)
            .is_some_and(|entry| entry.generation == lost.generation);
        if current {
            self.detach(&lost.name);
        } else {
            debug!("Ignoring stale loss report for {}", lost.name);
        }
    }

    pub fn execute(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::LoadProgram(program) => {
                info!("Loading new program on {} device(s)", self.devices.len());
                self.program = program;
                for (name, entry) in &self.devices {
                    if let Err(e) = entry.device.load_program(self.program.clone()) {
                        warn!("Could not reload {}: {}", name, e);
                    }
                }
            }
            RegistryCommand::Report => {
                info!(
                    "{} device(s) attached from {}",
                    self.devices.len(),
                    self.directory.display()
                );
                for name in self.names() {
                    if let Some(entry) = self.devices.get(&name) {
                        info!(
                            "  {} since {}",
                            name,
                            entry.attached_at.format("%Y-%m-%d %H:%M:%S")
                        );
                        if let Err(e) = entry.device.report() {
                            warn!("{}", e);
                        }
                    }
                }
            }
        }
    }

    /// Runs until `shutdown` fires or every input channel is closed
    pub async fn run(
        mut self,
        mut files: mpsc::UnboundedReceiver<DeviceFileEvent>,
        mut lost: mpsc::UnboundedReceiver<DeviceLost>,
        mut commands: mpsc::UnboundedReceiver<RegistryCommand>,
        shutdown: CancellationToken,
    ) {
        info!("Device registry running");

        loop {
            // File events are handled before commands queued after them
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = files.recv() => self.apply(event),
                Some(report) = lost.recv() => self.device_lost(report),
                Some(command) = commands.recv() => self.execute(command),
                else => break,
            }
        }

        let count = self.devices.len();
        self.devices.clear();
        info!("Device registry stopped, released {} device(s)", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    /// Shared view of what the fake factory has handed out
    #[derive(Default)]
    struct Log {
        opened: Vec<String>,
        attached_with: Vec<(String, Option<String>)>,
        programs: Vec<(String, Option<String>)>,
    }

    struct FakeDevice {
        name: String,
        log: Rc<RefCell<Log>>,
    }

    impl AttachedDevice for FakeDevice {
        fn load_program(&self, program: Option<Arc<str>>) -> Result<(), DeviceError> {
            self.log
                .borrow_mut()
                .programs
                .push((self.name.clone(), program.map(|p| p.to_string())));
            Ok(())
        }

        fn report(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    /// Files that are "present" and whether they pass validation
    struct FakeFactory {
        present: Rc<RefCell<HashSet<String>>>,
        controllable: HashSet<String>,
        log: Rc<RefCell<Log>>,
    }

    impl DeviceFactory for FakeFactory {
        type Device = FakeDevice;

        fn open(&self, name: &str, attach: Attach) -> Result<Option<FakeDevice>, DeviceError> {
            if !self.present.borrow().contains(name) {
                return Err(DeviceError::Open(
                    attach.path.display().to_string(),
                    "No such file or directory".into(),
                ));
            }
            let mut log = self.log.borrow_mut();
            log.opened.push(name.to_string());
            if self.controllable.contains(name) {
                log.attached_with
                    .push((name.to_string(), attach.program.map(|p| p.to_string())));
            }
            Ok(self.controllable.contains(name).then(|| FakeDevice {
                name: name.to_string(),
                log: self.log.clone(),
            }))
        }
    }

    fn registry(controllable: &[&str]) -> (DeviceRegistry<FakeFactory>, Rc<RefCell<HashSet<String>>>, Rc<RefCell<Log>>) {
        let present = Rc::new(RefCell::new(HashSet::new()));
        let log = Rc::new(RefCell::new(Log::default()));
        let factory = FakeFactory {
            present: present.clone(),
            controllable: controllable.iter().map(|s| s.to_string()).collect(),
            log: log.clone(),
        };
        (
            DeviceRegistry::new(factory, "/dev/input", Some(Arc::from("-- program"))),
            present,
            log,
        )
    }

    fn appeared(name: &str) -> DeviceFileEvent {
        DeviceFileEvent::Appeared(name.to_string())
    }

    fn disappeared(name: &str) -> DeviceFileEvent {
        DeviceFileEvent::Disappeared(name.to_string())
    }

    #[test]
    fn test_live_set_matches_present_and_valid_files() {
        let (mut registry, present, _log) = registry(&["event0", "event2"]);

        // Startup scan and notifications overlap; removal races an open
        present.borrow_mut().extend(["event0", "event1", "event2"].map(String::from));
        let events = [
            appeared("event0"),
            appeared("event1"),
            appeared("event0"),
            appeared("event2"),
            disappeared("event9"),
            appeared("event2"),
        ];
        events.into_iter().for_each(|e| registry.apply(e));
        assert_eq!(registry.names(), vec!["event0", "event2"]);

        present.borrow_mut().remove("event2");
        registry.apply(disappeared("event2"));
        registry.apply(appeared("event2"));
        registry.apply(disappeared("event2"));
        assert_eq!(registry.names(), vec!["event0"]);

        registry.apply(disappeared("event1"));
        registry.apply(disappeared("event0"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_appearance_opens_once() {
        let (mut registry, present, log) = registry(&["event4"]);
        present.borrow_mut().insert("event4".into());

        registry.apply(appeared("event4"));
        registry.apply(appeared("event4"));
        assert_eq!(log.borrow().opened, vec!["event4"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_loss_report_is_ignored() {
        let (mut registry, present, _log) = registry(&["event1"]);
        present.borrow_mut().insert("event1".into());

        registry.apply(appeared("event1"));
        registry.apply(disappeared("event1"));
        registry.apply(appeared("event1"));

        registry.device_lost(DeviceLost {
            name: "event1".into(),
            generation: 1,
        });
        assert!(registry.contains("event1"));

        registry.device_lost(DeviceLost {
            name: "event1".into(),
            generation: 2,
        });
        assert!(!registry.contains("event1"));
    }

    #[test]
    fn test_program_reaches_current_and_future_devices() {
        let (mut registry, present, log) = registry(&["event0", "event1"]);
        present.borrow_mut().extend(["event0", "event1"].map(String::from));

        registry.apply(appeared("event0"));
        registry.execute(RegistryCommand::LoadProgram(Some(Arc::from("-- v2"))));
        assert_eq!(
            log.borrow().programs,
            vec![("event0".to_string(), Some("-- v2".to_string()))]
        );
        assert_eq!(registry.program().map(|p| &**p), Some("-- v2"));

        registry.execute(RegistryCommand::LoadProgram(None));
        assert!(registry.program().is_none());
        registry.apply(appeared("event1"));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            log.borrow().attached_with,
            vec![
                ("event0".to_string(), Some("-- program".to_string())),
                ("event1".to_string(), None),
            ]
        );
    }
}
