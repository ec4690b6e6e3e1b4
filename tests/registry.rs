//! Registry event loop with an in-memory device factory

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use joyprog::device::device_handle::DeviceLost;
use joyprog::device::DeviceError;
use joyprog::registry::device_registry::Attach;
use joyprog::registry::{
    AttachedDevice, DeviceFactory, DeviceFileEvent, DeviceRegistry, RegistryCommand,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Journal {
    live: HashSet<String>,
    reloads: usize,
}

struct FakeDevice {
    name: String,
    journal: Arc<Mutex<Journal>>,
}

impl AttachedDevice for FakeDevice {
    fn load_program(&self, _program: Option<Arc<str>>) -> Result<(), DeviceError> {
        self.journal.lock().unwrap().reloads += 1;
        Ok(())
    }

    fn report(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.journal.lock().unwrap().live.remove(&self.name);
    }
}

struct FakeFactory {
    journal: Arc<Mutex<Journal>>,
}

impl DeviceFactory for FakeFactory {
    type Device = FakeDevice;

    fn open(&self, name: &str, _attach: Attach) -> Result<Option<FakeDevice>, DeviceError> {
        if name == "event-keyboard-less" {
            return Ok(None);
        }
        self.journal.lock().unwrap().live.insert(name.to_string());
        Ok(Some(FakeDevice {
            name: name.to_string(),
            journal: self.journal.clone(),
        }))
    }
}

#[tokio::test]
async fn registry_releases_everything_on_shutdown() {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let registry = DeviceRegistry::new(
        FakeFactory {
            journal: journal.clone(),
        },
        "/dev/input",
        None,
    );

    let (file_tx, file_rx) = mpsc::unbounded_channel();
    let (lost_tx, lost_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(registry.run(file_rx, lost_rx, command_rx, shutdown.clone()));

    for name in ["event0", "event1", "event-keyboard-less", "event0"] {
        file_tx.send(DeviceFileEvent::Appeared(name.into())).unwrap();
    }
    file_tx.send(DeviceFileEvent::Disappeared("event1".into())).unwrap();
    lost_tx
        .send(DeviceLost {
            name: "event0".into(),
            generation: 99,
        })
        .unwrap();
    command_tx
        .send(RegistryCommand::LoadProgram(Some(Arc::from("-- new"))))
        .unwrap();
    command_tx.send(RegistryCommand::Report).unwrap();

    // Let the registry drain its queues before stopping it
    while journal.lock().unwrap().reloads == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        journal.lock().unwrap().live,
        HashSet::from(["event0".to_string()])
    );

    shutdown.cancel();
    task.await.unwrap();
    assert!(journal.lock().unwrap().live.is_empty());
}
