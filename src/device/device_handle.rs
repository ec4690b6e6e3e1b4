//! Threaded driver for one attached device
//!
//! Each device gets its own OS thread running a current-thread tokio
//! runtime. The loop multiplexes the evdev event stream, the earliest wake
//! time of a suspended execution, commands from the registry and shutdown.
//! The [`Joystick`] and its interpreter never leave that thread.

use std::sync::Arc;
use std::time::Instant;

use evdev::{Device, EventStream, InputEvent, InputEventKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::capabilities::Capabilities;
use crate::device::control::ControlEvent;
use crate::device::joystick::Joystick;
use crate::device::DeviceError;
use crate::output::OutputSink;
use crate::script::ScriptSettings;

/// Requests the registry sends to a running device
#[derive(Clone, Debug)]
pub enum DeviceCommand {
    /// Reset the script environment, optionally running a new program
    LoadProgram(Option<Arc<str>>),
    /// Log the live executions of the device
    Report,
}

/// Sent by a device thread whose device stopped delivering events
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLost {
    pub name: String,
    /// Identifies the attachment, so a stale report cannot remove a newer one
    pub generation: u64,
}

/// Everything a device thread needs besides the device itself
#[derive(Clone)]
pub struct DeviceSetup {
    pub sink: Arc<dyn OutputSink>,
    pub settings: ScriptSettings,
    pub program: Option<Arc<str>>,
    pub generation: u64,
    pub lost: mpsc::UnboundedSender<DeviceLost>,
}

pub struct DeviceHandle {
    name: String,
    commands: mpsc::UnboundedSender<DeviceCommand>,
    shutdown: CancellationToken,
}

impl DeviceHandle {
    /// Starts the device thread
    ///
    /// Returns as soon as the thread is running; the program is loaded on
    /// the thread and load errors are only logged.
    pub fn spawn(
        name: &str,
        device: Device,
        capabilities: Capabilities,
        setup: DeviceSetup,
    ) -> Result<Self, DeviceError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let thread_name = name.to_string();
        let thread_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name(format!("device-{}", name))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build runtime for {}: {}", thread_name, e);
                        return;
                    }
                };
                runtime.block_on(run_device(
                    thread_name,
                    device,
                    capabilities,
                    setup,
                    command_rx,
                    thread_shutdown,
                ));
            })
            .map_err(|e| DeviceError::Thread(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            commands,
            shutdown,
        })
    }

    pub fn send(&self, command: DeviceCommand) -> Result<(), DeviceError> {
        self.commands
            .send(command)
            .map_err(|_| DeviceError::Stopped(self.name.clone()))
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        // The thread cleans up on its own; removal never waits for it
        debug!("Signalling shutdown of {}", self.name);
        self.shutdown.cancel();
    }
}

/// Converts a raw input event into a control event, if it targets a key or
/// an absolute axis
pub fn control_event(event: &InputEvent) -> Option<ControlEvent> {
    match event.kind() {
        InputEventKind::Key(key) => Some(ControlEvent::key(key.code(), event.value())),
        InputEventKind::AbsAxis(axis) => Some(ControlEvent::axis(axis.0, event.value())),
        _ => None,
    }
}

async fn run_device(
    name: String,
    device: Device,
    capabilities: Capabilities,
    setup: DeviceSetup,
    mut commands: mpsc::UnboundedReceiver<DeviceCommand>,
    shutdown: CancellationToken,
) {
    let report_lost = |reason: &str| {
        warn!("Lost device {}: {}", name, reason);
        let lost = DeviceLost {
            name: name.clone(),
            generation: setup.generation,
        };
        if setup.lost.send(lost).is_err() {
            debug!("Registry gone, not reporting {}", name);
        }
    };

    let mut joystick = match Joystick::new(&name, &capabilities, setup.sink.clone(), setup.settings)
    {
        Ok(joystick) => joystick,
        Err(e) => {
            report_lost(&e.to_string());
            return;
        }
    };
    if setup.program.is_some() {
        load_program(&name, &mut joystick, setup.program.as_deref());
    }

    let mut events: EventStream = match device.into_event_stream() {
        Ok(stream) => stream,
        Err(e) => {
            report_lost(&e.to_string());
            return;
        }
    };
    info!("Device {} attached", name);

    loop {
        let wake = joystick.next_wake();
        let deadline = tokio::time::Instant::from_std(wake.unwrap_or_else(Instant::now));

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Device {} shutting down", name);
                break;
            }
            command = commands.recv() => match command {
                Some(DeviceCommand::LoadProgram(program)) => {
                    load_program(&name, &mut joystick, program.as_deref());
                }
                Some(DeviceCommand::Report) => {
                    info!(
                        "Device {}: {} live execution(s)",
                        name,
                        joystick.live_executions()
                    );
                }
                None => break,
            },
            event = events.next_event() => match event {
                Ok(event) => {
                    if let Some(event) = control_event(&event) {
                        joystick.handle_event(event, Instant::now());
                    }
                }
                Err(e) => {
                    if !shutdown.is_cancelled() {
                        report_lost(&e.to_string());
                    }
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline), if wake.is_some() => {
                joystick.resume_due(Instant::now());
            }
        }
    }

    // Executions go before the device handle is released
    drop(joystick);
    drop(events);
    info!("Device {} released", name);
}

/// Resets the environment of `joystick`; a program that fails to load
/// leaves it empty
fn load_program(name: &str, joystick: &mut Joystick, program: Option<&str>) {
    if let Err(e) = joystick.load_program(program, Instant::now()) {
        // Already reported by the environment
        debug!("Device {} continues without a program: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::RecordingSink;
    use evdev::{AbsoluteAxisType, EventType, Key};

    #[test]
    fn test_control_event_conversion() {
        let key = InputEvent::new(EventType::KEY, Key::BTN_TRIGGER.code(), 1);
        assert_eq!(
            control_event(&key),
            Some(ControlEvent::key(Key::BTN_TRIGGER.code(), 1))
        );

        let axis = InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_Y.0, -40);
        assert_eq!(
            control_event(&axis),
            Some(ControlEvent::axis(AbsoluteAxisType::ABS_Y.0, -40))
        );

        let sync = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        assert_eq!(control_event(&sync), None);
    }

    #[test]
    fn test_broken_program_leaves_device_running_without_handlers() {
        let caps = Capabilities::from_codes(&[5], &[]);
        let sink = Arc::new(RecordingSink::new());
        let mut joystick =
            Joystick::new("event3", &caps, sink, ScriptSettings::default()).unwrap();

        load_program("event3", &mut joystick, Some("function on_key_5() delay(100) end"));
        assert!(joystick.handle_event(ControlEvent::key(5, 1), Instant::now()).is_some());

        load_program("event3", &mut joystick, Some("function on_key_5("));
        assert_eq!(joystick.live_executions(), 0);
        assert!(joystick.handle_event(ControlEvent::key(5, 0), Instant::now()).is_none());

        load_program("event3", &mut joystick, None);
        assert!(joystick.handle_event(ControlEvent::key(5, 1), Instant::now()).is_none());
    }
}
