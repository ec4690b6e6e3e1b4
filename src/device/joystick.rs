//! Device core without I/O
//!
//! A [`Joystick`] owns the controls built from a capability set and the
//! script environment bound to them. It is driven by whoever owns the real
//! device handle: physical events go in through [`Joystick::handle_event`],
//! suspended executions are resumed through [`Joystick::resume_due`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};

use crate::device::capabilities::{AxisRange, Capabilities};
use crate::device::control::{ControlEvent, ControlId, ControlSet, ControlState};
use crate::device::state::DeviceState;
use crate::device::DeviceError;
use crate::output::OutputSink;
use crate::script::{ExecutionId, ScriptEnvironment, ScriptError, ScriptSettings, Started};

pub struct Joystick {
    name: String,
    state: Rc<RefCell<DeviceState>>,
    environment: ScriptEnvironment,
}

impl Joystick {
    pub fn new(
        name: &str,
        capabilities: &Capabilities,
        sink: Arc<dyn OutputSink>,
        settings: ScriptSettings,
    ) -> Result<Self, DeviceError> {
        let controls = ControlSet::from_capabilities(capabilities);
        info!(
            "Device {}: {} keys, {} absolute axes",
            name,
            capabilities.key_codes().count(),
            capabilities.axis_codes().count()
        );

        let state = Rc::new(RefCell::new(DeviceState::new(controls)));
        let environment = ScriptEnvironment::new(name, state.clone(), sink, settings)?;

        Ok(Self {
            name: name.to_string(),
            state,
            environment,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records a physical event and starts the bound handler on a transition
    ///
    /// Events for controls the device never declared are dropped.
    pub fn handle_event(&mut self, event: ControlEvent, now: Instant) -> Option<Started> {
        let transition = {
            let mut state = self.state.borrow_mut();
            match state.controls.get_mut(event.control) {
                Some(control) => control.record(event.value),
                None => {
                    trace!("{}: ignoring event for undeclared {}", self.name, event.control);
                    return None;
                }
            }
        };

        if !transition {
            return None;
        }
        self.environment.fire(event, now)
    }

    /// Replaces the program; `None` leaves an empty environment
    pub fn load_program(&mut self, program: Option<&str>, now: Instant) -> Result<(), ScriptError> {
        self.environment.reset(program, now)
    }

    pub fn resume_due(&mut self, now: Instant) -> usize {
        self.environment.resume_due(now)
    }

    pub fn next_wake(&self) -> Option<Instant> {
        self.environment.next_wake()
    }

    pub fn live_executions(&self) -> usize {
        self.environment.live_executions()
    }

    pub fn has_control(&self, control: ControlId) -> bool {
        self.state.borrow().controls.get(control).is_some()
    }

    pub fn controls(&self) -> Vec<ControlId> {
        let mut ids = self.state.borrow().controls.ids();
        ids.sort();
        ids
    }

    /// `None` if the device has no such key
    pub fn is_key_pressed(&self, code: u16) -> Option<bool> {
        self.state.borrow().controls.key(code).map(|key| key.is_pressed())
    }

    /// `None` if the device has no such axis
    pub fn axis(&self, code: u16) -> Option<AxisRange> {
        match self.state.borrow().controls.axis(code).map(|axis| axis.state()) {
            Some(ControlState::Axis(range)) => Some(range),
            _ => None,
        }
    }

    /// Live executions of `control` in trigger order
    pub fn executions_of(&self, control: ControlId) -> Vec<ExecutionId> {
        self.state
            .borrow()
            .controls
            .get(control)
            .map(|c| c.executions().to_vec())
            .unwrap_or_default()
    }

    pub fn cancel_previous(&mut self, control: ControlId) -> Option<ExecutionId> {
        self.state.borrow_mut().cancel_previous(control)
    }

    pub fn cancel_all_of(&mut self, control: ControlId) -> usize {
        self.state.borrow_mut().cancel_all_of(control)
    }

    pub fn cancel_all(&mut self) -> usize {
        self.state.borrow_mut().cancel_all_of_device()
    }
}

impl Drop for Joystick {
    fn drop(&mut self) {
        // Executions go with the environment, which is dropped right after
        debug!(
            "Tearing down {} with {} live execution(s)",
            self.name,
            self.live_executions()
        );
    }
}
