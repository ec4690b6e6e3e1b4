//! The sandboxed interpreter of one device
//!
//! A [`ScriptEnvironment`] owns a Lua state with the host table installed
//! and drives the executions registered in the device's [`Runner`]. Every
//! execution is a Lua coroutine; `delay` yields it and the yielded value is
//! turned into a wake time. Nothing here blocks: callers resume due
//! executions by calling [`ScriptEnvironment::resume_due`] with the current
//! time.
//!
//! [`Runner`]: crate::script::runner::Runner

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{Function, Lua, MultiValue, ThreadStatus, Value};
use tracing::{debug, error, info, warn};

use crate::device::control::{ControlEvent, ControlId};
use crate::device::state::DeviceState;
use crate::output::OutputSink;
use crate::script::error::ScriptError;
use crate::script::execution::{ExecutionId, Trigger};
use crate::script::host::{self, HostContext};
use crate::script::runner::{SegmentEnd, SegmentOutcome};

/// Default suspension time of an argument-less `delay`
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScriptSettings {
    /// Suspension time of `delay()` without an argument
    pub delay_unit: Duration,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            delay_unit: DEFAULT_DELAY,
        }
    }
}

/// Result of starting an execution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Started {
    pub id: ExecutionId,
    /// How the first segment ended; `None` if the execution was queued
    pub outcome: Option<SegmentOutcome>,
}

pub struct ScriptEnvironment {
    lua: Lua,
    context: HostContext,
    settings: ScriptSettings,
}

impl ScriptEnvironment {
    pub fn new(
        device: &str,
        state: Rc<RefCell<DeviceState>>,
        sink: Arc<dyn OutputSink>,
        settings: ScriptSettings,
    ) -> Result<Self, ScriptError> {
        let context = HostContext {
            device: Rc::from(device),
            state,
            sink,
        };
        let lua = host::create_interpreter(&context)?;

        Ok(Self {
            lua,
            context,
            settings,
        })
    }

    pub fn settings(&self) -> ScriptSettings {
        self.settings
    }

    /// Number of live executions
    pub fn live_executions(&self) -> usize {
        self.context.state.borrow().runner.len()
    }

    pub fn next_wake(&self) -> Option<Instant> {
        self.context.state.borrow().runner.next_wake()
    }

    /// Replaces the running program with `source`
    pub fn load_program(&mut self, source: &str, now: Instant) -> Result<(), ScriptError> {
        self.reset(Some(source), now)
    }

    /// Cancels everything, starts over with a fresh interpreter and runs
    /// `body` as the startup execution
    ///
    /// If the body fails to compile or its first segment raises, the
    /// environment is left empty and the error is returned.
    pub fn reset(&mut self, body: Option<&str>, now: Instant) -> Result<(), ScriptError> {
        self.clear()?;

        let Some(source) = body else {
            info!("Script environment of {} reset", self.context.device);
            return Ok(());
        };

        match self.run_startup(source, now) {
            Ok(()) => {
                info!("Program loaded on {}", self.context.device);
                Ok(())
            }
            Err(e) => {
                error!("{}: {}", self.context.device, e);
                self.clear()?;
                Err(e)
            }
        }
    }

    fn clear(&mut self) -> Result<(), ScriptError> {
        let discarded = self.context.state.borrow_mut().discard_all();
        if discarded > 0 {
            debug!(
                "Discarded {} live execution(s) of {}",
                discarded, self.context.device
            );
        }
        self.lua = host::create_interpreter(&self.context)?;
        Ok(())
    }

    fn run_startup(&mut self, source: &str, now: Instant) -> Result<(), ScriptError> {
        let chunk = self
            .lua
            .load(source)
            .set_name(format!("={}", self.context.device))
            .into_function()
            .map_err(|e| ScriptError::Load(e.to_string()))?;

        match self.start(None, chunk, None, now)?.outcome {
            Some(SegmentOutcome::Failed(message)) => Err(ScriptError::Startup(message)),
            _ => Ok(()),
        }
    }

    /// Starts the handler bound to the control of `event`, if any
    pub fn fire(&self, event: ControlEvent, now: Instant) -> Option<Started> {
        let handler = self.handler(event.control)?;
        let trigger = Trigger {
            code: event.control.code,
            value: event.value,
        };

        match self.start(Some(event.control), handler, Some(trigger), now) {
            Ok(started) => Some(started),
            Err(e) => {
                warn!("{}: {}", self.context.device, e);
                None
            }
        }
    }

    fn handler(&self, control: ControlId) -> Option<Function> {
        let name = control.handler_name();
        let value: mlua::Result<Value> = self.lua.globals().get(name.as_str());
        match value {
            Ok(Value::Function(handler)) => Some(handler),
            Ok(Value::Nil) => None,
            Ok(other) => {
                warn!(
                    "{} on {} is a {}, not a function",
                    name,
                    self.context.device,
                    other.type_name()
                );
                None
            }
            Err(e) => {
                warn!("Failed to look up {}: {}", name, e);
                None
            }
        }
    }

    /// Registers a new execution of `entry` and runs it up to its first
    /// suspension or completion
    ///
    /// If another execution is running the new one is queued and runs as
    /// soon as the current segment ends.
    pub fn start(
        &self,
        owner: Option<ControlId>,
        entry: Function,
        trigger: Option<Trigger>,
        now: Instant,
    ) -> Result<Started, ScriptError> {
        let thread = self
            .lua
            .create_thread(entry)
            .map_err(|e| ScriptError::Start(e.to_string()))?;

        let (id, queued) = {
            let mut state = self.context.state.borrow_mut();
            let id = state.runner.register(owner, thread, trigger, now);
            let queued = state.runner.is_busy();
            if queued {
                state.runner.enqueue(id);
            }
            (id, queued)
        };
        if queued {
            return Ok(Started { id, outcome: None });
        }

        let outcome = self.run_segment(id, now);
        self.run_ready(now);
        Ok(Started { id, outcome })
    }

    /// Resumes every suspended execution whose wake time is at or before
    /// `now`, earliest first; returns how many were resumed
    pub fn resume_due(&self, now: Instant) -> usize {
        let due = self.context.state.borrow().runner.due(now);
        let mut resumed = 0;
        for id in due {
            // An earlier execution may have cancelled this one
            if self.run_segment(id, now).is_some() {
                resumed += 1;
            }
            self.run_ready(now);
        }
        resumed
    }

    fn run_ready(&self, now: Instant) {
        loop {
            let next = self.context.state.borrow_mut().runner.next_ready();
            let Some(id) = next else {
                break;
            };
            self.run_segment(id, now);
        }
    }

    /// Runs one segment of `id`; `None` if it could not be started
    fn run_segment(&self, id: ExecutionId, now: Instant) -> Option<SegmentOutcome> {
        let (thread, trigger) = self.context.state.borrow_mut().runner.begin(id)?;

        let result: mlua::Result<MultiValue> = match trigger {
            Some(trigger) => thread.resume((trigger.code, trigger.value)),
            None => thread.resume(()),
        };

        let end = match result {
            Ok(values) if matches!(thread.status(), ThreadStatus::Resumable) => SegmentEnd::Yielded {
                delay: self.delay_of(values),
            },
            Ok(_) => SegmentEnd::Completed,
            Err(e) => SegmentEnd::Failed(e.to_string()),
        };

        let outcome = self.context.state.borrow_mut().finish_segment(id, end, now);
        if let SegmentOutcome::Failed(message) = &outcome {
            warn!(
                "Execution {} on {} aborted: {}",
                id, self.context.device, message
            );
        }
        Some(outcome)
    }

    fn delay_of(&self, values: MultiValue) -> Duration {
        match values.into_iter().next() {
            None | Some(Value::Nil) => self.settings.delay_unit,
            Some(Value::Integer(ms)) if ms >= 0 => Duration::from_millis(ms as u64),
            Some(Value::Number(ms)) if ms.is_finite() && ms >= 0.0 => {
                Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
            }
            Some(other) => {
                warn!(
                    "delay called with an invalid duration ({}), using {:?}",
                    other.type_name(),
                    self.settings.delay_unit
                );
                self.settings.delay_unit
            }
        }
    }
}

impl Drop for ScriptEnvironment {
    fn drop(&mut self) {
        let discarded = self.context.state.borrow_mut().discard_all();
        if discarded > 0 {
            debug!(
                "Dropped {} live execution(s) with the environment of {}",
                discarded, self.context.device
            );
        }
    }
}
