//! Mutable state shared between a device and its script environment
//!
//! Host functions, the runner loop and the device's event handling all go
//! through [`DeviceState`], which keeps the runner registry and every
//! control's live-execution list consistent with each other.

use std::time::Instant;

use tracing::debug;

use crate::device::control::{ControlId, ControlSet};
use crate::script::execution::ExecutionId;
use crate::script::runner::{CancelOutcome, Runner, SegmentEnd, SegmentOutcome};

#[derive(Debug)]
pub struct DeviceState {
    pub controls: ControlSet,
    pub runner: Runner,
}

impl DeviceState {
    pub fn new(controls: ControlSet) -> Self {
        Self {
            controls,
            runner: Runner::new(),
        }
    }

    /// Closes a run segment and keeps the owner's live list in sync
    ///
    /// An execution joins its control's list only once its first segment
    /// suspends, so cancellations issued during that segment never hit it.
    pub fn finish_segment(
        &mut self,
        id: ExecutionId,
        end: SegmentEnd,
        now: Instant,
    ) -> SegmentOutcome {
        let owner = self.runner.owner_of(id);
        let was_attached = self.runner.is_attached(id);

        let outcome = self.runner.end_segment(id, end, now);

        match (&outcome, owner) {
            (SegmentOutcome::Suspended, Some(owner)) if !was_attached => {
                if let Some(control) = self.controls.get_mut(owner) {
                    control.push_execution(id);
                    self.runner.mark_attached(id);
                }
            }
            (SegmentOutcome::Suspended, _) => {}
            (_, Some(owner)) if was_attached => {
                if let Some(control) = self.controls.get_mut(owner) {
                    control.remove_execution(id);
                }
            }
            _ => {}
        }

        outcome
    }

    /// Cancels one execution; returns `true` if it was live
    pub fn cancel(&mut self, id: ExecutionId) -> bool {
        match self.runner.cancel(id) {
            CancelOutcome::Discarded(exec) => {
                if let Some(control) = exec.owner().and_then(|o| self.controls.get_mut(o)) {
                    control.remove_execution(id);
                }
                true
            }
            CancelOutcome::Deferred => true,
            CancelOutcome::NotLive => false,
        }
    }

    /// Cancels the most recent live execution of `control`, other than the
    /// one currently running
    pub fn cancel_previous(&mut self, control: ControlId) -> Option<ExecutionId> {
        let current = self.runner.current();
        let target = self
            .controls
            .get(control)
            .and_then(|c| c.previous_execution(current))?;
        self.cancel(target);
        Some(target)
    }

    /// Cancels every live execution of `control`; returns how many were hit
    pub fn cancel_all_of(&mut self, control: ControlId) -> usize {
        let targets: Vec<ExecutionId> = match self.controls.get(control) {
            Some(c) => c.executions().to_vec(),
            None => return 0,
        };
        let count = targets.iter().filter(|id| self.cancel(**id)).count();
        if count > 0 {
            debug!("Cancelled {} execution(s) of {}", count, control);
        }
        count
    }

    /// Cancels the live executions of every control of the device
    pub fn cancel_all_of_device(&mut self) -> usize {
        self.controls
            .ids()
            .into_iter()
            .map(|control| self.cancel_all_of(control))
            .sum()
    }

    /// Drops every registered execution, running or not
    ///
    /// Used by reset and teardown; afterwards no control references any
    /// execution.
    pub fn discard_all(&mut self) -> usize {
        let discarded = self.runner.drain().len();
        for control in self.controls.iter_mut() {
            control.take_executions();
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::capabilities::Capabilities;
    use mlua::Lua;
    use std::time::Duration;

    fn state() -> DeviceState {
        DeviceState::new(ControlSet::from_capabilities(&Capabilities::from_codes(
            &[5, 6],
            &[],
        )))
    }

    fn suspended(state: &mut DeviceState, lua: &Lua, control: ControlId, now: Instant) -> ExecutionId {
        let func = lua.create_function(|_, ()| Ok(())).unwrap();
        let id = state
            .runner
            .register(Some(control), lua.create_thread(func).unwrap(), None, now);
        state.runner.begin(id).unwrap();
        let outcome = state.finish_segment(
            id,
            SegmentEnd::Yielded {
                delay: Duration::from_millis(100),
            },
            now,
        );
        assert_eq!(outcome, SegmentOutcome::Suspended);
        id
    }

    #[test]
    fn test_suspension_attaches_to_owner() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut state = state();
        let key = ControlId::key(5);

        let id = suspended(&mut state, &lua, key, now);
        assert_eq!(state.controls.get(key).unwrap().executions(), &[id]);

        state.runner.begin(id).unwrap();
        state.finish_segment(id, SegmentEnd::Completed, now);
        assert!(state.controls.get(key).unwrap().executions().is_empty());
        assert!(state.runner.is_empty());
    }

    #[test]
    fn test_cancel_previous_twice() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut state = state();
        let key = ControlId::key(5);

        let ids: Vec<_> = (0..3).map(|_| suspended(&mut state, &lua, key, now)).collect();

        assert_eq!(state.cancel_previous(key), Some(ids[2]));
        assert_eq!(state.controls.get(key).unwrap().executions(), &ids[..2]);
        assert_eq!(state.cancel_previous(key), Some(ids[1]));
        assert_eq!(state.controls.get(key).unwrap().executions(), &ids[..1]);
        assert_eq!(state.runner.len(), 1);
    }

    #[test]
    fn test_cancel_all_of_device() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut state = state();

        suspended(&mut state, &lua, ControlId::key(5), now);
        suspended(&mut state, &lua, ControlId::key(5), now);
        suspended(&mut state, &lua, ControlId::key(6), now);

        assert_eq!(state.cancel_all_of_device(), 3);
        assert!(state.runner.is_empty());
        assert!(state.controls.iter().all(|c| c.executions().is_empty()));
        assert_eq!(state.cancel_all_of_device(), 0);
    }

    #[test]
    fn test_unknown_control_cancels_nothing() {
        let mut state = state();
        assert_eq!(state.cancel_previous(ControlId::key(99)), None);
        assert_eq!(state.cancel_all_of(ControlId::axis(0)), 0);
    }
}
