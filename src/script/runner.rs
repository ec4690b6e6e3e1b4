//! Cooperative execution scheduler
//!
//! The runner owns every live execution of one script environment, indexed
//! by [`ExecutionId`]. At most one execution is `Running` at a time; the
//! environment drives it by resuming its coroutine and reporting back how the
//! segment ended. Executions started while another one runs wait in a FIFO
//! ready queue. Suspended executions carry their wake time.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use mlua::Thread;
use tracing::{debug, trace, warn};

use crate::device::control::ControlId;
use crate::script::execution::{Execution, ExecutionId, ExecutionState, Trigger};

/// How a run segment of the current execution ended
#[derive(Debug)]
pub enum SegmentEnd {
    /// The coroutine called `delay`
    Yielded { delay: Duration },
    /// The coroutine returned
    Completed,
    /// The coroutine raised a script error
    Failed(String),
}

/// State an execution is left in after a run segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentOutcome {
    Suspended,
    Finished,
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
pub enum CancelOutcome {
    /// The execution was removed from the registry
    Discarded(Execution),
    /// The execution is running; it is dropped at its next suspension
    Deferred,
    /// Already terminal or unknown
    NotLive,
}

#[derive(Debug, Default)]
pub struct Runner {
    executions: HashMap<ExecutionId, Execution>,
    next_id: u64,
    ready: VecDeque<ExecutionId>,
    current: Option<ExecutionId>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new execution in the `Ready` state
    pub fn register(
        &mut self,
        owner: Option<ControlId>,
        thread: Thread,
        trigger: Option<Trigger>,
        now: Instant,
    ) -> ExecutionId {
        self.next_id += 1;
        let id = ExecutionId(self.next_id);
        self.executions.insert(
            id,
            Execution {
                id,
                owner,
                state: ExecutionState::Ready,
                thread,
                trigger,
                wake_at: None,
                cancel_requested: false,
                attached: false,
                started_at: now,
            },
        );
        trace!("Registered execution {} for {:?}", id, owner);
        id
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<ExecutionId> {
        self.current
    }

    /// Control that triggered the running execution
    pub fn current_owner(&self) -> Option<ControlId> {
        self.current
            .and_then(|id| self.executions.get(&id))
            .and_then(|exec| exec.owner)
    }

    pub fn enqueue(&mut self, id: ExecutionId) {
        debug!("Execution {} queued behind {:?}", id, self.current);
        self.ready.push_back(id);
    }

    /// Next queued execution that is still waiting to run
    pub fn next_ready(&mut self) -> Option<ExecutionId> {
        while let Some(id) = self.ready.pop_front() {
            if self.state(id) == Some(ExecutionState::Ready) {
                return Some(id);
            }
        }
        None
    }

    /// Marks `id` as running and hands out its coroutine
    ///
    /// The trigger is returned only for the first segment.
    pub fn begin(&mut self, id: ExecutionId) -> Option<(Thread, Option<Trigger>)> {
        if self.current.is_some() {
            return None;
        }
        let exec = self.executions.get_mut(&id)?;
        if !matches!(
            exec.state,
            ExecutionState::Ready | ExecutionState::Suspended
        ) {
            return None;
        }
        exec.state = ExecutionState::Running;
        exec.wake_at = None;
        self.current = Some(id);
        Some((exec.thread.clone(), exec.trigger.take()))
    }

    /// Applies the end of a run segment; terminal executions are deregistered
    pub fn end_segment(&mut self, id: ExecutionId, end: SegmentEnd, now: Instant) -> SegmentOutcome {
        if self.current == Some(id) {
            self.current = None;
        }

        let Some(exec) = self.executions.get_mut(&id) else {
            // Discarded while it was running (reset or teardown)
            return SegmentOutcome::Cancelled;
        };

        match end {
            SegmentEnd::Yielded { .. } if exec.cancel_requested => {
                self.retire(id, ExecutionState::Cancelled, now);
                SegmentOutcome::Cancelled
            }
            SegmentEnd::Yielded { delay } => {
                exec.state = ExecutionState::Suspended;
                exec.wake_at = now.checked_add(delay);
                if exec.wake_at.is_none() {
                    warn!(
                        "Execution {} delayed past the clock range, it only ends when cancelled",
                        id
                    );
                } else {
                    trace!("Execution {} suspended for {:?}", id, delay);
                }
                SegmentOutcome::Suspended
            }
            SegmentEnd::Completed => {
                self.retire(id, ExecutionState::Finished, now);
                SegmentOutcome::Finished
            }
            SegmentEnd::Failed(message) => {
                self.retire(id, ExecutionState::Finished, now);
                SegmentOutcome::Failed(message)
            }
        }
    }

    fn retire(&mut self, id: ExecutionId, state: ExecutionState, now: Instant) {
        if let Some(mut exec) = self.executions.remove(&id) {
            exec.state = state;
            debug!(
                "Execution {} {:?} after {:?}",
                id,
                state,
                now.saturating_duration_since(exec.started_at)
            );
        }
    }

    /// Requests cancellation of `id`
    ///
    /// Idempotent: cancelling a terminal or unknown execution is a no-op.
    pub fn cancel(&mut self, id: ExecutionId) -> CancelOutcome {
        if self.current == Some(id) {
            if let Some(exec) = self.executions.get_mut(&id) {
                exec.cancel_requested = true;
                debug!("Cancellation of running execution {} deferred", id);
                return CancelOutcome::Deferred;
            }
        }

        match self.executions.remove(&id) {
            Some(mut exec) => {
                exec.state = ExecutionState::Cancelled;
                self.ready.retain(|queued| *queued != id);
                debug!("Execution {} cancelled", id);
                CancelOutcome::Discarded(exec)
            }
            None => CancelOutcome::NotLive,
        }
    }

    /// Removes every execution, including a running one
    pub fn drain(&mut self) -> Vec<Execution> {
        self.ready.clear();
        self.executions
            .drain()
            .map(|(_, mut exec)| {
                exec.state = ExecutionState::Cancelled;
                exec
            })
            .collect()
    }

    pub fn mark_attached(&mut self, id: ExecutionId) {
        if let Some(exec) = self.executions.get_mut(&id) {
            exec.attached = true;
        }
    }

    pub fn is_attached(&self, id: ExecutionId) -> bool {
        self.executions.get(&id).is_some_and(|exec| exec.attached)
    }

    pub fn owner_of(&self, id: ExecutionId) -> Option<ControlId> {
        self.executions.get(&id).and_then(|exec| exec.owner)
    }

    /// Suspended executions whose wake time has passed, earliest first
    pub fn due(&self, now: Instant) -> Vec<ExecutionId> {
        let mut due: Vec<(Instant, ExecutionId)> = self
            .executions
            .values()
            .filter(|exec| exec.state == ExecutionState::Suspended)
            .filter_map(|exec| exec.wake_at.map(|at| (at, exec.id)))
            .filter(|(at, _)| *at <= now)
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn next_wake(&self) -> Option<Instant> {
        self.executions
            .values()
            .filter(|exec| exec.state == ExecutionState::Suspended)
            .filter_map(|exec| exec.wake_at)
            .min()
    }

    pub fn state(&self, id: ExecutionId) -> Option<ExecutionState> {
        self.executions.get(&id).map(|exec| exec.state)
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    fn thread(lua: &Lua) -> Thread {
        let func = lua.create_function(|_, ()| Ok(())).unwrap();
        lua.create_thread(func).unwrap()
    }

    #[test]
    fn test_single_running_execution() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut runner = Runner::new();

        let first = runner.register(Some(ControlId::key(1)), thread(&lua), None, now);
        let second = runner.register(Some(ControlId::key(1)), thread(&lua), None, now);

        assert!(runner.begin(first).is_some());
        assert!(runner.is_busy());
        assert!(runner.begin(second).is_none());
        assert_eq!(runner.current_owner(), Some(ControlId::key(1)));

        runner.enqueue(second);
        let outcome = runner.end_segment(first, SegmentEnd::Completed, now);
        assert_eq!(outcome, SegmentOutcome::Finished);
        assert!(!runner.is_busy());
        assert_eq!(runner.next_ready(), Some(second));
        assert_eq!(runner.next_ready(), None);
        assert_eq!(runner.len(), 1);
    }

    #[test]
    fn test_ready_queue_is_fifo_and_skips_cancelled() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut runner = Runner::new();

        let ids: Vec<_> = (0..3)
            .map(|_| runner.register(None, thread(&lua), None, now))
            .collect();
        ids.iter().for_each(|id| runner.enqueue(*id));

        assert!(matches!(runner.cancel(ids[0]), CancelOutcome::Discarded(_)));
        assert_eq!(runner.next_ready(), Some(ids[1]));
        assert_eq!(runner.next_ready(), Some(ids[2]));
    }

    #[test]
    fn test_unreachable_wake_time_stays_suspended() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut runner = Runner::new();

        let id = runner.register(None, thread(&lua), None, now);
        runner.begin(id).unwrap();
        let outcome = runner.end_segment(id, SegmentEnd::Yielded { delay: Duration::MAX }, now);

        assert_eq!(outcome, SegmentOutcome::Suspended);
        assert_eq!(runner.state(id), Some(ExecutionState::Suspended));
        assert_eq!(runner.next_wake(), None);
        assert!(runner.due(now + Duration::from_secs(3600)).is_empty());
        assert!(matches!(runner.cancel(id), CancelOutcome::Discarded(_)));
    }

    #[test]
    fn test_suspension_and_wake_order() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut runner = Runner::new();

        let slow = runner.register(None, thread(&lua), None, now);
        let fast = runner.register(None, thread(&lua), None, now);

        runner.begin(slow).unwrap();
        let outcome = runner.end_segment(
            slow,
            SegmentEnd::Yielded {
                delay: Duration::from_millis(50),
            },
            now,
        );
        assert_eq!(outcome, SegmentOutcome::Suspended);

        runner.begin(fast).unwrap();
        runner.end_segment(
            fast,
            SegmentEnd::Yielded {
                delay: Duration::from_millis(20),
            },
            now,
        );

        assert_eq!(runner.next_wake(), Some(now + Duration::from_millis(20)));
        assert!(runner.due(now + Duration::from_millis(10)).is_empty());
        assert_eq!(runner.due(now + Duration::from_millis(60)), vec![fast, slow]);
    }

    #[test]
    fn test_cancel_running_is_deferred() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut runner = Runner::new();

        let id = runner.register(None, thread(&lua), None, now);
        runner.begin(id).unwrap();
        assert!(matches!(runner.cancel(id), CancelOutcome::Deferred));
        assert_eq!(runner.state(id), Some(ExecutionState::Running));

        let outcome = runner.end_segment(
            id,
            SegmentEnd::Yielded {
                delay: Duration::from_millis(10),
            },
            now,
        );
        assert_eq!(outcome, SegmentOutcome::Cancelled);
        assert!(runner.is_empty());
        assert!(matches!(runner.cancel(id), CancelOutcome::NotLive));
    }

    #[test]
    fn test_drain_while_running() {
        let lua = Lua::new();
        let now = Instant::now();
        let mut runner = Runner::new();

        let id = runner.register(None, thread(&lua), None, now);
        runner.register(None, thread(&lua), None, now);
        runner.begin(id).unwrap();

        assert_eq!(runner.drain().len(), 2);
        assert_eq!(
            runner.end_segment(id, SegmentEnd::Completed, now),
            SegmentOutcome::Cancelled
        );
        assert!(!runner.is_busy());
    }
}
