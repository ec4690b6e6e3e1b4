//! A single triggered script run
//!
//! ```text
//! Ready ──► Running ──► Finished
//!             │  ▲
//!             ▼  │ (resume)
//!          Suspended ──► Cancelled
//! ```

use std::fmt;
use std::time::Instant;

use mlua::Thread;

use crate::device::control::{ControlCode, ControlId};

/// Opaque identity of an execution; never reused within a device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(pub(crate) u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Ready,
    Running,
    Suspended,
    Finished,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Finished | ExecutionState::Cancelled)
    }
}

/// The control event that started an execution; passed to the handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub code: ControlCode,
    pub value: i32,
}

pub struct Execution {
    pub(crate) id: ExecutionId,
    /// `None` for the startup run of a program
    pub(crate) owner: Option<ControlId>,
    pub(crate) state: ExecutionState,
    pub(crate) thread: Thread,
    pub(crate) trigger: Option<Trigger>,
    pub(crate) wake_at: Option<Instant>,
    pub(crate) cancel_requested: bool,
    /// Whether the execution has been appended to its owner's live list
    pub(crate) attached: bool,
    pub(crate) started_at: Instant,
}

impl Execution {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn owner(&self) -> Option<ControlId> {
        self.owner
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("wake_at", &self.wake_at)
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}
