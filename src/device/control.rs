//! Keys and absolute axes of a device
//!
//! A [`Control`] records the latest transition of one button or axis and the
//! ordered list of live executions that were triggered through it.

use std::collections::HashMap;
use std::fmt;

use crate::device::capabilities::{AxisRange, Capabilities};
use crate::script::execution::ExecutionId;

/// Numeric code of a key, button or axis as used by the kernel
pub type ControlCode = u16;

/// Key auto-repeat value reported by evdev
const KEY_REPEAT: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlKind {
    Key,
    Axis,
}

/// Identity of a control within its device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId {
    pub kind: ControlKind,
    pub code: ControlCode,
}

impl ControlId {
    pub fn key(code: ControlCode) -> Self {
        Self {
            kind: ControlKind::Key,
            code,
        }
    }

    pub fn axis(code: ControlCode) -> Self {
        Self {
            kind: ControlKind::Axis,
            code,
        }
    }

    /// Name of the global Lua function bound to this control
    pub fn handler_name(&self) -> String {
        match self.kind {
            ControlKind::Key => format!("on_key_{}", self.code),
            ControlKind::Axis => format!("on_abs_{}", self.code),
        }
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ControlKind::Key => write!(f, "key {}", self.code),
            ControlKind::Axis => write!(f, "axis {}", self.code),
        }
    }
}

/// A physical event targeting one control
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlEvent {
    pub control: ControlId,
    pub value: i32,
}

impl ControlEvent {
    pub fn key(code: ControlCode, value: i32) -> Self {
        Self {
            control: ControlId::key(code),
            value,
        }
    }

    pub fn axis(code: ControlCode, value: i32) -> Self {
        Self {
            control: ControlId::axis(code),
            value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    Key { pressed: bool },
    Axis(AxisRange),
}

#[derive(Debug)]
pub struct Control {
    id: ControlId,
    state: ControlState,
    /// Live executions in trigger order
    executions: Vec<ExecutionId>,
}

impl Control {
    pub fn new_key(code: ControlCode) -> Self {
        Self {
            id: ControlId::key(code),
            state: ControlState::Key { pressed: false },
            executions: Vec::new(),
        }
    }

    pub fn new_axis(code: ControlCode, range: AxisRange) -> Self {
        Self {
            id: ControlId::axis(code),
            state: ControlState::Axis(range),
            executions: Vec::new(),
        }
    }

    pub fn id(&self) -> ControlId {
        self.id
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Records a transition reported by the device
    ///
    /// Returns `false` for events that are not transitions (key auto-repeat).
    pub fn record(&mut self, value: i32) -> bool {
        match &mut self.state {
            ControlState::Key { pressed } => {
                if value == KEY_REPEAT {
                    return false;
                }
                *pressed = value != 0;
                true
            }
            ControlState::Axis(range) => {
                range.value = value;
                true
            }
        }
    }

    /// Overrides the pressed state of a key without counting as a transition
    pub fn set_pressed(&mut self, value: bool) {
        if let ControlState::Key { pressed } = &mut self.state {
            *pressed = value;
        }
    }

    pub fn is_pressed(&self) -> bool {
        matches!(self.state, ControlState::Key { pressed: true })
    }

    pub fn value(&self) -> i32 {
        match self.state {
            ControlState::Key { pressed } => pressed as i32,
            ControlState::Axis(range) => range.value,
        }
    }

    pub fn minimum(&self) -> i32 {
        match self.state {
            ControlState::Key { .. } => 0,
            ControlState::Axis(range) => range.minimum,
        }
    }

    pub fn maximum(&self) -> i32 {
        match self.state {
            ControlState::Key { .. } => 1,
            ControlState::Axis(range) => range.maximum,
        }
    }

    pub fn executions(&self) -> &[ExecutionId] {
        &self.executions
    }

    pub fn push_execution(&mut self, id: ExecutionId) {
        self.executions.push(id);
    }

    pub fn remove_execution(&mut self, id: ExecutionId) -> bool {
        match self.executions.iter().position(|e| *e == id) {
            Some(index) => {
                self.executions.remove(index);
                true
            }
            None => false,
        }
    }

    /// Most recently triggered live execution, skipping `except`
    pub fn previous_execution(&self, except: Option<ExecutionId>) -> Option<ExecutionId> {
        self.executions
            .iter()
            .rev()
            .copied()
            .find(|id| Some(*id) != except)
    }

    pub fn take_executions(&mut self) -> Vec<ExecutionId> {
        std::mem::take(&mut self.executions)
    }
}

/// All controls of one device, keyed by identity
#[derive(Debug, Default)]
pub struct ControlSet {
    controls: HashMap<ControlId, Control>,
}

impl ControlSet {
    /// One key control per set key bit, one axis control per set axis bit
    pub fn from_capabilities(capabilities: &Capabilities) -> Self {
        let keys = capabilities
            .key_codes()
            .map(|code| (ControlId::key(code), Control::new_key(code)));
        let axes = capabilities.axis_codes().map(|code| {
            (
                ControlId::axis(code),
                Control::new_axis(code, capabilities.axis_range(code)),
            )
        });

        Self {
            controls: keys.chain(axes).collect(),
        }
    }

    pub fn get(&self, id: ControlId) -> Option<&Control> {
        self.controls.get(&id)
    }

    pub fn get_mut(&mut self, id: ControlId) -> Option<&mut Control> {
        self.controls.get_mut(&id)
    }

    pub fn key(&self, code: ControlCode) -> Option<&Control> {
        self.get(ControlId::key(code))
    }

    pub fn axis(&self, code: ControlCode) -> Option<&Control> {
        self.get(ControlId::axis(code))
    }

    pub fn ids(&self) -> Vec<ControlId> {
        self.controls.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Control> {
        self.controls.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Control> {
        self.controls.values_mut()
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_transitions_ignore_repeat() {
        let mut key = Control::new_key(288);
        assert!(key.record(1));
        assert!(key.is_pressed());
        assert!(!key.record(KEY_REPEAT));
        assert!(key.is_pressed());
        assert!(key.record(0));
        assert!(!key.is_pressed());
    }

    #[test]
    fn test_axis_keeps_limits() {
        let mut axis = Control::new_axis(0, AxisRange::new(0, -512, 511));
        axis.record(200);
        assert_eq!(axis.value(), 200);
        assert_eq!(axis.minimum(), -512);
        assert_eq!(axis.maximum(), 511);
    }

    #[test]
    fn test_previous_execution_skips_current() {
        let mut key = Control::new_key(5);
        key.push_execution(ExecutionId(1));
        key.push_execution(ExecutionId(2));
        key.push_execution(ExecutionId(3));

        assert_eq!(key.previous_execution(None), Some(ExecutionId(3)));
        assert_eq!(
            key.previous_execution(Some(ExecutionId(3))),
            Some(ExecutionId(2))
        );

        assert!(key.remove_execution(ExecutionId(2)));
        assert!(!key.remove_execution(ExecutionId(2)));
        assert_eq!(key.executions(), &[ExecutionId(1), ExecutionId(3)]);
    }

    #[test]
    fn test_control_set_from_capabilities() {
        let caps = Capabilities::from_codes(&[288, 289], &[0])
            .with_axis_range(0, AxisRange::new(128, 0, 255));
        let set = ControlSet::from_capabilities(&caps);

        assert_eq!(set.len(), 3);
        assert!(set.key(288).is_some());
        assert!(set.key(290).is_none());
        assert_eq!(set.axis(0).map(|a| a.value()), Some(128));
        assert!(set.axis(1).is_none());
    }

    #[test]
    fn test_handler_names() {
        assert_eq!(ControlId::key(288).handler_name(), "on_key_288");
        assert_eq!(ControlId::axis(3).handler_name(), "on_abs_3");
    }
}
