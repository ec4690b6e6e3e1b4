//! Host functions exposed to device programs
//!
//! Every interpreter gets the same fixed table. Each function receives the
//! [`HostContext`] of its device explicitly; the "current control" is the
//! owner of the execution the runner is driving at call time.
//!
//! Misuse policy: control-code functions warn and fall back to a neutral
//! value, `move_rel` raises a script error that aborts only the calling
//! execution.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use mlua::{Function, Lua, LuaOptions, StdLib, Table, Value, Variadic};
use tracing::{info, warn};

use crate::device::control::{Control, ControlId};
use crate::device::state::DeviceState;
use crate::output::{OutputError, OutputSink};
use crate::script::error::ScriptError;

/// Everything a host function may touch
#[derive(Clone)]
pub(crate) struct HostContext {
    pub device: Rc<str>,
    pub state: Rc<RefCell<DeviceState>>,
    pub sink: Arc<dyn OutputSink>,
}

impl HostContext {
    fn read_control<T>(&self, caller: &str, id: ControlId, read: impl Fn(&Control) -> T) -> Option<T> {
        let state = self.state.borrow();
        match state.controls.get(id) {
            Some(control) => Some(read(control)),
            None => {
                warn!("{}: {} does not exist on {}", caller, id, self.device);
                None
            }
        }
    }

    fn emit(&self, caller: &str, action: impl FnOnce(&dyn OutputSink) -> Result<(), OutputError>) {
        if let Err(e) = action(self.sink.as_ref()) {
            warn!("{} on {} failed: {}", caller, self.device, e);
        }
    }

    fn set_key_state(&self, code: u16, pressed: bool) {
        if let Some(key) = self.state.borrow_mut().controls.get_mut(ControlId::key(code)) {
            key.set_pressed(pressed);
        }
    }
}

type HostFn = fn(&HostContext, Variadic<Value>) -> mlua::Result<Value>;

const HOST_FUNCTIONS: &[(&str, HostFn)] = &[
    ("is_key_pressed", is_key_pressed as HostFn),
    ("get_abs", get_abs as HostFn),
    ("get_abs_min", get_abs_min as HostFn),
    ("get_abs_max", get_abs_max as HostFn),
    ("press_key", press_key as HostFn),
    ("release_key", release_key as HostFn),
    ("move_rel", move_rel as HostFn),
    ("cancel_previous", cancel_previous as HostFn),
    ("cancel_previous_of_key", cancel_previous_of_key as HostFn),
    ("cancel_all", cancel_all as HostFn),
    ("cancel_all_of_key", cancel_all_of_key as HostFn),
    ("cancel_all_of_device", cancel_all_of_device as HostFn),
];

/// Creates a sandboxed interpreter with the host table installed
pub(crate) fn create_interpreter(ctx: &HostContext) -> Result<Lua, ScriptError> {
    let libs = StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::MATH;
    let lua = Lua::new_with(libs, LuaOptions::default())
        .map_err(|e| ScriptError::Interpreter(e.to_string()))?;
    install(&lua, ctx).map_err(|e| ScriptError::Interpreter(e.to_string()))?;
    Ok(lua)
}

fn install(lua: &Lua, ctx: &HostContext) -> mlua::Result<()> {
    let globals = lua.globals();

    // delay is a plain coroutine yield; the runner turns the yielded value
    // into a wake time. The rest of the coroutine library stays hidden.
    let coroutine: Table = globals.get("coroutine")?;
    let yield_fn: Function = coroutine.get("yield")?;
    globals.set("delay", yield_fn)?;
    globals.set("coroutine", Value::Nil)?;

    // The base library is always opened; drop its chunk loaders
    for name in ["dofile", "loadfile", "load"] {
        globals.set(name, Value::Nil)?;
    }

    let device = ctx.device.clone();
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        let text = args.iter().map(display).collect::<Vec<_>>().join("\t");
        info!("[{}] {}", device, text);
        Ok(())
    })?;
    globals.set("print", print)?;

    for (name, host_fn) in HOST_FUNCTIONS {
        let ctx = ctx.clone();
        let host_fn = *host_fn;
        let function = lua.create_function(move |_, args: Variadic<Value>| host_fn(&ctx, args))?;
        globals.set(*name, function)?;
    }

    Ok(())
}

fn display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(i64::from(*i)),
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

/// Extracts the single control code argument of `caller`
///
/// A wrong argument count only warns; a missing or unusable first argument
/// yields `None`.
pub(crate) fn control_code(caller: &str, args: &[Value]) -> Option<u16> {
    if args.len() != 1 {
        warn!("{} called with {} arguments", caller, args.len());
    }
    let first = args.first()?;
    let Some(code) = integer(first) else {
        warn!("{} called with a non-integer argument", caller);
        return None;
    };
    match u16::try_from(code) {
        Ok(code) => Some(code),
        Err(_) => {
            warn!("{} called with an invalid control code {}", caller, code);
            None
        }
    }
}

fn is_key_pressed(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    let pressed = control_code("is_key_pressed", &args)
        .and_then(|code| ctx.read_control("is_key_pressed", ControlId::key(code), Control::is_pressed))
        .unwrap_or(false);
    Ok(Value::Boolean(pressed))
}

fn read_axis(ctx: &HostContext, caller: &str, args: &[Value], read: fn(&Control) -> i32) -> Value {
    let value = control_code(caller, args)
        .and_then(|code| ctx.read_control(caller, ControlId::axis(code), read))
        .unwrap_or(0);
    Value::Integer(value.into())
}

fn get_abs(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    Ok(read_axis(ctx, "get_abs", &args, Control::value))
}

fn get_abs_min(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    Ok(read_axis(ctx, "get_abs_min", &args, Control::minimum))
}

fn get_abs_max(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    Ok(read_axis(ctx, "get_abs_max", &args, Control::maximum))
}

fn press_key(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    if let Some(code) = control_code("press_key", &args) {
        ctx.emit("press_key", |sink| sink.press_key(code));
        ctx.set_key_state(code, true);
    }
    Ok(Value::Nil)
}

fn release_key(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    if let Some(code) = control_code("release_key", &args) {
        ctx.emit("release_key", |sink| sink.release_key(code));
        ctx.set_key_state(code, false);
    }
    Ok(Value::Nil)
}

fn move_rel(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    if args.len() < 2 {
        return Err(mlua::Error::RuntimeError(format!(
            "move_rel called with too few arguments ({})",
            args.len()
        )));
    }
    if args.len() > 2 {
        warn!(
            "move_rel called with too many arguments ({}), ignoring the ones after the first two",
            args.len()
        );
    }

    let code = integer(&args[0])
        .and_then(|code| u16::try_from(code).ok())
        .ok_or_else(|| {
            mlua::Error::RuntimeError("move_rel called with a non-integer first argument".into())
        })?;
    let delta = integer(&args[1])
        .and_then(|delta| i32::try_from(delta).ok())
        .ok_or_else(|| {
            mlua::Error::RuntimeError("move_rel called with a non-integer second argument".into())
        })?;

    ctx.emit("move_rel", |sink| sink.move_relative(code, delta));
    Ok(Value::Nil)
}

fn cancel_previous(ctx: &HostContext, _args: Variadic<Value>) -> mlua::Result<Value> {
    let mut state = ctx.state.borrow_mut();
    match state.runner.current_owner() {
        Some(control) => {
            state.cancel_previous(control);
        }
        None => warn!("cancel_previous called outside a control-triggered execution"),
    }
    Ok(Value::Nil)
}

/// Resolves a key code argument against the device, warning if absent
fn existing_key(ctx: &HostContext, caller: &str, args: &[Value]) -> Option<ControlId> {
    let code = control_code(caller, args)?;
    let key = ControlId::key(code);
    if ctx.state.borrow().controls.get(key).is_none() {
        warn!("{}: key {} does not exist on {}", caller, code, ctx.device);
        return None;
    }
    Some(key)
}

fn cancel_previous_of_key(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    if let Some(key) = existing_key(ctx, "cancel_previous_of_key", &args) {
        ctx.state.borrow_mut().cancel_previous(key);
    }
    Ok(Value::Nil)
}

fn cancel_all(ctx: &HostContext, _args: Variadic<Value>) -> mlua::Result<Value> {
    let mut state = ctx.state.borrow_mut();
    match state.runner.current_owner() {
        Some(control) => {
            state.cancel_all_of(control);
        }
        None => warn!("cancel_all called outside a control-triggered execution"),
    }
    Ok(Value::Nil)
}

fn cancel_all_of_key(ctx: &HostContext, args: Variadic<Value>) -> mlua::Result<Value> {
    if let Some(key) = existing_key(ctx, "cancel_all_of_key", &args) {
        ctx.state.borrow_mut().cancel_all_of(key);
    }
    Ok(Value::Nil)
}

fn cancel_all_of_device(ctx: &HostContext, _args: Variadic<Value>) -> mlua::Result<Value> {
    ctx.state.borrow_mut().cancel_all_of_device();
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_code_accepts_integral_numbers() {
        assert_eq!(control_code("f", &[Value::Integer(288)]), Some(288));
        assert_eq!(control_code("f", &[Value::Number(5.0)]), Some(5));
        assert_eq!(control_code("f", &[Value::Integer(3), Value::Nil]), Some(3));
    }

    #[test]
    fn test_control_code_rejects_unusable_arguments() {
        assert_eq!(control_code("f", &[]), None);
        assert_eq!(control_code("f", &[Value::Number(1.5)]), None);
        assert_eq!(control_code("f", &[Value::Boolean(true)]), None);
        assert_eq!(control_code("f", &[Value::Integer(-1)]), None);
        assert_eq!(control_code("f", &[Value::Integer(70_000)]), None);
    }
}
