//! Scriptable joystick daemon core
//!
//! Watches an input directory for controllable devices and runs a Lua
//! program against each of them. Control transitions start handler
//! executions that may suspend, cancel each other and synthesize output
//! events through an [`output::OutputSink`].

pub mod config;
pub mod device;
pub mod output;
pub mod registry;
pub mod script;
