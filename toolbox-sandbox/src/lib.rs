//! Restricted script realms for user-authored tools.
//!
//! A [`Sandbox`] evaluates a tool's Lua script once against a context that holds
//! only allowlisted bindings, then runs the bound `handler` on demand while the
//! script's top-level state persists between runs.

#![warn(missing_docs, clippy::pedantic)]

mod context;
pub mod error;
mod host;
pub mod log;
pub mod overrides;
mod sandbox;
pub mod value;

pub use error::{ErrorCategory, SandboxError, SandboxResult};
pub use host::DisplayInfo;
pub use log::{CollectingLogSink, LogLevel, LogLine, LogSink, TracingLogSink};
pub use overrides::{ContextOverrides, HostFunction, LuaInstaller, OverrideValue};
pub use sandbox::{EntryPointSource, HandlerBinding, Sandbox, SandboxBuilder};
pub use value::{Inputs, OutputValue, Outputs, ScriptFunction, UpdateCallback};
