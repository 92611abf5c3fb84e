//! Runtime for user-authored tools.
//!
//! Depend on this crate to get the whole stack: capability loading, sandboxed
//! script realms, and per-tool schedulers, wired from a [`ToolboxConfig`]. The
//! component crates are re-exported for callers that need finer control.

#![warn(missing_docs, clippy::pedantic)]

mod runtime;

pub use runtime::{Toolbox, ToolboxBuilder, ToolboxError, ToolboxResult};

/// Re-export shared primitives for convenience.
pub use toolbox_primitives as primitives;

/// Capability registry, loader, fetchers, and asset adapters.
pub use toolbox_capabilities as capabilities;

/// Script realms and the values crossing their boundary.
pub use toolbox_sandbox as sandbox;

/// Schedulers and run observers.
pub use toolbox_kernel as kernel;

/// Configuration schema and loading.
pub use toolbox_config as config;

/// Subscriber setup (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use toolbox_telemetry as telemetry;

pub use toolbox_config::ToolboxConfig;
pub use toolbox_kernel::{ExecutionRequest, RunOutcome, RunTicket, ToolKernel};
pub use toolbox_primitives::{SchedulingStrategy, ToolDefinition, ToolId};
pub use toolbox_sandbox::{Inputs, Outputs, Sandbox};
