//! Core shared types for the toolbox runtime.

#![warn(missing_docs, clippy::pedantic)]

mod capability;
mod definition;
mod error;
mod ids;
mod settings;

/// Capability names and their resolution origin.
pub use capability::{CapabilityName, CapabilityOrigin, REMOTE_PREFIX};
/// Immutable tool definitions.
pub use definition::ToolDefinition;
/// Error type and result alias shared across the runtime.
pub use error::{Error, Result};
/// Unique identifier for tool instances.
pub use ids::ToolId;
/// Scheduling and adapter enumerations.
pub use settings::{AdapterKind, SchedulingStrategy};
