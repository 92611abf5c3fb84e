//! Configuration for the toolbox runtime.
//!
//! A [`ToolboxConfig`] is read from TOML, adjusted from `TOOLBOX_*` environment
//! variables, and validated before the facade builds loaders and kernels from it.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ENV_LOG, ENV_LOG_FORMAT, ENV_STRATEGY};
pub use schema::{
    CapabilitySettings, LogFormat, LoggingSettings, SchedulerSettings, ToolboxConfig,
};
