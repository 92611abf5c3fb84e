//! Tracing initialisation for toolbox hosts.
//!
//! Call [`init_tracing`] once at program start. Script console output arrives
//! under the `toolbox::script` target, so filters such as
//! `info,toolbox::script=debug` raise script verbosity independently.

#![warn(missing_docs, clippy::pedantic)]

use thiserror::Error;
use toolbox_config::{LogFormat, LoggingSettings};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directives could not be parsed.
    #[error("invalid log filter `{filter}`: {reason}")]
    InvalidFilter {
        /// Directives as configured.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber was already installed in this process.
    #[error("tracing subscriber already initialised: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Result alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Parses the configured filter directives.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] for malformed directives.
pub fn filter(settings: &LoggingSettings) -> TelemetryResult<EnvFilter> {
    EnvFilter::try_new(&settings.filter).map_err(|err| TelemetryError::InvalidFilter {
        filter: settings.filter.clone(),
        reason: err.to_string(),
    })
}

/// Installs the global subscriber described by `settings`.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] for malformed directives and
/// [`TelemetryError::AlreadyInitialized`] when called a second time.
pub fn init_tracing(settings: &LoggingSettings) -> TelemetryResult<()> {
    let env_filter = filter(settings)?;
    match settings.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?,
    }
    tracing::debug!(filter = %settings.filter, format = %settings.format, "tracing initialised");
    Ok(())
}
