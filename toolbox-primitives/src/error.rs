//! Shared error definitions for toolbox primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the toolbox runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided tool identifier could not be parsed.
    #[error("invalid tool id: {source}")]
    InvalidToolId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Capability name failed validation.
    #[error("invalid capability name `{name}`: {reason}")]
    InvalidCapabilityName {
        /// The offending name.
        name: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// A textual setting did not match any known variant.
    #[error("unknown {kind} `{value}` (expected one of: {expected})")]
    UnknownVariant {
        /// Kind of setting being parsed.
        kind: &'static str,
        /// Value that failed to parse.
        value: String,
        /// Accepted spellings.
        expected: &'static str,
    },
}
