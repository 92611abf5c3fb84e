//! Errors surfaced by sandbox construction and handler runs.

use thiserror::Error;
use toolbox_capabilities::CapabilityError;

/// Broad classification used by hosts to decide how to present a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    /// The script is shaped incorrectly (no handler, bad return value).
    Authoring,
    /// A `require` named a capability that could not be loaded.
    Capability,
    /// The script raised an error while running, or the host panicked under it.
    Script,
}

/// Errors produced by a [`Sandbox`](crate::Sandbox).
#[derive(Clone, Debug, Error)]
pub enum SandboxError {
    /// The script never bound a `handler` entry point.
    #[error("tool `{tool}` defines no `handler` entry point")]
    MissingEntryPoint {
        /// Tool label.
        tool: String,
    },

    /// The bound `handler` is not a function.
    #[error("tool `{tool}` binds `handler` to a {found}, which cannot be called")]
    InvalidEntryPoint {
        /// Tool label.
        tool: String,
        /// Lua type name of the bound value.
        found: &'static str,
    },

    /// The handler returned something other than a table or nil.
    #[error("tool `{tool}` handler returned {found}; expected a table of outputs or nil")]
    InvalidReturnShape {
        /// Tool label.
        tool: String,
        /// Description of the offending value.
        found: String,
    },

    /// Host code panicked while the handler ran. Later runs are unaffected.
    #[error("tool `{tool}` panicked while running: {message}")]
    Panicked {
        /// Tool label.
        tool: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// Error raised by the script or the engine, passed through unmodified.
    #[error(transparent)]
    Script(#[from] mlua::Error),
}

impl SandboxError {
    /// Classifies the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingEntryPoint { .. }
            | Self::InvalidEntryPoint { .. }
            | Self::InvalidReturnShape { .. } => ErrorCategory::Authoring,
            Self::Script(_) if self.capability_error().is_some() => ErrorCategory::Capability,
            Self::Script(_) | Self::Panicked { .. } => ErrorCategory::Script,
        }
    }

    /// Returns the capability failure buried in a script error chain, if any.
    #[must_use]
    pub fn capability_error(&self) -> Option<&CapabilityError> {
        match self {
            Self::Script(err) => find_capability_error(err),
            _ => None,
        }
    }
}

fn find_capability_error(err: &mlua::Error) -> Option<&CapabilityError> {
    match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            find_capability_error(cause)
        }
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<CapabilityError>(),
        _ => None,
    }
}

/// Result alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;
