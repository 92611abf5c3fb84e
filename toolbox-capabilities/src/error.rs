//! Errors produced while resolving capabilities.

use thiserror::Error;

/// Number of valid names quoted in an unknown-capability message.
const SAMPLE_LEN: usize = 8;

/// Errors emitted by the capability loader and its packages.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The name is neither cached, embedded, nor a remote reference.
    #[error(
        "unknown capability `{name}`; available capabilities include: {}. \
         To load a module that is not embedded, pass a fully-qualified https:// URL instead",
        sample(.available)
    )]
    UnknownCapability {
        /// Requested name.
        name: String,
        /// Names registered in the embedded allowlist.
        available: Vec<String>,
    },

    /// A package name collided with an existing registration.
    #[error("capability `{name}` is already registered")]
    Duplicate {
        /// Name of the offending package.
        name: String,
    },

    /// The requested name failed validation.
    #[error(transparent)]
    InvalidName(#[from] toolbox_primitives::Error),

    /// Remote module loading is disabled for this loader.
    #[error("remote capability `{url}` rejected: remote modules are disabled")]
    RemoteDisabled {
        /// Rejected location.
        url: String,
    },

    /// Network request failed before a response was received.
    #[error("fetch of `{url}` failed: {reason}")]
    Fetch {
        /// Requested location.
        url: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A remote module was fetched but could not be used.
    #[error("remote module `{url}` could not be loaded: {reason}")]
    RemoteLoad {
        /// Module location.
        url: String,
        /// Human-readable cause.
        reason: String,
    },

    /// An embedded package failed while loading.
    #[error("capability `{name}` failed to load: {reason}")]
    Package {
        /// Package name.
        name: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The module body or its adapter raised while being evaluated.
    #[error("capability `{name}` failed to initialise: {source}")]
    Initialization {
        /// Capability name.
        name: String,
        /// Error raised by the module or adapter.
        #[source]
        source: mlua::Error,
    },

    /// An adapter needs an asset that was never registered.
    #[error("capability `{package}` needs asset `{asset}`, which is not registered")]
    MissingAsset {
        /// Package being adapted.
        package: String,
        /// Logical asset file name.
        asset: String,
    },
}

impl CapabilityError {
    /// Helper to construct package errors from string-like values.
    #[must_use]
    pub fn package(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Package {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an evaluation failure of the named capability.
    #[must_use]
    pub fn initialization(name: impl Into<String>, source: mlua::Error) -> Self {
        Self::Initialization {
            name: name.into(),
            source,
        }
    }

    /// Helper to construct fetch errors from string-like values.
    #[must_use]
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

fn sample(available: &[String]) -> String {
    if available.is_empty() {
        return "(none registered)".to_owned();
    }
    let mut names = available.iter().take(SAMPLE_LEN).cloned().collect::<Vec<_>>();
    if available.len() > SAMPLE_LEN {
        names.push(format!("and {} more", available.len() - SAMPLE_LEN));
    }
    names.join(", ")
}

/// Result alias for capability operations.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_capability_lists_names_and_remote_hint() {
        let err = CapabilityError::UnknownCapability {
            name: "ffmpg".into(),
            available: vec!["ffmpeg".into(), "hash".into()],
        };
        let message = err.to_string();
        assert!(message.contains("`ffmpg`"));
        assert!(message.contains("ffmpeg, hash"));
        assert!(message.contains("https://"));
    }

    #[test]
    fn long_allowlists_are_truncated() {
        let available = (0..12).map(|i| format!("pkg{i}")).collect::<Vec<_>>();
        let err = CapabilityError::UnknownCapability {
            name: "missing".into(),
            available,
        };
        let message = err.to_string();
        assert!(message.contains("pkg7"));
        assert!(!message.contains("pkg8,"));
        assert!(message.contains("and 4 more"));
    }
}
