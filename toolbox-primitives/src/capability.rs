//! Capability names requested by scripts.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix that marks a capability name as a remote module reference.
pub const REMOTE_PREFIX: &str = "https://";

const MAX_NAME_LEN: usize = 2048;

/// Where a capability is resolved from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CapabilityOrigin {
    /// Looked up in the embedded package allowlist.
    Embedded,
    /// Loaded directly from a fully-qualified `https://` location.
    Remote,
}

/// Validated capability name, either a bare package name or a remote URL.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityName(String);

impl CapabilityName {
    /// Creates a capability name after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapabilityName`] if the name is empty, too long,
    /// or contains whitespace or control characters.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns how the name is resolved.
    #[must_use]
    pub fn origin(&self) -> CapabilityOrigin {
        if self.0.starts_with(REMOTE_PREFIX) {
            CapabilityOrigin::Remote
        } else {
            CapabilityOrigin::Embedded
        }
    }

    /// Returns `true` for `https://` module references.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.origin() == CapabilityOrigin::Remote
    }
}

impl Display for CapabilityName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CapabilityName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CapabilityName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CapabilityName> for String {
    fn from(value: CapabilityName) -> Self {
        value.0
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidCapabilityName {
            name: name.into(),
            reason: "name cannot be empty".into(),
        });
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidCapabilityName {
            name: name.into(),
            reason: format!("name length must be <= {MAX_NAME_LEN}"),
        });
    }

    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidCapabilityName {
            name: name.into(),
            reason: "name cannot contain whitespace or control characters".into(),
        });
    }

    Ok(())
}
