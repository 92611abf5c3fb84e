//! Tool identifiers.
//!
//! Hosts hand tool ids around as strings (the editor stores them in its
//! document model, logs print them). [`ToolId`] accepts every UUID spelling a
//! host is likely to produce, always prints the lowercase hyphenated form, and
//! serializes as that same string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Identity of one user-authored tool; stable across edits of its script.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolId(Uuid);

impl ToolId {
    /// Mints a fresh id for a newly created tool.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a host-supplied id.
    ///
    /// Surrounding whitespace is ignored. Hyphenated, simple (32 hex digits),
    /// braced, and `urn:uuid:` spellings are all accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToolId`] when the text is not a UUID.
    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(Self(Uuid::parse_str(text.trim())?))
    }

    /// First eight hex digits, enough to tell tools apart in log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let mut buffer = Uuid::encode_buffer();
        self.0.simple().encode_lower(&mut buffer)[..8].to_owned()
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl From<Uuid> for ToolId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ToolId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ToolId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ToolId> for String {
    fn from(id: ToolId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HYPHENATED: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    #[test]
    fn host_spellings_name_the_same_tool() {
        let expected = ToolId::parse(HYPHENATED).unwrap();
        for spelling in [
            "67e5504410b1426f9247bb680e5fe0c8",
            "  67E55044-10B1-426F-9247-BB680E5FE0C8\n",
            "{67e55044-10b1-426f-9247-bb680e5fe0c8}",
            "urn:uuid:67e55044-10b1-426f-9247-bb680e5fe0c8",
        ] {
            assert_eq!(spelling.parse::<ToolId>().unwrap(), expected, "{spelling:?}");
        }
        assert_eq!(expected.to_string(), HYPHENATED);
        assert_eq!(expected.short(), "67e55044");
    }

    #[test]
    fn rejects_garbage() {
        let err = ToolId::parse("not-a-uuid").unwrap_err();
        assert!(matches!(err, Error::InvalidToolId { .. }));
    }

    #[test]
    fn serializes_as_the_canonical_string() {
        let id = ToolId::parse(HYPHENATED).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{HYPHENATED}\""));

        let relaxed: ToolId = serde_json::from_str("\" 67e5504410b1426f9247bb680e5fe0c8 \"").unwrap();
        assert_eq!(relaxed, id);
        assert!(serde_json::from_str::<ToolId>("\"nope\"").is_err());
    }
}
