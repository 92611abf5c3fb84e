//! Tool definitions supplied by the tool-management collaborator.

use serde::{Deserialize, Serialize};

use crate::ToolId;

/// Immutable description of a tool's script.
///
/// The runtime never mutates a definition; hosts build a fresh one whenever the
/// author edits the script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    id: ToolId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    script: String,
}

impl ToolDefinition {
    /// Creates a definition for the given identifier and script text.
    #[must_use]
    pub fn new(id: ToolId, script: impl Into<String>) -> Self {
        Self {
            id,
            name: None,
            script: script.into(),
        }
    }

    /// Sets a human-readable tool name, used for chunk names in tracebacks.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the tool identifier.
    #[must_use]
    pub const fn id(&self) -> ToolId {
        self.id
    }

    /// Returns the optional display name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the script text.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Name used when compiling the script, so tracebacks point at the tool.
    #[must_use]
    pub fn chunk_name(&self) -> String {
        match &self.name {
            Some(name) => format!("={name}"),
            None => format!("=tool:{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_name_prefers_display_name() {
        let id = ToolId::random();
        let unnamed = ToolDefinition::new(id, "return nil");
        assert_eq!(unnamed.chunk_name(), format!("=tool:{id}"));

        let named = unnamed.with_name("unit-converter");
        assert_eq!(named.chunk_name(), "=unit-converter");
        assert_eq!(named.script(), "return nil");
    }

    #[test]
    fn deserializes_without_name() {
        let id = ToolId::random();
        let json = serde_json::json!({ "id": id.to_string(), "script": "x = 1" });
        let definition: ToolDefinition = serde_json::from_value(json).expect("definition");
        assert_eq!(definition.id(), id);
        assert_eq!(definition.name(), None);
    }
}
