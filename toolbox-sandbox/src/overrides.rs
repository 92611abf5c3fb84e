//! Caller-supplied bindings merged into a sandbox context after every built-in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use mlua::{Lua, Table, Value, Variadic};
use serde_json::Value as Json;

use crate::value::{json_to_lua, lua_to_json};

/// Host function callable from scripts with JSON arguments.
pub type HostFunction = Arc<dyn Fn(Vec<Json>) -> Result<Json, String> + Send + Sync>;

/// Builds an arbitrary script value inside a realm.
pub type LuaInstaller = Arc<dyn Fn(&Lua) -> mlua::Result<Value> + Send + Sync>;

/// A single override binding.
#[derive(Clone)]
pub enum OverrideValue {
    /// Plain data, converted to a table or scalar.
    Json(Json),
    /// A Rust function; `Err` messages are raised as script errors.
    Function(HostFunction),
    /// A value built directly against the engine.
    Lua(LuaInstaller),
}

impl fmt::Debug for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Lua(_) => f.write_str("Lua(..)"),
        }
    }
}

/// Named overrides; each replaces any built-in binding of the same name.
#[derive(Clone, Debug, Default)]
pub struct ContextOverrides {
    entries: BTreeMap<String, OverrideValue>,
}

impl ContextOverrides {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds plain data.
    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: Json) -> Self {
        self.insert(name, OverrideValue::Json(value));
        self
    }

    /// Binds a Rust function.
    #[must_use]
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Vec<Json>) -> Result<Json, String> + Send + Sync + 'static,
    {
        self.insert(name, OverrideValue::Function(Arc::new(function)));
        self
    }

    /// Binds a value built against the engine.
    #[must_use]
    pub fn with_lua<F>(mut self, name: impl Into<String>, installer: F) -> Self
    where
        F: Fn(&Lua) -> mlua::Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, OverrideValue::Lua(Arc::new(installer)));
        self
    }

    /// Inserts or replaces a binding.
    pub fn insert(&mut self, name: impl Into<String>, value: OverrideValue) {
        self.entries.insert(name.into(), value);
    }

    /// Lists bound names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Returns the number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn apply(&self, lua: &Lua, env: &Table) -> mlua::Result<()> {
        for (name, value) in &self.entries {
            let value = match value {
                OverrideValue::Json(json) => json_to_lua(lua, json)?,
                OverrideValue::Function(function) => {
                    let function = Arc::clone(function);
                    Value::Function(lua.create_function(move |lua, args: Variadic<Value>| {
                        let args = args
                            .iter()
                            .map(lua_to_json)
                            .collect::<mlua::Result<Vec<_>>>()?;
                        let result = function(args).map_err(mlua::Error::runtime)?;
                        json_to_lua(lua, &result)
                    })?)
                }
                OverrideValue::Lua(installer) => installer(lua)?,
            };
            env.raw_set(name.as_str(), value)?;
        }
        Ok(())
    }
}
