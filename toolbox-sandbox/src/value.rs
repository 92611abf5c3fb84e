//! Values crossing the host/script boundary.
//!
//! Inputs and outputs are JSON-shaped. Tables convert to arrays when their keys
//! are exactly `1..=n`, otherwise to objects. Functions survive only at the top
//! level of an output table, as [`ScriptFunction`] handles bound to their realm.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use mlua::{Function, Lua, Table, Value, Variadic};
use serde_json::{Map, Number, Value as Json};

use crate::error::SandboxResult;

/// Nesting limit when converting script values, which also guards against cycles.
const MAX_DEPTH: usize = 64;

/// Input values keyed by input widget id.
pub type Inputs = Map<String, Json>;

/// Receives partial outputs pushed by a handler while it is still running.
pub type UpdateCallback = Arc<dyn Fn(Outputs) + Send + Sync>;

/// Callable handle to a function returned by a handler.
///
/// The handle keeps the realm alive and observes later mutations of the state the
/// function closes over.
#[derive(Clone)]
pub struct ScriptFunction {
    function: Function,
    lua: Lua,
}

impl ScriptFunction {
    pub(crate) fn new(lua: &Lua, function: Function) -> Self {
        Self {
            function,
            lua: lua.clone(),
        }
    }

    /// Calls the function with JSON arguments and converts its first result.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Script`](crate::SandboxError::Script) when the call
    /// raises or its result cannot be converted.
    pub async fn call(&self, args: &[Json]) -> SandboxResult<Json> {
        let args = args
            .iter()
            .map(|arg| json_to_lua(&self.lua, arg))
            .collect::<mlua::Result<Variadic<Value>>>()?;
        let result: Value = self.function.call_async(args).await?;
        Ok(lua_to_json(&result)?)
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFunction").finish_non_exhaustive()
    }
}

/// One entry of a handler's output table.
#[derive(Clone, Debug)]
pub enum OutputValue {
    /// Plain data.
    Value(Json),
    /// A function defined by the script.
    Function(ScriptFunction),
}

impl OutputValue {
    /// Returns the data, or `None` for functions.
    #[must_use]
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Self::Value(value) => Some(value),
            Self::Function(_) => None,
        }
    }

    /// Returns the function handle, if this entry is one.
    #[must_use]
    pub fn as_function(&self) -> Option<&ScriptFunction> {
        match self {
            Self::Function(function) => Some(function),
            Self::Value(_) => None,
        }
    }
}

/// Output values keyed exactly as the handler returned them.
#[derive(Clone, Debug, Default)]
pub struct Outputs {
    entries: BTreeMap<String, OutputValue>,
}

impl Outputs {
    /// Returns the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OutputValue> {
        self.entries.get(key)
    }

    /// Returns the data stored under `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Json> {
        self.get(key).and_then(OutputValue::as_json)
    }

    /// Returns the function stored under `key`.
    #[must_use]
    pub fn function(&self, key: &str) -> Option<&ScriptFunction> {
        self.get(key).and_then(OutputValue::as_function)
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OutputValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the handler returned an empty table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the outputs as a JSON object; functions become `null`.
    #[must_use]
    pub fn to_json(&self) -> Json {
        Json::Object(
            self.entries
                .iter()
                .map(|(key, value)| (key.clone(), value.as_json().cloned().unwrap_or(Json::Null)))
                .collect(),
        )
    }
}

impl From<Map<String, Json>> for Outputs {
    fn from(values: Map<String, Json>) -> Self {
        Self {
            entries: values
                .into_iter()
                .map(|(key, value)| (key, OutputValue::Value(value)))
                .collect(),
        }
    }
}

impl IntoIterator for Outputs {
    type Item = (String, OutputValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, OutputValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Why a script value is not an output table.
#[derive(Debug)]
pub(crate) enum ShapeError {
    /// The value is neither a table nor nil.
    NotATable(&'static str),
    /// A key is neither a string nor an integer.
    Key(&'static str),
    /// A nested value failed to convert.
    Lua(mlua::Error),
}

impl ShapeError {
    /// Describes the offending value for error messages.
    pub(crate) fn found(&self) -> String {
        match self {
            Self::NotATable(kind) => format!("a value of type {kind}"),
            Self::Key(kind) => format!("a table with a {kind} key"),
            Self::Lua(err) => format!("an unconvertible table ({err})"),
        }
    }
}

/// Converts a handler's return value. `nil` means "no outputs".
pub(crate) fn outputs_from_lua(lua: &Lua, value: Value) -> Result<Option<Outputs>, ShapeError> {
    let table = match value {
        Value::Nil => return Ok(None),
        Value::Table(table) => table,
        other => return Err(ShapeError::NotATable(other.type_name())),
    };

    let mut entries = BTreeMap::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair.map_err(ShapeError::Lua)?;
        let key = match key {
            Value::String(key) => key.to_string_lossy(),
            Value::Integer(key) => key.to_string(),
            other => return Err(ShapeError::Key(other.type_name())),
        };
        let value = match value {
            Value::Function(function) => OutputValue::Function(ScriptFunction::new(lua, function)),
            other => OutputValue::Value(lua_to_json(&other).map_err(ShapeError::Lua)?),
        };
        entries.insert(key, value);
    }
    Ok(Some(Outputs { entries }))
}

/// Converts a script value to JSON. Functions and other opaque values become `null`.
pub(crate) fn lua_to_json(value: &Value) -> mlua::Result<Json> {
    to_json(value, 0)
}

fn to_json(value: &Value, depth: usize) -> mlua::Result<Json> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::runtime(
            "value nests too deeply to convert (is it self-referential?)",
        ));
    }
    Ok(match value {
        Value::Boolean(flag) => Json::Bool(*flag),
        Value::Integer(int) => Json::from(*int),
        Value::Number(num) => Number::from_f64(*num).map_or(Json::Null, Json::Number),
        Value::String(text) => Json::String(text.to_string_lossy()),
        Value::Table(table) => table_to_json(table, depth)?,
        _ => Json::Null,
    })
}

fn table_to_json(table: &Table, depth: usize) -> mlua::Result<Json> {
    let mut pairs = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        pairs.push(pair?);
    }

    let len = table.raw_len();
    let is_sequence = !pairs.is_empty()
        && pairs.len() == len
        && pairs.iter().all(|(key, _)| match key {
            Value::Integer(index) => {
                usize::try_from(*index).is_ok_and(|index| (1..=len).contains(&index))
            }
            _ => false,
        });

    if is_sequence {
        let mut items = vec![Json::Null; len];
        for (key, value) in &pairs {
            if let Value::Integer(index) = key {
                let slot = usize::try_from(*index - 1).map_err(mlua::Error::external)?;
                items[slot] = to_json(value, depth + 1)?;
            }
        }
        return Ok(Json::Array(items));
    }

    let mut object = Map::new();
    for (key, value) in &pairs {
        let key = match key {
            Value::String(key) => key.to_string_lossy(),
            Value::Integer(key) => key.to_string(),
            _ => continue,
        };
        object.insert(key, to_json(value, depth + 1)?);
    }
    Ok(Json::Object(object))
}

/// Converts JSON into a script value; `null` becomes `nil`.
pub(crate) fn json_to_lua(lua: &Lua, value: &Json) -> mlua::Result<Value> {
    Ok(match value {
        Json::Null => Value::Nil,
        Json::Bool(flag) => Value::Boolean(*flag),
        Json::Number(num) => match num.as_i64() {
            Some(int) => Value::Integer(int),
            None => Value::Number(num.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(text) => Value::String(lua.create_string(text)?),
        Json::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        Json::Object(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (key, item) in entries {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequences_become_arrays_and_maps_become_objects() {
        let lua = Lua::new();
        let value: Value = lua
            .load(r#"return { list = { 1, 2.5, "x" }, empty = {}, flag = true, [3] = "three" }"#)
            .eval()
            .unwrap();

        assert_eq!(
            lua_to_json(&value).unwrap(),
            json!({ "list": [1, 2.5, "x"], "empty": {}, "flag": true, "3": "three" })
        );
    }

    #[test]
    fn json_round_trips_through_tables() {
        let lua = Lua::new();
        let original = json!({ "name": "x", "sizes": [1, 2], "nested": { "ok": false } });
        let value = json_to_lua(&lua, &original).unwrap();
        assert_eq!(lua_to_json(&value).unwrap(), original);
    }

    #[test]
    fn self_referential_tables_are_rejected() {
        let lua = Lua::new();
        let value: Value = lua.load("local t = {}; t.me = t; return t").eval().unwrap();
        assert!(lua_to_json(&value).is_err());
    }

    #[test]
    fn output_tables_keep_top_level_functions() {
        let lua = Lua::new();
        let value: Value = lua
            .load("return { total = 3, read = function() return 3 end, nested = { f = print } }")
            .eval()
            .unwrap();

        let outputs = outputs_from_lua(&lua, value).unwrap().unwrap();
        assert_eq!(outputs.value("total"), Some(&json!(3)));
        assert!(outputs.function("read").is_some());
        assert_eq!(outputs.value("nested"), Some(&json!({ "f": null })));
        assert_eq!(outputs.to_json()["read"], Json::Null);
    }

    #[test]
    fn non_table_returns_are_shape_errors() {
        let lua = Lua::new();
        let err = outputs_from_lua(&lua, Value::Integer(7)).unwrap_err();
        assert_eq!(err.found(), "a value of type integer");

        let value: Value = lua.load("return { [true] = 1 }").eval().unwrap();
        let err = outputs_from_lua(&lua, value).unwrap_err();
        assert_eq!(err.found(), "a table with a boolean key");

        assert!(outputs_from_lua(&lua, Value::Nil).unwrap().is_none());
    }
}
