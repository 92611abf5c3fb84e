//! Native packages embedded in every registry built with [`CapabilityRegistry::builtin`].
//!
//! [`CapabilityRegistry::builtin`]: crate::CapabilityRegistry::builtin

use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use mlua::{Lua, Value};
use sha2::{Digest, Sha256, Sha512};
use uuid::Uuid;

use crate::registry::NativeModule;

/// `hash`: hex digests over strings.
pub struct HashModule;

impl NativeModule for HashModule {
    fn install(&self, lua: &Lua) -> mlua::Result<Value> {
        let module = lua.create_table()?;
        module.set(
            "sha256",
            lua.create_function(|_, data: mlua::String| {
                Ok(hex::encode(Sha256::digest(&*data.as_bytes())))
            })?,
        )?;
        module.set(
            "sha512",
            lua.create_function(|_, data: mlua::String| {
                Ok(hex::encode(Sha512::digest(&*data.as_bytes())))
            })?,
        )?;
        Ok(Value::Table(module))
    }
}

/// `uuid`: random identifiers and validation.
pub struct UuidModule;

impl NativeModule for UuidModule {
    fn install(&self, lua: &Lua) -> mlua::Result<Value> {
        let module = lua.create_table()?;
        module.set(
            "v4",
            lua.create_function(|_, ()| Ok(Uuid::new_v4().to_string()))?,
        )?;
        module.set(
            "parse",
            lua.create_function(|_, text: String| {
                Uuid::parse_str(&text)
                    .map(|uuid| uuid.hyphenated().to_string())
                    .map_err(mlua::Error::external)
            })?,
        )?;
        Ok(Value::Table(module))
    }
}

/// `datetime`: wall-clock helpers over epoch milliseconds and RFC 3339 text.
pub struct DateTimeModule;

impl NativeModule for DateTimeModule {
    fn install(&self, lua: &Lua) -> mlua::Result<Value> {
        let module = lua.create_table()?;
        module.set(
            "now",
            lua.create_function(|_, ()| {
                Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            })?,
        )?;
        module.set(
            "format",
            lua.create_function(|_, (millis, pattern): (i64, Option<String>)| {
                let timestamp = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                    mlua::Error::RuntimeError(format!("timestamp {millis} is out of range"))
                })?;
                let Some(pattern) = pattern else {
                    return Ok(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
                };
                let mut text = String::new();
                write!(text, "{}", timestamp.format(&pattern)).map_err(|_| {
                    mlua::Error::RuntimeError(format!("invalid datetime pattern `{pattern}`"))
                })?;
                Ok(text)
            })?,
        )?;
        module.set(
            "parse",
            lua.create_function(|_, text: String| {
                DateTime::parse_from_rfc3339(&text)
                    .map(|timestamp| timestamp.timestamp_millis())
                    .map_err(mlua::Error::external)
            })?,
        )?;
        Ok(Value::Table(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Table;

    fn install(module: &dyn NativeModule) -> (Lua, Table) {
        let lua = Lua::new();
        let Value::Table(table) = module.install(&lua).unwrap() else {
            panic!("module should be a table");
        };
        (lua, table)
    }

    #[test]
    fn hash_matches_known_digest() {
        let (_lua, module) = install(&HashModule);
        let sha256: mlua::Function = module.get("sha256").unwrap();
        let digest: String = sha256.call("abc").unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn uuid_parse_normalizes() {
        let (_lua, module) = install(&UuidModule);
        let parse: mlua::Function = module.get("parse").unwrap();
        let parsed: String = parse.call("67E55044-10B1-426F-9247-BB680E5FE0C8").unwrap();
        assert_eq!(parsed, "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert!(parse.call::<String>("nope").is_err());
    }

    #[test]
    fn datetime_round_trips_millis() {
        let (_lua, module) = install(&DateTimeModule);
        let format: mlua::Function = module.get("format").unwrap();
        let parse: mlua::Function = module.get("parse").unwrap();
        let text: String = format.call(1_700_000_000_123_i64).unwrap();
        assert_eq!(text, "2023-11-14T22:13:20.123Z");
        let millis: i64 = parse.call(text).unwrap();
        assert_eq!(millis, 1_700_000_000_123);

        let year: String = format.call((0_i64, "%Y")).unwrap();
        assert_eq!(year, "1970");
    }
}
