//! Construction of the restricted binding table a script sees as its globals.

use mlua::{Lua, StdLib, Table, Value};
use toolbox_capabilities::CapabilityLoader;
use tracing::debug;

use crate::host::{self, HostBindings};
use crate::overrides::ContextOverrides;

/// Standard libraries opened in every realm; only the intrinsics below are exposed.
pub(crate) fn safe_libs() -> StdLib {
    StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH
}

/// Engine built-ins copied into the context.
const INTRINSICS: [&str; 23] = [
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "xpcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "getmetatable",
    "tonumber",
    "tostring",
    "type",
    "_VERSION",
    "string",
    "table",
    "math",
    "utf8",
    "coroutine",
];

/// Names under which a script's global table refers to itself.
const ALIASES: [&str; 4] = ["_G", "globalThis", "self", "window"];

/// Registry slot holding the realm's context table.
const CONTEXT_KEY: &str = "toolbox.context";
/// Registry slot holding modules already materialized in this realm.
const MODULES_KEY: &str = "toolbox.modules";

pub(crate) fn copy_intrinsics(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in INTRINSICS {
        let value: Value = globals.raw_get(name)?;
        if !value.is_nil() {
            env.raw_set(name, value)?;
        }
    }
    Ok(())
}

/// Builds a realm's context: intrinsics, host capabilities, `require`, then
/// overrides.
pub(crate) fn build(
    lua: &Lua,
    host: &HostBindings,
    loader: &CapabilityLoader,
    overrides: &ContextOverrides,
) -> mlua::Result<Table> {
    let context = lua.create_table()?;
    copy_intrinsics(lua, &context)?;
    host::install(lua, &context, host)?;
    context.raw_set("require", require_function(lua, loader.clone())?)?;
    overrides.apply(lua, &context)?;

    lua.set_named_registry_value(CONTEXT_KEY, context.clone())?;
    lua.set_named_registry_value(MODULES_KEY, lua.create_table()?)?;
    Ok(context)
}

/// Creates a global table over `context` for one script or module.
///
/// Reads fall through to the context and writes stay in the new table, so the
/// context never changes after construction. The aliases name the new table
/// unless an override already claimed them. The metatable is locked.
pub(crate) fn scope(lua: &Lua, context: &Table) -> mlua::Result<Table> {
    let scope = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.raw_set("__index", context.clone())?;
    meta.raw_set("__metatable", false)?;
    scope.set_metatable(Some(meta));
    for alias in ALIASES {
        let claimed: Value = context.raw_get(alias)?;
        if claimed.is_nil() {
            scope.raw_set(alias, scope.clone())?;
        }
    }
    Ok(scope)
}

/// `require(name)`: materializes the capability through the loader once per
/// realm, each module in its own scope over the context.
///
/// The context and module tables are read from the registry on each call; the
/// function must not capture them, as it is itself stored in the context.
fn require_function(lua: &Lua, loader: CapabilityLoader) -> mlua::Result<mlua::Function> {
    lua.create_async_function(move |lua, name: String| {
        let loader = loader.clone();
        async move {
            let modules: Table = lua.named_registry_value(MODULES_KEY)?;
            let memoized: Value = modules.raw_get(name.as_str())?;
            if !memoized.is_nil() {
                return Ok(memoized);
            }

            let context: Table = lua.named_registry_value(CONTEXT_KEY)?;
            let env = scope(&lua, &context)?;
            let module = loader
                .require(&name, &lua, &env)
                .await
                .map_err(mlua::Error::external)?;
            debug!(capability = %name, "capability materialized");
            modules.raw_set(name.as_str(), module.clone())?;
            Ok(module)
        }
    })
}
