//! Host capabilities exposed to every script realm.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use http::Method;
use mlua::{Function, Lua, LuaOptions, Table, Value, Variadic};
use serde_json::Value as Json;
use toolbox_capabilities::{FetchRequest, FetchResponse, Fetcher};
use toolbox_primitives::ToolId;
use url::Url;

use crate::context::{copy_intrinsics, safe_libs};
use crate::log::{LogLevel, LogLine, LogSink};
use crate::value::{json_to_lua, lua_to_json};

/// Screen geometry reported to scripts as `display`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayInfo {
    /// Width in logical pixels.
    pub width: u32,
    /// Height in logical pixels.
    pub height: u32,
    /// Physical pixels per logical pixel.
    pub pixel_ratio: f64,
}

pub(crate) struct HostBindings {
    pub(crate) tool_id: ToolId,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) log_sink: Arc<dyn LogSink>,
    pub(crate) display: Option<DisplayInfo>,
}

pub(crate) fn install(lua: &Lua, env: &Table, host: &HostBindings) -> mlua::Result<()> {
    install_timers(lua, env)?;
    install_fetch(lua, env, Arc::clone(&host.fetcher))?;
    install_blob(lua, env)?;
    install_url(lua, env)?;
    install_worker(lua, env)?;
    install_base64(lua, env)?;
    install_introspection(lua, env, host.display)?;
    install_console(lua, env, host.tool_id, &host.log_sink)?;
    install_json(lua, env)
}

fn install_timers(lua: &Lua, env: &Table) -> mlua::Result<()> {
    env.raw_set(
        "sleep",
        lua.create_async_function(|_, ms: f64| async move {
            tokio::time::sleep(sleep_duration(ms)?).await;
            Ok(())
        })?,
    )?;
    env.raw_set(
        "now",
        lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?,
    )
}

/// Negative and NaN delays sleep for zero; delays past `Duration::MAX` raise.
fn sleep_duration(ms: f64) -> mlua::Result<Duration> {
    if ms.is_nan() || ms <= 0.0 {
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .map_err(|_| mlua::Error::runtime(format!("sleep duration of {ms} ms is out of range")))
}

fn install_fetch(lua: &Lua, env: &Table, fetcher: Arc<dyn Fetcher>) -> mlua::Result<()> {
    let fetch = lua.create_async_function(move |lua, (url, options): (String, Option<Table>)| {
        let fetcher = Arc::clone(&fetcher);
        let request = fetch_request(&url, options.as_ref());
        async move {
            let response = fetcher
                .fetch(request?)
                .await
                .map_err(mlua::Error::external)?;
            response_table(&lua, &response)
        }
    })?;
    env.raw_set("fetch", fetch)
}

fn fetch_request(url: &str, options: Option<&Table>) -> mlua::Result<FetchRequest> {
    let parsed = Url::parse(url)
        .map_err(|err| mlua::Error::runtime(format!("invalid URL `{url}`: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(mlua::Error::runtime(format!(
            "fetch supports only http and https URLs, got `{url}`"
        )));
    }

    let mut request = FetchRequest::get(url);
    let Some(options) = options else {
        return Ok(request);
    };
    if let Some(method) = options.get::<Option<String>>("method")? {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(mlua::Error::external)?;
        request = request.with_method(method);
    }
    if let Some(headers) = options.get::<Option<Table>>("headers")? {
        for pair in headers.pairs::<String, String>() {
            let (name, value) = pair?;
            request = request.with_header(name, value);
        }
    }
    if let Some(body) = options.get::<Option<mlua::String>>("body")? {
        request = request.with_body(body.as_bytes().to_vec());
    }
    Ok(request)
}

fn response_table(lua: &Lua, response: &FetchResponse) -> mlua::Result<Table> {
    let headers = lua.create_table()?;
    for (name, value) in response.headers() {
        headers.raw_set(name.as_str(), value.as_str())?;
    }
    let table = lua.create_table()?;
    table.raw_set("ok", response.is_success())?;
    table.raw_set("status", response.status())?;
    table.raw_set("url", response.url())?;
    table.raw_set("headers", headers)?;
    table.raw_set("body", lua.create_string(response.body())?)?;
    Ok(table)
}

fn install_blob(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let blob = lua.create_function(|lua, (data, kind): (mlua::String, Option<String>)| {
        let blob = lua.create_table()?;
        blob.raw_set("size", data.as_bytes().len())?;
        blob.raw_set("type", kind.unwrap_or_default())?;
        blob.raw_set("data", data)?;
        Ok(blob)
    })?;
    env.raw_set("blob", blob)
}

fn install_url(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.raw_set(
        "parse",
        lua.create_function(|lua, text: String| {
            let url = parse_url(&text)?;
            let parts = lua.create_table()?;
            parts.raw_set("href", url.as_str())?;
            parts.raw_set("scheme", url.scheme())?;
            parts.raw_set("host", url.host_str())?;
            parts.raw_set("port", url.port_or_known_default())?;
            parts.raw_set("path", url.path())?;
            parts.raw_set("query", url.query())?;
            parts.raw_set("fragment", url.fragment())?;
            Ok(parts)
        })?,
    )?;
    module.raw_set(
        "join",
        lua.create_function(|_, (base, relative): (String, String)| {
            let joined = parse_url(&base)?
                .join(&relative)
                .map_err(|err| mlua::Error::runtime(format!("cannot join `{relative}`: {err}")))?;
            Ok(joined.to_string())
        })?,
    )?;
    module.raw_set(
        "data",
        lua.create_function(|_, (data, kind): (mlua::String, Option<String>)| {
            let kind = kind.unwrap_or_else(|| "application/octet-stream".to_owned());
            Ok(format!("data:{kind};base64,{}", STANDARD.encode(&*data.as_bytes())))
        })?,
    )?;
    env.raw_set("url", module)
}

fn parse_url(text: &str) -> mlua::Result<Url> {
    Url::parse(text).map_err(|err| mlua::Error::runtime(format!("invalid URL `{text}`: {err}")))
}

struct WorkerState {
    lua: Lua,
    on_message: Function,
}

fn start_worker(source: &str) -> mlua::Result<WorkerState> {
    let lua = Lua::new_with(safe_libs(), LuaOptions::new())?;
    let env = lua.create_table()?;
    copy_intrinsics(&lua, &env)?;
    install_json(&lua, &env)?;
    lua.load(source)
        .set_name("=worker")
        .set_environment(env.clone())
        .exec()?;
    match env.raw_get::<Value>("on_message")? {
        Value::Function(on_message) => Ok(WorkerState { lua, on_message }),
        other => Err(mlua::Error::runtime(format!(
            "worker source must define an `on_message` function, found {}",
            other.type_name()
        ))),
    }
}

fn install_worker(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let worker = lua.create_function(|lua, source: String| {
        let state = Arc::new(Mutex::new(Some(start_worker(&source)?)));
        let handle = lua.create_table()?;

        let posted = Arc::clone(&state);
        handle.raw_set(
            "post",
            lua.create_async_function(move |lua, message: Value| {
                let state = Arc::clone(&posted);
                let message = lua_to_json(&message);
                async move {
                    let message = message?;
                    let reply = tokio::task::spawn_blocking(move || -> mlua::Result<Json> {
                        let guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                        let worker = guard
                            .as_ref()
                            .ok_or_else(|| mlua::Error::runtime("worker has been terminated"))?;
                        let argument = json_to_lua(&worker.lua, &message)?;
                        let reply: Value = worker.on_message.call(argument)?;
                        lua_to_json(&reply)
                    })
                    .await
                    .map_err(mlua::Error::external)??;
                    json_to_lua(&lua, &reply)
                }
            })?,
        )?;
        handle.raw_set(
            "terminate",
            lua.create_function(move |_, ()| {
                state.lock().unwrap_or_else(PoisonError::into_inner).take();
                Ok(())
            })?,
        )?;
        Ok(handle)
    })?;
    env.raw_set("worker", worker)
}

fn install_base64(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.raw_set(
        "encode",
        lua.create_function(|_, data: mlua::String| Ok(STANDARD.encode(&*data.as_bytes())))?,
    )?;
    module.raw_set(
        "decode",
        lua.create_function(|lua, text: String| {
            let bytes = STANDARD
                .decode(text.trim())
                .map_err(|err| mlua::Error::runtime(format!("invalid base64: {err}")))?;
            lua.create_string(bytes)
        })?,
    )?;
    env.raw_set("base64", module)
}

fn install_introspection(lua: &Lua, env: &Table, display: Option<DisplayInfo>) -> mlua::Result<()> {
    let device = lua.create_table()?;
    device.raw_set("os", std::env::consts::OS)?;
    device.raw_set("arch", std::env::consts::ARCH)?;
    device.raw_set("family", std::env::consts::FAMILY)?;
    device.raw_set(
        "cpus",
        std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
    )?;
    env.raw_set("device", device)?;

    if let Some(display) = display {
        let table = lua.create_table()?;
        table.raw_set("width", display.width)?;
        table.raw_set("height", display.height)?;
        table.raw_set("pixel_ratio", display.pixel_ratio)?;
        env.raw_set("display", table)?;
    }
    Ok(())
}

fn install_console(
    lua: &Lua,
    env: &Table,
    tool_id: ToolId,
    sink: &Arc<dyn LogSink>,
) -> mlua::Result<()> {
    let console = lua.create_table()?;
    for (name, level) in [
        ("log", LogLevel::Info),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("debug", LogLevel::Debug),
    ] {
        console.raw_set(name, log_function(lua, tool_id, level, Arc::clone(sink))?)?;
    }
    env.raw_set("console", console)?;
    env.raw_set("print", log_function(lua, tool_id, LogLevel::Info, Arc::clone(sink))?)
}

fn log_function(
    lua: &Lua,
    tool_id: ToolId,
    level: LogLevel,
    sink: Arc<dyn LogSink>,
) -> mlua::Result<Function> {
    lua.create_function(move |_, args: Variadic<Value>| {
        let message = args.iter().map(render).collect::<Vec<_>>().join(" ");
        sink.log(&LogLine {
            tool_id,
            level,
            message,
        });
        Ok(())
    })
}

fn render(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_owned(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(int) => int.to_string(),
        Value::Number(num) => num.to_string(),
        Value::String(text) => text.to_string_lossy(),
        Value::Table(_) => lua_to_json(value).map_or_else(|_| "<table>".to_owned(), |json| json.to_string()),
        other => format!("<{}>", other.type_name()),
    }
}

pub(crate) fn install_json(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let module = lua.create_table()?;
    module.raw_set(
        "encode",
        lua.create_function(|_, value: Value| Ok(lua_to_json(&value)?.to_string()))?,
    )?;
    module.raw_set(
        "decode",
        lua.create_function(|lua, text: String| {
            let value: Json = serde_json::from_str(&text)
                .map_err(|err| mlua::Error::runtime(format!("invalid JSON: {err}")))?;
            json_to_lua(lua, &value)
        })?,
    )?;
    env.raw_set("json", module)
}
