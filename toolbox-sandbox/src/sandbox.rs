//! A tool's long-lived script realm and its bound handler.

use std::fmt;
use std::sync::Arc;

use mlua::{Function, Lua, LuaOptions, Table, Value};
use toolbox_capabilities::{CapabilityLoader, Fetcher, LoadObserver};
use toolbox_primitives::ToolDefinition;
use tracing::{debug, error};

use crate::context::{self, safe_libs};
use crate::error::{SandboxError, SandboxResult};
use crate::host::{DisplayInfo, HostBindings};
use crate::log::{LogSink, TracingLogSink};
use crate::overrides::ContextOverrides;
use crate::value::{Inputs, Outputs, UpdateCallback, json_to_lua, outputs_from_lua};

/// Name of the entry point a script binds.
const HANDLER: &str = "handler";

/// Where a callable entry point was found.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryPointSource {
    /// The chunk returned a function.
    Returned,
    /// The chunk returned a table with a `handler` field.
    ReturnedTable,
    /// The script assigned the global `handler`.
    Global,
}

/// Outcome of evaluating the script body once.
#[derive(Clone)]
pub enum HandlerBinding {
    /// A function to invoke on every run.
    Callable {
        /// The entry point.
        function: Function,
        /// Where it was found.
        source: EntryPointSource,
    },
    /// Nothing was bound.
    Missing,
    /// Something other than a function was bound.
    NotCallable {
        /// Lua type name of the bound value.
        found: &'static str,
    },
}

impl HandlerBinding {
    fn resolve(returned: Value, globals: &Table) -> mlua::Result<Self> {
        match returned {
            Value::Function(function) => {
                return Ok(Self::Callable {
                    function,
                    source: EntryPointSource::Returned,
                });
            }
            Value::Table(table) => {
                let handler: Value = table.raw_get(HANDLER)?;
                if !handler.is_nil() {
                    return Ok(Self::classify(handler, EntryPointSource::ReturnedTable));
                }
            }
            _ => {}
        }
        // Plain assignments and writes through `_G` both land in `globals`; the
        // lookup falls back to the context for handlers supplied as overrides.
        Ok(Self::classify(globals.get(HANDLER)?, EntryPointSource::Global))
    }

    fn classify(value: Value, source: EntryPointSource) -> Self {
        match value {
            Value::Nil => Self::Missing,
            Value::Function(function) => Self::Callable { function, source },
            other => Self::NotCallable {
                found: other.type_name(),
            },
        }
    }

    /// Returns `true` when runs can invoke the entry point.
    #[must_use]
    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Callable { .. })
    }

    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Callable {
                source: EntryPointSource::Returned,
                ..
            } => "returned function",
            Self::Callable {
                source: EntryPointSource::ReturnedTable,
                ..
            } => "returned table",
            Self::Callable {
                source: EntryPointSource::Global,
                ..
            } => "global handler",
            Self::Missing => "missing",
            Self::NotCallable { found } => *found,
        }
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callable { source, .. } => f
                .debug_struct("Callable")
                .field("source", source)
                .finish_non_exhaustive(),
            Self::Missing => f.write_str("Missing"),
            Self::NotCallable { found } => {
                f.debug_struct("NotCallable").field("found", found).finish()
            }
        }
    }
}

/// One compiled tool script with persistent top-level state.
///
/// The script body is evaluated exactly once, at construction. Every run calls
/// the same entry point, so locals and upvalues survive between runs.
pub struct Sandbox {
    definition: ToolDefinition,
    lua: Lua,
    globals: Table,
    binding: HandlerBinding,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("tool_id", &self.definition.id())
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Starts building a sandbox for `definition`.
    #[must_use]
    pub fn builder(definition: ToolDefinition) -> SandboxBuilder {
        SandboxBuilder::new(definition)
    }

    /// Returns the definition the sandbox was built from.
    #[must_use]
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Returns what evaluating the script bound as its entry point.
    #[must_use]
    pub fn binding(&self) -> &HandlerBinding {
        &self.binding
    }

    /// Invokes the entry point with `(inputs, changed, update, globals)`.
    ///
    /// `changed` is `None` on the first run. `update` receives partial outputs the
    /// handler pushes before it returns.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::MissingEntryPoint`] when the script bound no handler.
    /// - [`SandboxError::InvalidEntryPoint`] when the binding is not a function.
    /// - [`SandboxError::InvalidReturnShape`] when the handler returns a non-table.
    /// - [`SandboxError::Script`] for anything the handler raises.
    pub async fn run(
        &self,
        inputs: &Inputs,
        changed: Option<&str>,
        update: Option<UpdateCallback>,
    ) -> SandboxResult<Option<Outputs>> {
        let handler = match &self.binding {
            HandlerBinding::Callable { function, .. } => function,
            HandlerBinding::Missing => {
                return Err(SandboxError::MissingEntryPoint { tool: self.label() });
            }
            HandlerBinding::NotCallable { found } => {
                return Err(SandboxError::InvalidEntryPoint {
                    tool: self.label(),
                    found: *found,
                });
            }
        };

        let inputs = self.inputs_table(inputs)?;
        let update = self.update_function(update)?;
        let returned: Value = handler
            .call_async((inputs, changed, update, self.globals.clone()))
            .await
            .map_err(|err| {
                error!(tool_id = %self.definition.id(), error = %err, "handler raised");
                SandboxError::Script(err)
            })?;

        outputs_from_lua(&self.lua, returned).map_err(|shape| SandboxError::InvalidReturnShape {
            tool: self.label(),
            found: shape.found(),
        })
    }

    fn label(&self) -> String {
        self.definition
            .name()
            .map_or_else(|| self.definition.id().to_string(), str::to_owned)
    }

    fn inputs_table(&self, inputs: &Inputs) -> mlua::Result<Table> {
        let table = self.lua.create_table_with_capacity(0, inputs.len())?;
        for (key, value) in inputs {
            table.raw_set(key.as_str(), json_to_lua(&self.lua, value)?)?;
        }
        Ok(table)
    }

    fn update_function(&self, callback: Option<UpdateCallback>) -> mlua::Result<Function> {
        self.lua.create_function(move |lua, partial: Value| {
            match outputs_from_lua(lua, partial) {
                Ok(Some(outputs)) => {
                    if let Some(callback) = &callback {
                        callback(outputs);
                    }
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(shape) => Err(mlua::Error::runtime(format!(
                    "update expects a table of outputs, got {}",
                    shape.found()
                ))),
            }
        })
    }
}

/// Builder for [`Sandbox`].
pub struct SandboxBuilder {
    definition: ToolDefinition,
    loader: Option<CapabilityLoader>,
    load_observer: Option<Arc<dyn LoadObserver>>,
    overrides: ContextOverrides,
    log_sink: Option<Arc<dyn LogSink>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    display: Option<DisplayInfo>,
}

impl SandboxBuilder {
    fn new(definition: ToolDefinition) -> Self {
        Self {
            definition,
            loader: None,
            load_observer: None,
            overrides: ContextOverrides::default(),
            log_sink: None,
            fetcher: None,
            display: None,
        }
    }

    /// Sets the capability loader behind `require`. Defaults to the built-in registry.
    #[must_use]
    pub fn loader(mut self, loader: CapabilityLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Reports this sandbox's capability loads to `observer`; the loader's cache is
    /// still shared.
    #[must_use]
    pub fn load_observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.load_observer = Some(observer);
        self
    }

    /// Merges caller-supplied bindings last.
    #[must_use]
    pub fn overrides(mut self, overrides: ContextOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Sets where `console` lines go. Defaults to [`TracingLogSink`].
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Sets the fetcher behind the script `fetch`. Defaults to the loader's fetcher.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Reports display geometry to scripts; without it `display` is `nil`.
    #[must_use]
    pub fn display(mut self, display: DisplayInfo) -> Self {
        self.display = Some(display);
        self
    }

    /// Builds the context and evaluates the script body once.
    ///
    /// A script without an entry point still builds; the problem surfaces on the
    /// first run.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Script`] when the script fails to compile or raises
    /// while its body runs.
    pub async fn build(self) -> SandboxResult<Sandbox> {
        let Self {
            definition,
            loader,
            load_observer,
            overrides,
            log_sink,
            fetcher,
            display,
        } = self;

        let mut loader = loader.unwrap_or_else(|| CapabilityLoader::builder().build());
        if let Some(observer) = load_observer {
            loader = loader.with_observer(observer);
        }
        let host = HostBindings {
            tool_id: definition.id(),
            fetcher: fetcher.unwrap_or_else(|| loader.fetcher()),
            log_sink: log_sink.unwrap_or_else(|| Arc::new(TracingLogSink)),
            display,
        };

        let lua = Lua::new_with(safe_libs(), LuaOptions::new())?;
        let context = context::build(&lua, &host, &loader, &overrides)?;

        let globals = context::scope(&lua, &context)?;

        let returned: Value = lua
            .load(definition.script())
            .set_name(definition.chunk_name())
            .set_environment(globals.clone())
            .eval_async()
            .await
            .map_err(|err| {
                error!(tool_id = %definition.id(), error = %err, "script body raised");
                SandboxError::Script(err)
            })?;
        let binding = HandlerBinding::resolve(returned, &globals)?;
        debug!(
            tool_id = %definition.id(),
            entry_point = binding.describe(),
            "sandbox ready"
        );

        Ok(Sandbox {
            definition,
            lua,
            globals,
            binding,
        })
    }
}
