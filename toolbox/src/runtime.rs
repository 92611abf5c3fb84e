//! Builds loaders, sandboxes, and kernels from one configuration.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use toolbox_capabilities::{CapabilityLoader, CapabilityRegistry, Fetcher, LoadObserver};
use toolbox_config::{ConfigError, ToolboxConfig};
use toolbox_kernel::{RunObserver, ToolKernel, TracingRunObserver};
use toolbox_primitives::ToolDefinition;
use toolbox_sandbox::{ContextOverrides, DisplayInfo, LogSink, Sandbox, SandboxError};
use tracing::debug;

/// Errors raised by the facade.
#[derive(Debug, Error)]
pub enum ToolboxError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A tool's sandbox could not be built.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Tracing could not be initialised.
    #[cfg(feature = "telemetry")]
    #[error(transparent)]
    Telemetry(#[from] toolbox_telemetry::TelemetryError),
}

/// Result alias for facade operations.
pub type ToolboxResult<T> = Result<T, ToolboxError>;

/// Shared runtime that turns tool definitions into scheduled kernels.
///
/// Every sandbox built by one `Toolbox` shares its capability cache, so a
/// capability is loaded once no matter how many tools require it.
#[derive(Clone)]
pub struct Toolbox {
    config: Arc<ToolboxConfig>,
    loader: CapabilityLoader,
    run_observer: Arc<dyn RunObserver>,
    log_sink: Option<Arc<dyn LogSink>>,
    display: Option<DisplayInfo>,
}

impl fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolbox")
            .field("config", &self.config)
            .field("loader", &self.loader)
            .field("display", &self.display)
            .finish_non_exhaustive()
    }
}

impl Toolbox {
    /// Starts building a runtime from `config`.
    #[must_use]
    pub fn builder(config: ToolboxConfig) -> ToolboxBuilder {
        ToolboxBuilder::new(config)
    }

    /// Builds a runtime with default collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`ToolboxError::Config`] when `config` fails validation.
    pub fn from_config(config: ToolboxConfig) -> ToolboxResult<Self> {
        Self::builder(config).build()
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &ToolboxConfig {
        &self.config
    }

    /// Returns the shared capability loader.
    #[must_use]
    pub fn loader(&self) -> &CapabilityLoader {
        &self.loader
    }

    /// Installs the global tracing subscriber from the `logging` section.
    ///
    /// # Errors
    ///
    /// Returns [`ToolboxError::Telemetry`] for a bad filter or a second call.
    #[cfg(feature = "telemetry")]
    pub fn init_tracing(&self) -> ToolboxResult<()> {
        toolbox_telemetry::init_tracing(&self.config.logging)?;
        Ok(())
    }

    /// Evaluates a tool's script in a fresh sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`ToolboxError::Sandbox`] when the script fails to compile or
    /// raises while its body runs.
    pub async fn sandbox(&self, definition: ToolDefinition) -> ToolboxResult<Sandbox> {
        self.sandbox_with(definition, ContextOverrides::default())
            .await
    }

    /// Like [`Toolbox::sandbox`], merging `overrides` into the script context.
    ///
    /// # Errors
    ///
    /// See [`Toolbox::sandbox`].
    pub async fn sandbox_with(
        &self,
        definition: ToolDefinition,
        overrides: ContextOverrides,
    ) -> ToolboxResult<Sandbox> {
        let mut builder = Sandbox::builder(definition)
            .loader(self.loader.clone())
            .overrides(overrides);
        if let Some(sink) = &self.log_sink {
            builder = builder.log_sink(Arc::clone(sink));
        }
        if let Some(display) = self.display {
            builder = builder.display(display);
        }
        Ok(builder.build().await?)
    }

    /// Builds a sandbox and places it behind a scheduler using the configured
    /// strategy.
    ///
    /// # Errors
    ///
    /// See [`Toolbox::sandbox`].
    pub async fn kernel(&self, definition: ToolDefinition) -> ToolboxResult<ToolKernel> {
        self.kernel_with(definition, ContextOverrides::default())
            .await
    }

    /// Like [`Toolbox::kernel`], merging `overrides` into the script context.
    ///
    /// # Errors
    ///
    /// See [`Toolbox::sandbox`].
    pub async fn kernel_with(
        &self,
        definition: ToolDefinition,
        overrides: ContextOverrides,
    ) -> ToolboxResult<ToolKernel> {
        let tool_id = definition.id();
        let sandbox = self.sandbox_with(definition, overrides).await?;
        let strategy = self.config.scheduler.strategy;
        debug!(%tool_id, %strategy, "tool kernel ready");
        Ok(ToolKernel::with_observer(
            sandbox,
            strategy,
            Arc::clone(&self.run_observer),
        ))
    }
}

/// Builder for [`Toolbox`].
#[must_use]
pub struct ToolboxBuilder {
    config: ToolboxConfig,
    registry: Option<CapabilityRegistry>,
    fetcher: Option<Arc<dyn Fetcher>>,
    load_observer: Option<Arc<dyn LoadObserver>>,
    run_observer: Arc<dyn RunObserver>,
    log_sink: Option<Arc<dyn LogSink>>,
    display: Option<DisplayInfo>,
    assets: Vec<(String, Vec<u8>)>,
}

impl ToolboxBuilder {
    fn new(config: ToolboxConfig) -> Self {
        Self {
            config,
            registry: None,
            fetcher: None,
            load_observer: None,
            run_observer: Arc::new(TracingRunObserver),
            log_sink: None,
            display: None,
            assets: Vec::new(),
        }
    }

    /// Replaces the built-in capability registry.
    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the fetcher used for remote capabilities and the script `fetch`.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Reports capability loads to `observer`.
    pub fn load_observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.load_observer = Some(observer);
        self
    }

    /// Reports run lifecycle events of every kernel to `observer`.
    pub fn run_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.run_observer = observer;
        self
    }

    /// Routes script console output to `sink`.
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Reports display geometry to every script.
    pub fn display(mut self, display: DisplayInfo) -> Self {
        self.display = Some(display);
        self
    }

    /// Registers asset bytes under a content-hashed URL below
    /// `capabilities.asset_base_url`.
    pub fn register_asset(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.assets.push((name.into(), contents.into()));
        self
    }

    /// Validates the configuration and builds the shared loader.
    ///
    /// # Errors
    ///
    /// Returns [`ToolboxError::Config`] when the configuration is invalid.
    pub fn build(self) -> ToolboxResult<Toolbox> {
        let Self {
            config,
            registry,
            fetcher,
            load_observer,
            run_observer,
            log_sink,
            display,
            assets,
        } = self;
        config.validate()?;

        let mut manifest = config.manifest();
        for (name, contents) in &assets {
            manifest.register(name.as_str(), contents);
        }
        let mut loader = CapabilityLoader::builder()
            .adapters(config.adapters_over(manifest))
            .allow_remote(config.capabilities.allow_remote);
        if let Some(registry) = registry {
            loader = loader.registry(registry);
        }
        if let Some(fetcher) = fetcher {
            loader = loader.fetcher(fetcher);
        }
        if let Some(observer) = load_observer {
            loader = loader.observer(observer);
        }

        debug!(
            strategy = %config.scheduler.strategy,
            allow_remote = config.capabilities.allow_remote,
            "toolbox runtime ready"
        );
        Ok(Toolbox {
            config: Arc::new(config),
            loader: loader.build(),
            run_observer,
            log_sink,
            display,
        })
    }
}
