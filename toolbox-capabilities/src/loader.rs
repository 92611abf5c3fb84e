//! Name resolution, caching, and per-realm materialization of capabilities.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use mlua::{Lua, Table, Value};
use toolbox_primitives::{CapabilityName, CapabilityOrigin};
use tracing::{debug, warn};

use crate::adapters::{AdapterSet, AssetAdapter};
use crate::error::{CapabilityError, CapabilityResult};
use crate::fetch::{FetchRequest, Fetcher, HttpFetcher};
use crate::registry::{CapabilityRegistry, ModuleExports};

/// Observer notified around every uncached load.
pub trait LoadObserver: Send + Sync {
    /// Called before a name that is not cached starts loading.
    fn on_start(&self, name: &str);

    /// Called once the load finished, successfully or not.
    fn on_end(&self, name: &str, error: Option<&CapabilityError>);
}

/// Observer that reports loads through `tracing`.
#[derive(Debug, Default)]
pub struct TracingLoadObserver;

impl LoadObserver for TracingLoadObserver {
    fn on_start(&self, name: &str) {
        debug!(capability = name, "capability load started");
    }

    fn on_end(&self, name: &str, error: Option<&CapabilityError>) {
        match error {
            None => debug!(capability = name, "capability loaded"),
            Some(err) => warn!(capability = name, error = %err, "capability load failed"),
        }
    }
}

/// A resolved capability shared by every realm that requires it.
#[derive(Debug)]
pub struct LoadedCapability {
    name: String,
    exports: ModuleExports,
    adapter: Option<AssetAdapter>,
}

impl LoadedCapability {
    /// Returns the name the capability was resolved under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the realm-independent exports.
    #[must_use]
    pub fn exports(&self) -> &ModuleExports {
        &self.exports
    }

    /// Returns the asset adapter applied after materialization, if any.
    #[must_use]
    pub fn adapter(&self) -> Option<&AssetAdapter> {
        self.adapter.as_ref()
    }

    /// Builds the module value inside `lua`.
    ///
    /// Script modules run with `scope` as their environment. The raw value is
    /// normalized (a table's `default` field wins) before the adapter runs.
    ///
    /// # Errors
    ///
    /// Propagates errors raised by the module body or its adapter.
    pub async fn materialize(&self, lua: &Lua, scope: &Table) -> mlua::Result<Value> {
        let raw = match &self.exports {
            ModuleExports::Native(module) => module.install(lua)?,
            ModuleExports::Script { chunk_name, source } => {
                lua.load(&**source)
                    .set_name(format!("={chunk_name}"))
                    .set_environment(scope.clone())
                    .eval_async()
                    .await?
            }
        };

        let module = normalize(raw)?;
        match &self.adapter {
            Some(adapter) => adapter.apply(lua, module, scope),
            None => Ok(module),
        }
    }
}

/// Collapses the "default export" shape onto the module itself.
fn normalize(module: Value) -> mlua::Result<Value> {
    if let Value::Table(table) = &module {
        let default: Value = table.raw_get("default")?;
        if !default.is_nil() {
            return Ok(default);
        }
    }
    Ok(module)
}

type Cache = RwLock<HashMap<String, Arc<LoadedCapability>>>;

/// Resolves capability names to loaded modules, caching every success.
///
/// Clones and observer re-bindings share one cache.
#[derive(Clone)]
pub struct CapabilityLoader {
    registry: Arc<CapabilityRegistry>,
    fetcher: Arc<dyn Fetcher>,
    adapters: Arc<AdapterSet>,
    allow_remote: bool,
    cache: Arc<Cache>,
    observer: Arc<dyn LoadObserver>,
}

impl fmt::Debug for CapabilityLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityLoader")
            .field("registry", &self.registry)
            .field("allow_remote", &self.allow_remote)
            .field("cached", &self.cached_names())
            .finish_non_exhaustive()
    }
}

impl CapabilityLoader {
    /// Starts building a loader.
    #[must_use]
    pub fn builder() -> CapabilityLoaderBuilder {
        CapabilityLoaderBuilder::default()
    }

    /// Returns a loader sharing this loader's cache but reporting to `observer`.
    #[must_use]
    pub fn with_observer(&self, observer: Arc<dyn LoadObserver>) -> Self {
        Self {
            observer,
            ..self.clone()
        }
    }

    /// Returns the embedded registry.
    #[must_use]
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Returns the fetcher used for remote modules.
    #[must_use]
    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    /// Returns `true` when `name` has been loaded successfully.
    #[must_use]
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Lists cached names in sorted order.
    #[must_use]
    pub fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolves a capability by bare name or `https://` URL.
    ///
    /// Cached names return immediately without notifying the observer. An
    /// uncached module is evaluated once in a scratch realm and only cached when
    /// its body and adapter complete.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::UnknownCapability`] for unregistered bare names,
    /// [`CapabilityError::Initialization`] when the module raises, and the fetch,
    /// compile, or asset errors of the failed load. Failures are never cached.
    pub async fn resolve(&self, name: &str) -> CapabilityResult<Arc<LoadedCapability>> {
        if let Some(hit) = self.cached(name) {
            return Ok(hit);
        }

        self.observer.on_start(name);
        let result = self.load_checked(name).await;
        self.observer.on_end(name, result.as_ref().err());
        result
    }

    /// Resolves `name` and materializes it inside `lua` with `scope` as the
    /// module environment.
    ///
    /// The observer fires only for uncached names. The capability enters the
    /// cache after this realm evaluated it without raising, and `on_end` carries
    /// any evaluation error.
    ///
    /// # Errors
    ///
    /// Same as [`CapabilityLoader::resolve`].
    pub async fn require(&self, name: &str, lua: &Lua, scope: &Table) -> CapabilityResult<Value> {
        if let Some(hit) = self.cached(name) {
            return hit
                .materialize(lua, scope)
                .await
                .map_err(|source| CapabilityError::initialization(name, source));
        }

        self.observer.on_start(name);
        let result = self.load_into(name, lua, scope).await;
        self.observer.on_end(name, result.as_ref().err());
        result
    }

    fn cached(&self, name: &str) -> Option<Arc<LoadedCapability>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remember(&self, loaded: &Arc<LoadedCapability>) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(loaded.name.clone(), Arc::clone(loaded));
    }

    async fn load_checked(&self, name: &str) -> CapabilityResult<Arc<LoadedCapability>> {
        let loaded = self.load(name).await?;
        let scratch = Lua::new();
        let globals = scratch.globals();
        loaded
            .materialize(&scratch, &globals)
            .await
            .map_err(|source| CapabilityError::initialization(name, source))?;
        self.remember(&loaded);
        Ok(loaded)
    }

    async fn load_into(&self, name: &str, lua: &Lua, scope: &Table) -> CapabilityResult<Value> {
        let loaded = self.load(name).await?;
        let module = loaded
            .materialize(lua, scope)
            .await
            .map_err(|source| CapabilityError::initialization(name, source))?;
        self.remember(&loaded);
        Ok(module)
    }

    async fn load(&self, name: &str) -> CapabilityResult<Arc<LoadedCapability>> {
        let validated = CapabilityName::new(name)?;
        let (exports, adapter) = match validated.origin() {
            CapabilityOrigin::Remote => (self.load_remote(name).await?, None),
            CapabilityOrigin::Embedded => {
                let package =
                    self.registry
                        .get(name)
                        .ok_or_else(|| CapabilityError::UnknownCapability {
                            name: name.to_owned(),
                            available: self.registry.names(),
                        })?;
                let exports = package.load(name).await?;
                (exports, self.adapters.adapter_for(name)?)
            }
        };

        Ok(Arc::new(LoadedCapability {
            name: name.to_owned(),
            exports,
            adapter,
        }))
    }

    async fn load_remote(&self, url: &str) -> CapabilityResult<ModuleExports> {
        if !self.allow_remote {
            return Err(CapabilityError::RemoteDisabled { url: url.to_owned() });
        }

        let response = self.fetcher.fetch(FetchRequest::get(url)).await?;
        if !response.is_success() {
            return Err(CapabilityError::RemoteLoad {
                url: url.to_owned(),
                reason: format!("server answered with status {}", response.status()),
            });
        }
        let source = std::str::from_utf8(response.body()).map_err(|err| {
            CapabilityError::RemoteLoad {
                url: url.to_owned(),
                reason: format!("source is not valid UTF-8: {err}"),
            }
        })?;

        ModuleExports::script(url, source).map_err(|reason| CapabilityError::RemoteLoad {
            url: url.to_owned(),
            reason,
        })
    }
}

/// Builder for [`CapabilityLoader`].
#[derive(Default)]
pub struct CapabilityLoaderBuilder {
    registry: Option<CapabilityRegistry>,
    fetcher: Option<Arc<dyn Fetcher>>,
    adapters: Option<AdapterSet>,
    allow_remote: Option<bool>,
    observer: Option<Arc<dyn LoadObserver>>,
}

impl CapabilityLoaderBuilder {
    /// Sets the embedded registry. Defaults to [`CapabilityRegistry::builtin`].
    #[must_use]
    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the fetcher for remote modules. Defaults to [`HttpFetcher`].
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the adapter bindings. Defaults to an empty set.
    #[must_use]
    pub fn adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Enables or disables `https://` module loading. Enabled by default.
    #[must_use]
    pub fn allow_remote(mut self, allow: bool) -> Self {
        self.allow_remote = Some(allow);
        self
    }

    /// Sets the load observer. Defaults to [`TracingLoadObserver`].
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Finalizes the loader with an empty cache.
    #[must_use]
    pub fn build(self) -> CapabilityLoader {
        CapabilityLoader {
            registry: Arc::new(self.registry.unwrap_or_else(CapabilityRegistry::builtin)),
            fetcher: self
                .fetcher
                .unwrap_or_else(|| Arc::new(HttpFetcher::new())),
            adapters: Arc::new(self.adapters.unwrap_or_default()),
            allow_remote: self.allow_remote.unwrap_or(true),
            cache: Arc::new(RwLock::new(HashMap::new())),
            observer: self
                .observer
                .unwrap_or_else(|| Arc::new(TracingLoadObserver)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::AdapterBinding;
    use crate::assets::AssetManifest;
    use crate::fetch::{FetchResponse, StaticFetcher};
    use crate::registry::CapabilityPackage;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl LoadObserver for RecordingObserver {
        fn on_start(&self, name: &str) {
            self.events.lock().unwrap().push(format!("start:{name}"));
        }

        fn on_end(&self, name: &str, error: Option<&CapabilityError>) {
            let status = if error.is_some() { "err" } else { "ok" };
            self.events
                .lock()
                .unwrap()
                .push(format!("end:{name}:{status}"));
        }
    }

    struct CountingPackage {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CapabilityPackage for CountingPackage {
        async fn load(&self, name: &str) -> CapabilityResult<ModuleExports> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            ModuleExports::script(name, "return { answer = 42 }")
                .map_err(|reason| CapabilityError::package(name, reason))
        }
    }

    fn loader_with(
        observer: Arc<RecordingObserver>,
        fetcher: StaticFetcher,
    ) -> (CapabilityLoader, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut registry = CapabilityRegistry::builtin();
        registry
            .register(
                "counting",
                CountingPackage {
                    loads: Arc::clone(&loads),
                },
            )
            .unwrap();
        let loader = CapabilityLoader::builder()
            .registry(registry)
            .fetcher(Arc::new(fetcher))
            .observer(observer)
            .build();
        (loader, loads)
    }

    #[tokio::test]
    async fn repeated_resolution_loads_once_and_fires_hooks_once() {
        let observer = Arc::new(RecordingObserver::default());
        let (loader, loads) = loader_with(Arc::clone(&observer), StaticFetcher::new());

        let first = loader.resolve("counting").await.unwrap();
        let second = loader.resolve("counting").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(observer.events(), ["start:counting", "end:counting:ok"]);
    }

    #[tokio::test]
    async fn unknown_names_are_reported_and_not_cached() {
        let observer = Arc::new(RecordingObserver::default());
        let (loader, _) = loader_with(Arc::clone(&observer), StaticFetcher::new());

        let err = loader.resolve("left-pad").await.unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, CapabilityError::UnknownCapability { .. }));
        assert!(message.contains("hash"));
        assert!(message.contains("https://"));
        assert!(!loader.is_cached("left-pad"));

        loader.resolve("left-pad").await.unwrap_err();
        assert_eq!(
            observer.events(),
            [
                "start:left-pad",
                "end:left-pad:err",
                "start:left-pad",
                "end:left-pad:err"
            ]
        );
    }

    #[tokio::test]
    async fn remote_modules_are_fetched_and_cached() {
        let url = "https://modules.test/greet.lua";
        let fetcher = StaticFetcher::new().with_body(
            url,
            "return { default = { greet = function() return 'hi' end } }",
        );
        let (loader, _) = loader_with(Arc::new(RecordingObserver::default()), fetcher);

        let loaded = loader.resolve(url).await.unwrap();
        assert_eq!(loaded.exports().kind(), "script");
        assert_eq!(loader.cached_names(), [url]);

        let lua = Lua::new();
        let module = loaded.materialize(&lua, &lua.globals()).await.unwrap();
        let Value::Table(module) = module else {
            panic!("expected the default export table");
        };
        let greet: mlua::Function = module.get("greet").unwrap();
        assert_eq!(greet.call::<String>(()).unwrap(), "hi");
    }

    #[tokio::test]
    async fn failed_remote_loads_are_not_cached() {
        let url = "https://modules.test/broken.lua";
        let fetcher = StaticFetcher::new();
        fetcher.insert(url, FetchResponse::new(url, 500, "oops"));
        let observer = Arc::new(RecordingObserver::default());
        let (loader, _) = loader_with(Arc::clone(&observer), fetcher);

        let err = loader.resolve(url).await.unwrap_err();
        assert!(matches!(err, CapabilityError::RemoteLoad { .. }));
        assert!(!loader.is_cached(url));
        assert_eq!(observer.events().last().unwrap(), &format!("end:{url}:err"));
    }

    #[tokio::test]
    async fn remote_sources_must_compile() {
        let url = "https://modules.test/syntax.lua";
        let fetcher = StaticFetcher::new().with_body(url, "return {");
        let (loader, _) = loader_with(Arc::new(RecordingObserver::default()), fetcher);

        let err = loader.resolve(url).await.unwrap_err();
        assert!(matches!(err, CapabilityError::RemoteLoad { .. }));
    }

    #[tokio::test]
    async fn remote_loading_can_be_disabled() {
        let loader = CapabilityLoader::builder()
            .fetcher(Arc::new(StaticFetcher::new()))
            .allow_remote(false)
            .build();

        let err = loader.resolve("https://modules.test/x.lua").await.unwrap_err();
        assert!(matches!(err, CapabilityError::RemoteDisabled { .. }));
    }

    #[tokio::test]
    async fn rebound_observers_share_the_cache() {
        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());
        let (loader, loads) = loader_with(Arc::clone(&first), StaticFetcher::new());
        let rebound = loader.with_observer(Arc::clone(&second) as Arc<dyn LoadObserver>);

        loader.resolve("counting").await.unwrap();
        rebound.resolve("counting").await.unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(second.events().is_empty());
    }

    #[tokio::test]
    async fn adapters_missing_assets_fail_the_load() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_source("libarchive", "return function(options) return options end")
            .unwrap();
        let loader = CapabilityLoader::builder()
            .registry(registry)
            .fetcher(Arc::new(StaticFetcher::new()))
            .adapters(AdapterSet::new(AssetManifest::new()).bind(AdapterBinding::libarchive()))
            .build();

        let err = loader.resolve("libarchive").await.unwrap_err();
        assert!(matches!(err, CapabilityError::MissingAsset { .. }));
        assert!(!loader.is_cached("libarchive"));
    }

    #[tokio::test]
    async fn raising_module_bodies_are_reported_and_not_cached() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_source("broken", "error('module init failed')")
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let loader = CapabilityLoader::builder()
            .registry(registry)
            .fetcher(Arc::new(StaticFetcher::new()))
            .observer(Arc::clone(&observer) as Arc<dyn LoadObserver>)
            .build();

        let lua = Lua::new();
        let globals = lua.globals();
        let err = loader.require("broken", &lua, &globals).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Initialization { .. }));
        assert!(err.to_string().contains("module init failed"));
        assert!(!loader.is_cached("broken"));

        let err = loader.resolve("broken").await.unwrap_err();
        assert!(matches!(err, CapabilityError::Initialization { .. }));
        assert!(!loader.is_cached("broken"));
        assert_eq!(
            observer.events(),
            ["start:broken", "end:broken:err", "start:broken", "end:broken:err"]
        );
    }

    #[tokio::test]
    async fn raising_adapters_are_reported_and_not_cached() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_source(
                "ffmpeg",
                "return setmetatable({}, { __index = function() error('class lookup failed') end })",
            )
            .unwrap();
        let mut manifest = AssetManifest::new();
        for file in [
            "ffmpeg-core.js",
            "ffmpeg-core.wasm",
            "ffmpeg-core-mt.js",
            "ffmpeg-core-mt.wasm",
            "ffmpeg-core-mt.worker.js",
        ] {
            manifest.register(file, file.as_bytes());
        }
        let observer = Arc::new(RecordingObserver::default());
        let loader = CapabilityLoader::builder()
            .registry(registry)
            .fetcher(Arc::new(StaticFetcher::new()))
            .adapters(AdapterSet::new(manifest).bind(AdapterBinding::ffmpeg()))
            .observer(Arc::clone(&observer) as Arc<dyn LoadObserver>)
            .build();

        let lua = Lua::new();
        let globals = lua.globals();
        let err = loader.require("ffmpeg", &lua, &globals).await.unwrap_err();
        assert!(err.to_string().contains("class lookup failed"));
        assert!(!loader.is_cached("ffmpeg"));
        assert_eq!(observer.events(), ["start:ffmpeg", "end:ffmpeg:err"]);
    }

    #[tokio::test]
    async fn required_modules_are_cached_after_evaluation() {
        let observer = Arc::new(RecordingObserver::default());
        let (loader, loads) = loader_with(Arc::clone(&observer), StaticFetcher::new());

        for _ in 0..2 {
            let lua = Lua::new();
            let globals = lua.globals();
            let Value::Table(module) = loader.require("counting", &lua, &globals).await.unwrap()
            else {
                panic!("counting module is a table");
            };
            assert_eq!(module.get::<i64>("answer").unwrap(), 42);
        }

        assert!(loader.is_cached("counting"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(observer.events(), ["start:counting", "end:counting:ok"]);
    }

    #[tokio::test]
    async fn native_builtins_materialize_per_realm() {
        let loader = CapabilityLoader::builder()
            .fetcher(Arc::new(StaticFetcher::new()))
            .build();
        let loaded = loader.resolve("hash").await.unwrap();

        for _ in 0..2 {
            let lua = Lua::new();
            let Value::Table(module) = loaded.materialize(&lua, &lua.globals()).await.unwrap() else {
                panic!("hash module is a table");
            };
            let sha256: mlua::Function = module.get("sha256").unwrap();
            assert_eq!(
                sha256.call::<String>("abc").unwrap(),
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            );
        }
    }
}
