//! Embedded capability packages available to scripts by bare name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use mlua::Lua;

use crate::builtin::{DateTimeModule, HashModule, UuidModule};
use crate::error::{CapabilityError, CapabilityResult};

/// Module implemented in Rust and installed into each script realm on demand.
pub trait NativeModule: Send + Sync {
    /// Builds the module's Lua value inside `lua`.
    ///
    /// # Errors
    ///
    /// Propagates any Lua allocation or conversion error.
    fn install(&self, lua: &Lua) -> mlua::Result<mlua::Value>;
}

/// Realm-independent exports of a loaded capability.
#[derive(Clone)]
pub enum ModuleExports {
    /// Rust-implemented module.
    Native(Arc<dyn NativeModule>),
    /// Lua source evaluated once per realm; its return value is the module.
    Script {
        /// Chunk name used in tracebacks.
        chunk_name: String,
        /// Module source text.
        source: Arc<str>,
    },
}

impl ModuleExports {
    /// Creates script exports after checking that the source compiles.
    ///
    /// # Errors
    ///
    /// Returns the compiler's message when the source is not valid Lua.
    pub fn script(chunk_name: impl Into<String>, source: impl Into<Arc<str>>) -> Result<Self, String> {
        let chunk_name = chunk_name.into();
        let source = source.into();
        Lua::new()
            .load(&*source)
            .set_name(format!("={chunk_name}"))
            .into_function()
            .map_err(|err| err.to_string())?;
        Ok(Self::Script { chunk_name, source })
    }

    /// Returns a short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Script { .. } => "script",
        }
    }
}

impl fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.debug_tuple("Native").finish_non_exhaustive(),
            Self::Script { chunk_name, source } => f
                .debug_struct("Script")
                .field("chunk_name", chunk_name)
                .field("len", &source.len())
                .finish(),
        }
    }
}

/// Package that produces module exports when first requested.
#[async_trait]
pub trait CapabilityPackage: Send + Sync {
    /// Loads the package. Called at most once per successful resolution.
    async fn load(&self, name: &str) -> CapabilityResult<ModuleExports>;
}

struct NativePackage(Arc<dyn NativeModule>);

#[async_trait]
impl CapabilityPackage for NativePackage {
    async fn load(&self, _name: &str) -> CapabilityResult<ModuleExports> {
        Ok(ModuleExports::Native(Arc::clone(&self.0)))
    }
}

struct SourcePackage(Arc<str>);

#[async_trait]
impl CapabilityPackage for SourcePackage {
    async fn load(&self, name: &str) -> CapabilityResult<ModuleExports> {
        ModuleExports::script(name, Arc::clone(&self.0))
            .map_err(|reason| CapabilityError::package(name, reason))
    }
}

/// Fixed allowlist of embedded packages, keyed by bare name.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    packages: BTreeMap<String, Arc<dyn CapabilityPackage>>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("registered", &self.names())
            .finish()
    }
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in `hash`, `uuid`, and `datetime` packages.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for (name, module) in [
            ("hash", Arc::new(HashModule) as Arc<dyn NativeModule>),
            ("uuid", Arc::new(UuidModule)),
            ("datetime", Arc::new(DateTimeModule)),
        ] {
            registry
                .packages
                .insert(name.to_owned(), Arc::new(NativePackage(module)));
        }
        registry
    }

    /// Registers a package implementation.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::Duplicate`] if the name is already present and
    /// [`CapabilityError::InvalidName`] if it is not a valid bare name.
    pub fn register<P>(&mut self, name: impl Into<String>, package: P) -> CapabilityResult<()>
    where
        P: CapabilityPackage + 'static,
    {
        let name = name.into();
        let validated = toolbox_primitives::CapabilityName::new(name.clone())?;
        if validated.is_remote() {
            return Err(CapabilityError::InvalidName(
                toolbox_primitives::Error::InvalidCapabilityName {
                    name,
                    reason: "embedded packages cannot use a remote URL as their name".into(),
                },
            ));
        }
        if self.packages.contains_key(&name) {
            return Err(CapabilityError::Duplicate { name });
        }
        self.packages.insert(name, Arc::new(package));
        Ok(())
    }

    /// Registers a Rust-implemented module.
    ///
    /// # Errors
    ///
    /// See [`CapabilityRegistry::register`].
    pub fn register_native<M>(&mut self, name: impl Into<String>, module: M) -> CapabilityResult<()>
    where
        M: NativeModule + 'static,
    {
        self.register(name, NativePackage(Arc::new(module)))
    }

    /// Registers a module written in Lua; the chunk's return value is the module.
    ///
    /// # Errors
    ///
    /// See [`CapabilityRegistry::register`].
    pub fn register_source(
        &mut self,
        name: impl Into<String>,
        source: impl Into<Arc<str>>,
    ) -> CapabilityResult<()> {
        self.register(name, SourcePackage(source.into()))
    }

    /// Returns the package registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityPackage>> {
        self.packages.get(name).cloned()
    }

    /// Returns `true` when `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Lists registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    /// Returns the number of registered packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_packages_are_sorted() {
        let registry = CapabilityRegistry::builtin();
        assert_eq!(registry.names(), ["datetime", "hash", "uuid"]);
    }

    #[test]
    fn duplicate_registration_errors() {
        let mut registry = CapabilityRegistry::builtin();
        let err = registry
            .register_source("hash", "return {}")
            .expect_err("duplicate registration should fail");
        assert!(matches!(err, CapabilityError::Duplicate { name } if name == "hash"));
    }

    #[test]
    fn remote_names_cannot_be_embedded() {
        let mut registry = CapabilityRegistry::new();
        let err = registry
            .register_source("https://cdn.test/x.lua", "return {}")
            .expect_err("remote names are reserved");
        assert!(matches!(err, CapabilityError::InvalidName(_)));
    }

    #[tokio::test]
    async fn source_packages_are_compiled_on_load() {
        let mut registry = CapabilityRegistry::new();
        registry.register_source("broken", "return {").unwrap();
        registry.register_source("fine", "return { ok = true }").unwrap();

        let err = registry
            .get("broken")
            .unwrap()
            .load("broken")
            .await
            .expect_err("syntax error should fail the load");
        assert!(matches!(err, CapabilityError::Package { .. }));

        let exports = registry.get("fine").unwrap().load("fine").await.unwrap();
        assert_eq!(exports.kind(), "script");
    }
}
