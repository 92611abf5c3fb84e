//! Post-load adapters for packages whose binary payloads are served from hashed URLs.

use std::collections::{BTreeMap, HashMap};

use mlua::{Lua, Table, Value};
use serde::{Deserialize, Serialize};
use toolbox_primitives::AdapterKind;

use crate::assets::AssetManifest;
use crate::error::{CapabilityError, CapabilityResult};

const MEDIA_ADAPTER: &str = include_str!("adapters/media.lua");
const ARCHIVE_ADAPTER: &str = include_str!("adapters/archive.lua");
const IMAGE_ADAPTER: &str = include_str!("adapters/image.lua");

/// Asset roles each adapter kind needs, in the order they are checked.
fn required_roles(kind: AdapterKind) -> &'static [&'static str] {
    match kind {
        AdapterKind::MediaTranscoder => &["core", "wasm", "core_mt", "wasm_mt", "worker_mt"],
        AdapterKind::ArchiveCodec | AdapterKind::ImageCodec => &["wasm"],
    }
}

/// Declares that a package needs an adapter and which asset files fill its roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterBinding {
    package: String,
    kind: AdapterKind,
    /// Role (`wasm`, `core_mt`, ...) to logical asset file name.
    assets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    class_name: Option<String>,
}

impl AdapterBinding {
    /// Creates a binding without assets.
    #[must_use]
    pub fn new(package: impl Into<String>, kind: AdapterKind) -> Self {
        Self {
            package: package.into(),
            kind,
            assets: BTreeMap::new(),
            class_name: None,
        }
    }

    /// Maps an asset role to a logical asset file name.
    #[must_use]
    pub fn with_asset(mut self, role: impl Into<String>, file: impl Into<String>) -> Self {
        self.assets.insert(role.into(), file.into());
        self
    }

    /// Sets the exported class wrapped by the media adapter.
    #[must_use]
    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Media transcoder binding for the `ffmpeg` package.
    #[must_use]
    pub fn ffmpeg() -> Self {
        Self::new("ffmpeg", AdapterKind::MediaTranscoder)
            .with_class_name("FFmpeg")
            .with_asset("core", "ffmpeg-core.js")
            .with_asset("wasm", "ffmpeg-core.wasm")
            .with_asset("core_mt", "ffmpeg-core-mt.js")
            .with_asset("wasm_mt", "ffmpeg-core-mt.wasm")
            .with_asset("worker_mt", "ffmpeg-core-mt.worker.js")
    }

    /// Archive codec binding for the `libarchive` package.
    #[must_use]
    pub fn libarchive() -> Self {
        Self::new("libarchive", AdapterKind::ArchiveCodec).with_asset("wasm", "libarchive.wasm")
    }

    /// Image codec binding for the `png` package.
    #[must_use]
    pub fn png() -> Self {
        Self::new("png", AdapterKind::ImageCodec).with_asset("wasm", "png_codec_bg.wasm")
    }

    /// Returns the adapted package name.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Returns the adapter kind.
    #[must_use]
    pub const fn kind(&self) -> AdapterKind {
        self.kind
    }

    /// Returns the role to asset-file mapping.
    #[must_use]
    pub fn assets(&self) -> &BTreeMap<String, String> {
        &self.assets
    }

    /// Resolves every required role against the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::MissingAsset`] when a role has no asset file or
    /// the file has no registered URL.
    pub fn resolve(&self, manifest: &AssetManifest) -> CapabilityResult<AssetAdapter> {
        let mut urls = BTreeMap::new();
        for role in required_roles(self.kind) {
            let file = self.assets.get(*role).ok_or_else(|| CapabilityError::MissingAsset {
                package: self.package.clone(),
                asset: format!("<{role}>"),
            })?;
            let url = manifest.url(file).ok_or_else(|| CapabilityError::MissingAsset {
                package: self.package.clone(),
                asset: file.clone(),
            })?;
            urls.insert((*role).to_owned(), url.to_owned());
        }
        Ok(AssetAdapter {
            kind: self.kind,
            class_name: self.class_name.clone().unwrap_or_default(),
            urls,
        })
    }
}

/// Adapter bindings keyed by package name, plus the manifest they resolve against.
#[derive(Debug, Clone, Default)]
pub struct AdapterSet {
    bindings: HashMap<String, AdapterBinding>,
    manifest: AssetManifest,
}

impl AdapterSet {
    /// Creates an empty set; no package is adapted.
    #[must_use]
    pub fn new(manifest: AssetManifest) -> Self {
        Self {
            bindings: HashMap::new(),
            manifest,
        }
    }

    /// Creates a set with the `ffmpeg`, `libarchive`, and `png` bindings.
    #[must_use]
    pub fn with_defaults(manifest: AssetManifest) -> Self {
        Self::new(manifest)
            .bind(AdapterBinding::ffmpeg())
            .bind(AdapterBinding::libarchive())
            .bind(AdapterBinding::png())
    }

    /// Adds or replaces the binding for a package.
    #[must_use]
    pub fn bind(mut self, binding: AdapterBinding) -> Self {
        self.bindings.insert(binding.package.clone(), binding);
        self
    }

    /// Returns the asset manifest.
    #[must_use]
    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    /// Returns the resolved adapter for `package`, if it has a binding.
    ///
    /// # Errors
    ///
    /// Propagates [`CapabilityError::MissingAsset`] from [`AdapterBinding::resolve`].
    pub fn adapter_for(&self, package: &str) -> CapabilityResult<Option<AssetAdapter>> {
        self.bindings
            .get(package)
            .map(|binding| binding.resolve(&self.manifest))
            .transpose()
    }
}

/// Adapter with every asset role resolved to a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetAdapter {
    kind: AdapterKind,
    class_name: String,
    urls: BTreeMap<String, String>,
}

impl AssetAdapter {
    /// Returns the adapter kind.
    #[must_use]
    pub const fn kind(&self) -> AdapterKind {
        self.kind
    }

    /// Returns the URL resolved for an asset role.
    #[must_use]
    pub fn url(&self, role: &str) -> Option<&str> {
        self.urls.get(role).map(String::as_str)
    }

    /// Decorates a realm's module value. `scope` supplies the realm's `fetch`.
    ///
    /// # Errors
    ///
    /// Propagates Lua errors raised while evaluating the adapter.
    pub fn apply(&self, lua: &Lua, module: Value, scope: &Table) -> mlua::Result<Value> {
        let assets = lua.create_table()?;
        for (role, url) in &self.urls {
            assets.set(role.as_str(), url.as_str())?;
        }

        match self.kind {
            AdapterKind::MediaTranscoder => lua
                .load(MEDIA_ADAPTER)
                .set_name("=adapter:media-transcoder")
                .call((module, assets, self.class_name.as_str())),
            AdapterKind::ArchiveCodec => lua
                .load(ARCHIVE_ADAPTER)
                .set_name("=adapter:archive-codec")
                .call((module, assets)),
            AdapterKind::ImageCodec => {
                let fetch: Value = scope.get("fetch")?;
                lua.load(IMAGE_ADAPTER)
                    .set_name("=adapter:image-codec")
                    .call((module, assets, fetch))
            }
        }
    }
}
