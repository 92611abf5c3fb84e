//! Content-hashed asset URLs for packages that ship binary payloads.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Hex characters of the content digest embedded in generated file names.
const HASH_LEN: usize = 8;

/// Maps logical asset file names (`ffmpeg-core.wasm`) to the URLs they are served from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    base_url: Option<String>,
    entries: BTreeMap<String, String>,
}

impl AssetManifest {
    /// Creates an empty manifest without a base URL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty manifest whose hashed entries live under `base_url`.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: Some(base_url.trim_end_matches('/').to_owned()),
            entries: BTreeMap::new(),
        }
    }

    /// Records an explicit URL for a logical asset name.
    pub fn insert(&mut self, name: impl Into<String>, url: impl Into<String>) {
        self.entries.insert(name.into(), url.into());
    }

    /// Registers asset bytes, deriving a content-hashed URL under the base URL.
    ///
    /// `ffmpeg-core.wasm` becomes `<base>/ffmpeg-core.<hash>.wasm`. Without a base URL
    /// the hashed file name is used as a relative URL.
    pub fn register(&mut self, name: impl Into<String>, contents: &[u8]) -> &str {
        let name = name.into();
        let hashed = hashed_file_name(&name, contents);
        let url = match &self.base_url {
            Some(base) => format!("{base}/{hashed}"),
            None => hashed,
        };
        self.entries.insert(name.clone(), url);
        self.entries[&name].as_str()
    }

    /// Returns the URL registered for a logical asset name.
    #[must_use]
    pub fn url(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Iterates over `(name, url)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, url)| (name.as_str(), url.as_str()))
    }

    /// Returns the number of registered assets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no assets are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn hashed_file_name(name: &str, contents: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(contents));
    let hash = &digest[..HASH_LEN];
    // Split on the first dot so `x.worker.js` keeps its compound extension.
    match name.split_once('.') {
        Some((stem, ext)) => format!("{stem}.{hash}.{ext}"),
        None => format!("{name}.{hash}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_derives_stable_hashed_urls() {
        let mut manifest = AssetManifest::with_base_url("https://cdn.test/assets/");
        let first = manifest.register("ffmpeg-core.wasm", b"payload").to_owned();
        assert!(first.starts_with("https://cdn.test/assets/ffmpeg-core."));
        assert!(first.ends_with(".wasm"));

        let mut other = AssetManifest::with_base_url("https://cdn.test/assets");
        assert_eq!(other.register("ffmpeg-core.wasm", b"payload"), first);
        assert_ne!(other.register("ffmpeg-core.wasm", b"changed"), first);
    }

    #[test]
    fn compound_extensions_are_preserved() {
        let mut manifest = AssetManifest::new();
        let url = manifest
            .register("ffmpeg-core-mt.worker.js", b"worker")
            .to_owned();
        assert!(url.starts_with("ffmpeg-core-mt."));
        assert!(url.ends_with(".worker.js"));
        assert_eq!(manifest.url("ffmpeg-core-mt.worker.js"), Some(url.as_str()));
    }

    #[test]
    fn explicit_entries_override() {
        let mut manifest = AssetManifest::new();
        manifest.insert("png_codec_bg.wasm", "https://cdn.test/png.1234.wasm");
        assert_eq!(
            manifest.url("png_codec_bg.wasm"),
            Some("https://cdn.test/png.1234.wasm")
        );
        assert_eq!(manifest.len(), 1);
        assert!(manifest.url("missing.wasm").is_none());
    }
}
