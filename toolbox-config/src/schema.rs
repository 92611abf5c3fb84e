//! Strongly typed configuration sections.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use toolbox_capabilities::{AdapterBinding, AdapterSet, AssetManifest};
use toolbox_primitives::{Error, SchedulingStrategy};

/// Root configuration document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolboxConfig {
    /// Scheduler settings applied to every kernel.
    pub scheduler: SchedulerSettings,
    /// Capability loader settings.
    pub capabilities: CapabilitySettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl ToolboxConfig {
    /// Builds the asset manifest described by the `capabilities` section.
    #[must_use]
    pub fn manifest(&self) -> AssetManifest {
        let mut manifest = match &self.capabilities.asset_base_url {
            Some(base) => AssetManifest::with_base_url(base.as_str()),
            None => AssetManifest::new(),
        };
        for (name, url) in &self.capabilities.assets {
            manifest.insert(name, url);
        }
        manifest
    }

    /// Builds the adapter bindings, layering configured ones over the defaults.
    #[must_use]
    pub fn adapter_set(&self) -> AdapterSet {
        self.adapters_over(self.manifest())
    }

    /// Like [`ToolboxConfig::adapter_set`], resolving against a caller-extended manifest.
    #[must_use]
    pub fn adapters_over(&self, manifest: AssetManifest) -> AdapterSet {
        let set = if self.capabilities.default_adapters {
            AdapterSet::with_defaults(manifest)
        } else {
            AdapterSet::new(manifest)
        };
        self.capabilities
            .adapters
            .iter()
            .cloned()
            .fold(set, AdapterSet::bind)
    }
}

/// `[scheduler]` section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    /// How requests arriving during a run are treated.
    pub strategy: SchedulingStrategy,
}

/// `[capabilities]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapabilitySettings {
    /// Whether `https://` capability names may be fetched.
    pub allow_remote: bool,
    /// Base URL under which registered asset bytes are served.
    pub asset_base_url: Option<String>,
    /// Explicit asset file name to URL entries.
    pub assets: BTreeMap<String, String>,
    /// Whether the `ffmpeg`, `libarchive`, and `png` bindings are installed.
    pub default_adapters: bool,
    /// Additional or replacement adapter bindings.
    pub adapters: Vec<AdapterBinding>,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            allow_remote: true,
            asset_base_url: None,
            assets: BTreeMap::new(),
            default_adapters: true,
            adapters: Vec::new(),
        }
    }
}

/// `[logging]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// `EnvFilter` directives, e.g. `info,toolbox::script=debug`.
    pub filter: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            format: LogFormat::default(),
        }
    }
}

/// Log line format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// Newline-delimited JSON.
    Json,
}

impl LogFormat {
    /// Returns the canonical spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(Error::UnknownVariant {
                kind: "log format",
                value: other.to_owned(),
                expected: "pretty, json",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use toolbox_primitives::AdapterKind;

    #[test]
    fn defaults_allow_remote_and_keep_latest() {
        let config = ToolboxConfig::default();
        assert_eq!(config.scheduler.strategy, SchedulingStrategy::KeepLatest);
        assert!(config.capabilities.allow_remote);
        assert!(config.capabilities.default_adapters);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn manifest_combines_base_url_and_explicit_entries() {
        let mut config = ToolboxConfig::default();
        config.capabilities.asset_base_url = Some("https://cdn.test/assets/".into());
        config
            .capabilities
            .assets
            .insert("libarchive.wasm".into(), "https://cdn.test/la.1234.wasm".into());

        let mut manifest = config.manifest();
        assert_eq!(
            manifest.url("libarchive.wasm"),
            Some("https://cdn.test/la.1234.wasm")
        );
        assert!(
            manifest
                .register("png_codec_bg.wasm", b"png")
                .starts_with("https://cdn.test/assets/png_codec_bg.")
        );
    }

    #[test]
    fn configured_adapters_override_defaults() {
        let mut config = ToolboxConfig::default();
        config.capabilities.assets.insert("png.wasm".into(), "https://cdn.test/png.wasm".into());
        config
            .capabilities
            .adapters
            .push(AdapterBinding::new("png", AdapterKind::ImageCodec).with_asset("wasm", "png.wasm"));

        let set = config.adapter_set();
        let png = set.adapter_for("png").unwrap().unwrap();
        assert_eq!(png.url("wasm"), Some("https://cdn.test/png.wasm"));
        assert!(set.adapter_for("libarchive").is_err());
        assert!(set.adapter_for("hash").unwrap().is_none());
    }

    #[test]
    fn defaults_can_be_disabled() {
        let mut config = ToolboxConfig::default();
        config.capabilities.default_adapters = false;
        assert!(config.adapter_set().adapter_for("ffmpeg").unwrap().is_none());
    }

    #[test]
    fn parses_log_formats() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
