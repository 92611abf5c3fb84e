//! Reading, environment overrides, and validation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use toolbox_primitives::SchedulingStrategy;
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, ConfigResult};
use crate::schema::{LogFormat, ToolboxConfig};

/// Overrides `scheduler.strategy`.
pub const ENV_STRATEGY: &str = "TOOLBOX_STRATEGY";
/// Overrides `logging.filter`.
pub const ENV_LOG: &str = "TOOLBOX_LOG";
/// Overrides `logging.format`.
pub const ENV_LOG_FORMAT: &str = "TOOLBOX_LOG_FORMAT";

impl ToolboxConfig {
    /// Parses a TOML document. Missing sections take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown fields.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read, otherwise the
    /// errors of [`ToolboxConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded configuration file");
        Self::from_toml_str(&text)
    }

    /// Reads a file, applies environment overrides, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns the first read, parse, override, or validation failure.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TOOLBOX_STRATEGY`, `TOOLBOX_LOG`, and `TOOLBOX_LOG_FORMAT` from
    /// the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when a variable cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when a value cannot be parsed.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_STRATEGY) {
            self.scheduler.strategy =
                value
                    .parse::<SchedulingStrategy>()
                    .map_err(|err| ConfigError::Env {
                        name: ENV_STRATEGY,
                        reason: err.to_string(),
                        value,
                    })?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            if value.trim().is_empty() {
                return Err(ConfigError::Env {
                    name: ENV_LOG,
                    value,
                    reason: "filter is empty".into(),
                });
            }
            self.logging.filter = value;
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = value.parse::<LogFormat>().map_err(|err| ConfigError::Env {
                name: ENV_LOG_FORMAT,
                reason: err.to_string(),
                value,
            })?;
        }
        Ok(())
    }

    /// Checks URLs, adapter bindings, and the log filter.
    ///
    /// Assets named by configured adapters must appear in `capabilities.assets`;
    /// default adapters may still be satisfied by assets registered at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        let capabilities = &self.capabilities;
        if let Some(base) = &capabilities.asset_base_url {
            check_url("capabilities.asset_base_url", base)?;
        }
        for (name, url) in &capabilities.assets {
            check_url(&format!("capabilities.assets.{name}"), url)?;
        }

        let mut packages = HashSet::new();
        for (index, binding) in capabilities.adapters.iter().enumerate() {
            let field = format!("capabilities.adapters[{index}]");
            if binding.package().trim().is_empty() {
                return Err(invalid(field, "package name is empty"));
            }
            if !packages.insert(binding.package()) {
                return Err(invalid(
                    field,
                    format!("package `{}` is bound twice", binding.package()),
                ));
            }
            for (role, file) in binding.assets() {
                if !capabilities.assets.contains_key(file) {
                    return Err(invalid(
                        format!("{field}.assets.{role}"),
                        format!("asset `{file}` has no entry in capabilities.assets"),
                    ));
                }
            }
        }

        if self.logging.filter.trim().is_empty() {
            return Err(invalid("logging.filter", "filter is empty"));
        }
        Ok(())
    }
}

fn check_url(field: &str, value: &str) -> ConfigResult<()> {
    let url = Url::parse(value).map_err(|err| invalid(field, err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(invalid(field, format!("unsupported scheme `{scheme}`"))),
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}
