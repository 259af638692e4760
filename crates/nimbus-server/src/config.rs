//! Server configuration.
//!
//! Wraps the host configuration with the sources the binary reads it from.

use std::collections::HashSet;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use nimbus_host::HostConfig;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("Configuration error: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Worker host configuration.
    #[serde(default)]
    pub host: HostConfig,
}

impl ServerConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `nimbus.toml` in the current directory (if present)
    /// 3. Specified config file path (if provided)
    /// 4. Environment variables with `NIMBUS_` prefix, `__` separating keys
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::file("nimbus.toml"));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        let config: Self = figment
            .merge(Env::prefixed("NIMBUS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = &self.host;
        for worker in &host.workers {
            if worker.language.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "worker language cannot be empty".into(),
                ));
            }
        }
        if host.placeholder.enabled {
            if let Some(missing) = host
                .placeholder
                .runtimes
                .iter()
                .find(|runtime| host.worker(runtime).is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "placeholder runtime {missing} has no worker description"
                )));
            }
        }
        if let Some(function) = host.functions.iter().find(|f| host.worker(&f.runtime).is_none()) {
            return Err(ConfigError::Invalid(format!(
                "function {} targets runtime {} with no worker description",
                function.name, function.runtime
            )));
        }
        let mut ids = HashSet::new();
        for function in &host.functions {
            let id = function.function_id.as_deref().unwrap_or(&function.name);
            if !ids.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate function id {id}")));
            }
        }
        Ok(())
    }
}
