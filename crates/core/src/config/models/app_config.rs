use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    dispatcher_worker::{ServerConfig, WorkerConfig},
    observability::LoggingConfig,
};

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/workerhub.toml",
    "workerhub.toml",
    "/etc/workerhub/config.toml",
];

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: WORKERHUB, separator: `__`)
    ///
    /// An explicit `config_path` must exist; without one the first existing
    /// default path is used, if any.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = toml::to_string(&AppConfig::default()).context("failed to serialize default config")?;
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(&defaults, FileFormat::Toml));

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("config file not found: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        // Environment overrides, e.g. WORKERHUB__SERVER__PORT=9000
        builder = builder.add_source(
            Environment::with_prefix("WORKERHUB")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("failed to parse TOML config")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config to TOML")
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate().context("invalid server config")?;
        self.worker.validate().context("invalid worker config")?;
        self.logging.validate().context("invalid logging config")?;
        Ok(())
    }
}
