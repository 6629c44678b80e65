//! Configuration loading
//!
//! Settings merge in precedence order: builder overrides, then
//! `STEPFLOW_`-prefixed environment variables, then an optional
//! `stepflow.toml`, then defaults. A `.env` file is honoured via dotenvy
//! before the environment is read.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load with defaults: optional `stepflow.toml` plus environment
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Explicit database URL, overriding file and environment
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    /// Explicit config file path instead of the default `stepflow.toml`
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn build(self) -> Result<Config> {
        // A .env file is a convenience for local development
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        match &self.config_path {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path.clone()).format(config::FileFormat::Toml),
                );
            }
            None => {
                builder = builder.add_source(
                    config::File::with_name("stepflow")
                        .format(config::FileFormat::Toml)
                        .required(false),
                );
            }
        }

        // STEPFLOW_DATABASE__URL etc.; double underscore separates levels
        builder = builder.add_source(
            config::Environment::with_prefix("STEPFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if self.database_url.is_some() {
            cfg.database.url = self.database_url;
        }
        // Plain STEPFLOW_DATABASE_URL also works, as the CLI documents
        if cfg.database.url.is_none() {
            cfg.database.url = std::env::var("STEPFLOW_DATABASE_URL").ok();
        }

        Ok(cfg)
    }
}
