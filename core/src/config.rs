//! Configuration loading
//!
//! Sources, later ones win:
//! 1. built-in defaults
//! 2. TOML file (`SOPLINE_CONFIG_PATH`, or `sopline.toml` in the working directory)
//! 3. `SOPLINE__<SECTION>__<KEY>` environment variables
//! 4. `SOPLINE_DATABASE_URL`
//! 5. explicit builder overrides
//!
//! A `.env` file is read first when present.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "sopline.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite://sopline.db` or `sqlite::memory:`
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

/// Paging limits applied by the execution service
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub max_log_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            max_log_page_size: 1000,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from files and environment only
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
    pub fn database_url(mut self, url: Option<String>) -> Self {
        if url.is_some() {
            self.database_url = url;
        }
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        if path.is_some() {
            self.config_path = path;
        }
        self
    }

    pub fn build(self) -> Result<Config> {
        dotenvy::dotenv().ok();

        let explicit_path = self
            .config_path
            .or_else(|| std::env::var("SOPLINE_CONFIG_PATH").ok().map(PathBuf::from));
        let (path, required) = match explicit_path {
            Some(path) => (path, true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let engine = EngineConfig::default();
        let url = self
            .database_url
            .or_else(|| std::env::var("SOPLINE_DATABASE_URL").ok());

        let config: Config = ::config::Config::builder()
            .set_default("database.max_connections", 10_i64)?
            .set_default("database.min_connections", 1_i64)?
            .set_default("database.acquire_timeout_secs", 30_i64)?
            .set_default("database.idle_timeout_secs", 600_i64)?
            .set_default("database.max_lifetime_secs", 1800_i64)?
            .set_default("engine.default_page_size", i64::from(engine.default_page_size))?
            .set_default("engine.max_page_size", i64::from(engine.max_page_size))?
            .set_default("engine.max_log_page_size", i64::from(engine.max_log_page_size))?
            .add_source(::config::File::from(path.clone()).required(required))
            .add_source(::config::Environment::with_prefix("SOPLINE").separator("__"))
            .set_override_option("database.url", url)?
            .build()
            .with_context(|| format!("Failed to read configuration (file: {})", path.display()))?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        match self.database.url.as_deref() {
            None | Some("") => bail!(
                "Database URL is not configured\n\n\
                Set SOPLINE_DATABASE_URL, pass --database-url, or add [database] url to {}",
                DEFAULT_CONFIG_FILE
            ),
            Some(_) => {}
        }
        if self.database.min_connections > self.database.max_connections {
            bail!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }
        if self.engine.default_page_size == 0
            || self.engine.default_page_size > self.engine.max_page_size
        {
            bail!(
                "engine.default_page_size must be between 1 and engine.max_page_size ({})",
                self.engine.max_page_size
            );
        }
        Ok(())
    }
}
