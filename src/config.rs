//! Configuration loader and validator for the donation ledger.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::Actor;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub database: Database,
    pub client: Client,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// SQLite connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    /// Explicit database URL; defaults to `sqlite://{data_dir}/ledger.db`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits for the store's write lock before the
    /// operation fails with a retryable error.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Database {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Identity of the workstation recorded on workflows, deletions and queue rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub machine_name: String,
    pub user_name: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Resolve the database URL: `DATABASE_URL`, then `database.url`, then a
    /// file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.database.url.clone())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/ledger.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }

    pub fn actor(&self) -> Actor {
        Actor::new(&self.client.user_name, &self.client.machine_name)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `ledger.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("ledger.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.database.max_connections == 0 {
        return Err(ConfigError::Invalid("database.max_connections must be > 0"));
    }
    if cfg.database.busy_timeout_ms == 0 {
        return Err(ConfigError::Invalid("database.busy_timeout_ms must be > 0"));
    }
    if let Some(url) = &cfg.database.url {
        if !url.starts_with("sqlite:") {
            return Err(ConfigError::Invalid("database.url must be a sqlite: URL"));
        }
    }
    if cfg.client.machine_name.trim().is_empty() {
        return Err(ConfigError::Invalid("client.machine_name must be non-empty"));
    }
    if cfg.client.user_name.trim().is_empty() {
        return Err(ConfigError::Invalid("client.user_name must be non-empty"));
    }
    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

database:
  max_connections: 4
  busy_timeout_ms: 5000

client:
  machine_name: "FRONT-DESK-1"
  user_name: "operator"
"#
}
