//! Engine configuration.
//!
//! Loaded from an optional TOML file, then overridden by `FINETUNE_*`
//! environment variables, then by command-line flags in the binary.

use crate::controller::RunLimits;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const ENV_CONFIG: &str = "FINETUNE_CONFIG";
pub const ENV_DATA_DIR: &str = "FINETUNE_DATA_DIR";
pub const ENV_ADDRESS: &str = "FINETUNE_ADDRESS";
pub const ENV_DATABASE: &str = "FINETUNE_DATABASE";

/// HTTP adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: SocketAddr,
}

fn default_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 5195))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: default_address() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file; defaults to `<data_dir>/finetune.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    pub max_concurrent_runs: usize,
    pub max_pending_runs: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        let limits = RunLimits::default();
        Self {
            max_concurrent_runs: limits.max_concurrent_runs,
            max_pending_runs: limits.max_pending_runs,
        }
    }
}

/// Root configuration for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of per-run artifacts and the default database location.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub log_json: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./finetune-data")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            runs: RunsConfig::default(),
            log_filter: None,
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document; missing fields take their defaults.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if given, otherwise the file named by `FINETUNE_CONFIG`,
    /// otherwise defaults; then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`Self::load`] with an explicit environment lookup.
    pub fn load_with<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let from_env = env(ENV_CONFIG).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(file) => {
                let contents = std::fs::read_to_string(&file).map_err(|e| {
                    EngineError::Config(format!("failed to read {}: {e}", file.display()))
                })?;
                Self::from_toml(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = env(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(address) = env(ENV_ADDRESS) {
            self.server.address = address.parse()?;
        }
        if let Some(database) = env(ENV_DATABASE) {
            self.storage.database_path = Some(PathBuf::from(database));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.runs.max_concurrent_runs == 0 {
            return Err(EngineError::Config("runs.max_concurrent_runs must be >= 1".to_string()));
        }
        if self.runs.max_pending_runs < self.runs.max_concurrent_runs {
            return Err(EngineError::Config(
                "runs.max_pending_runs must be >= runs.max_concurrent_runs".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage.database_path.clone().unwrap_or_else(|| self.data_dir.join("finetune.db"))
    }

    #[must_use]
    pub fn limits(&self) -> RunLimits {
        RunLimits {
            max_concurrent_runs: self.runs.max_concurrent_runs,
            max_pending_runs: self.runs.max_pending_runs,
        }
    }
}
