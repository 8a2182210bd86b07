//! # relic-config
//!
//! Configuration management for the relic registry.
//!
//! Loads configuration from:
//! 1. `~/.relic/config.toml` (global)
//! 2. `.relic/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::debug;

/// Registry root override
pub const ENV_REGISTRY: &str = "RELIC_REGISTRY";
/// Walk thread count override
pub const ENV_THREADS: &str = "RELIC_THREADS";
/// Lock timeout override, in seconds
pub const ENV_LOCK_TIMEOUT: &str = "RELIC_LOCK_TIMEOUT";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub walk: WalkConfig,
    pub locks: LockConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        let project_path = Path::new(".relic/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config.merge(Self::from_file(project_path)?);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a single config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Global config path: ~/.relic/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".relic/config.toml"))
    }

    /// Merge a project config over this one. Values equal to the default
    /// are treated as unset.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.registry.root != defaults.registry.root {
            self.registry.root = other.registry.root;
        }
        if other.walk.threads.is_some() {
            self.walk.threads = other.walk.threads;
        }
        if other.walk.ignore_dot {
            self.walk.ignore_dot = true;
        }
        if other.walk.consume {
            self.walk.consume = true;
        }
        if !other.walk.link_whitelist.is_empty() {
            self.walk.link_whitelist = other.walk.link_whitelist;
        }
        if other.locks.timeout_secs != defaults.locks.timeout_secs {
            self.locks.timeout_secs = other.locks.timeout_secs;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_REGISTRY) {
            self.registry.root = PathBuf::from(path);
        }
        if let Ok(threads) = std::env::var(ENV_THREADS) {
            if let Ok(n) = threads.parse() {
                self.walk.threads = Some(n);
            }
        }
        if let Ok(timeout) = std::env::var(ENV_LOCK_TIMEOUT) {
            if let Ok(secs) = timeout.parse() {
                self.locks.timeout_secs = secs;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Registry location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root directory holding `<project>/<asset>/<version>` trees
    pub root: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.relic/registry"),
        }
    }
}

/// Directory walker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    /// Number of parallel workers (None = auto)
    pub threads: Option<usize>,
    /// Skip files and directories whose name starts with `.`
    pub ignore_dot: bool,
    /// Move owned files out of the staging directory instead of copying
    pub consume: bool,
    /// Absolute prefixes that external symlinks may point under
    pub link_whitelist: Vec<PathBuf>,
}

/// Lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long to wait for a project lock
    pub timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
