//! Configuration file loading for the agentbox CLI.
//!
//! The file is JSON. Every field has a default, so `{}` is valid and a
//! missing file at the default location means "use the defaults".

use agentbox_proxy::{EnvConfig, ProxyConfig, ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration looked up when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = ".agentbox/config.json";

/// Audit log location when neither `--log` nor `log_path` is set.
pub const DEFAULT_LOG_PATH: &str = ".agentbox/network.log";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub env: EnvConfig,

    /// Audit log path, overridden by `--log`
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// Load `explicit` if given (it must exist), otherwise the default
    /// location if present, otherwise built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default = Path::new(DEFAULT_CONFIG_PATH);
        if default.exists() {
            Self::load(default)
        } else {
            Ok(Self::default())
        }
    }

    /// The audit log path: `cli` wins over the file, then the default.
    #[must_use]
    pub fn log_path(&self, cli: Option<&Path>) -> PathBuf {
        cli.map(Path::to_path_buf)
            .or_else(|| self.log_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH))
    }
}
