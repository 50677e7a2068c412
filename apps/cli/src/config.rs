//! CLI configuration file.
//!
//! Read from `$XDG_CONFIG_HOME/shipyard/config.json`, falling back to
//! `~/.config/shipyard/config.json`. Command-line flags win over anything
//! set here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shipyard_deploy::DeployerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Base URL of the platform API.
    pub server_url: Option<String>,
    /// WebSocket URL for pushed task events. Polling only when unset.
    pub events_url: Option<String>,
    pub token: Option<String>,
    pub poll_interval_secs: u64,
    pub deploy_timeout_secs: u64,
    /// Default ignore patterns.
    pub ignore: Vec<String>,
    /// Default overlay roots, lowest layer first.
    pub roots: Vec<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        let deployer = DeployerConfig::default();
        Self {
            server_url: None,
            events_url: None,
            token: None,
            poll_interval_secs: deployer.poll_interval.as_secs(),
            deploy_timeout_secs: deployer.deploy_timeout.as_secs(),
            ignore: Vec::new(),
            roots: Vec::new(),
        }
    }
}

impl CliConfig {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file yields defaults. So does an unparsable one, with a warning.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<CliConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn deployer_config(&self) -> DeployerConfig {
        DeployerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            deploy_timeout: Duration::from_secs(self.deploy_timeout_secs),
        }
    }
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("shipyard").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .map_err(|_| anyhow::anyhow!("APPDATA is not set; pass --config"))?;
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME")
            .map_err(|_| anyhow::anyhow!("HOME is not set; pass --config"))?;
        Ok(PathBuf::from(home).join(".config"))
    }
}
