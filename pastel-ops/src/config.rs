//! Configuration management with secure storage
//!
//! Handles:
//! - Local installation layout (executables, data directory)
//! - Remote (hot node) installation layout and SSH defaults
//! - systemd unit settings
//! - Polling budgets for liveness, sync and balance checks
//! - Elevation credentials (OS keyring, never written to disk)

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bootstrap::polling::PollBudget;

const KEYRING_SERVICE: &str = "pastel-ops";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub remote: RemoteConfig,
    pub service: ServiceConfig,
    pub polling: PollingConfig,
    pub elevation: ElevationConfig,
    /// File this config was loaded from; `save` writes back to it
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `pasteld`, `pastel-cli` and the service binaries
    pub pastel_exec_dir: PathBuf,
    /// Node data directory (`pastel.conf`, `masternode.conf`) and service working dirs
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Installation directory on the hot node; required for bootstrap
    pub pastel_dir: Option<String>,
    /// Data directory on the hot node; the daemon default is used when unset
    pub working_dir: Option<String>,
    /// pastel-ops binary on the hot node; defaults to `<pastel_dir>/pastel-ops`
    pub agent_path: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// `User=` in generated units; the invoking user when unset
    pub run_as_user: Option<String>,
    pub unit_dir: PathBuf,
    pub dev_mode: bool,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub liveness_attempts: u32,
    pub liveness_interval_secs: u64,
    pub sync_attempts: u32,
    pub sync_interval_secs: u64,
    pub balance_interval_secs: u64,
    pub balance_reprompt_after: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationConfig {
    pub store_credentials: bool,
    #[serde(skip)] // Never serialize passwords
    pub cached_password: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            pastel_exec_dir: home.join("pastel"),
            working_dir: home.join(".pastel"),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            pastel_dir: None,
            working_dir: None,
            agent_path: None,
            host: None,
            port: crate::session::DEFAULT_SSH_PORT,
            user: None,
            identity_file: None,
            connect_timeout_secs: 15,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            run_as_user: None,
            unit_dir: PathBuf::from("/etc/systemd/system"),
            dev_mode: false,
            command_timeout_secs: 120,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            liveness_attempts: 12,
            liveness_interval_secs: 5,
            sync_attempts: 360,
            sync_interval_secs: 10,
            balance_interval_secs: 10,
            balance_reprompt_after: 30,
        }
    }
}

impl PollingConfig {
    pub fn liveness(&self) -> PollBudget {
        PollBudget::new(self.liveness_attempts, Duration::from_secs(self.liveness_interval_secs))
    }

    pub fn sync(&self) -> PollBudget {
        PollBudget::new(self.sync_attempts, Duration::from_secs(self.sync_interval_secs))
    }
}

impl AppConfig {
    /// Load config from an explicit path or the OS-specific location
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::config_file_path()?,
        };

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<AppConfig>(&content)
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))?
        } else if explicit.is_some() {
            anyhow::bail!("Configuration file not found: {}", config_path.display());
        } else {
            Self::default()
        };

        // Load password from secure keyring if enabled
        if config.elevation.store_credentials {
            config.elevation.cached_password = Self::load_password().ok();
        }

        config.source = Some(config_path);
        Ok(config)
    }

    /// Save config where it was loaded from, or to the OS-specific location.
    /// Returns the path written.
    pub async fn save(&self) -> Result<PathBuf> {
        let config_path = match &self.source {
            Some(path) => path.clone(),
            None => Self::config_file_path()?,
        };

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;

        if self.elevation.store_credentials {
            if let Some(password) = &self.elevation.cached_password {
                Self::save_password(password)?;
            }
        }

        Ok(config_path)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("pastel-ops");
        path.push("config.toml");
        Ok(path)
    }

    pub fn pastel_conf_path(&self) -> PathBuf {
        self.paths.working_dir.join("pastel.conf")
    }

    pub fn masternode_conf_path(&self) -> PathBuf {
        self.paths.working_dir.join("masternode.conf")
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.service.command_timeout_secs)
    }

    fn load_password() -> Result<String> {
        let entry = Entry::new(KEYRING_SERVICE, "elevation-password")?;
        entry.get_password().map_err(Into::into)
    }

    fn save_password(password: &str) -> Result<()> {
        let entry = Entry::new(KEYRING_SERVICE, "elevation-password")?;
        entry.set_password(password).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.polling.liveness_attempts, 12);
        assert_eq!(config.polling.liveness().interval, Duration::from_secs(5));
        assert_eq!(config.service.unit_dir, PathBuf::from("/etc/systemd/system"));
        assert!(config.masternode_conf_path().ends_with(".pastel/masternode.conf"));
    }

    #[test]
    fn test_config_file_path() {
        let path = AppConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("pastel-ops"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[remote]\npastel_dir = \"/opt/pastel\"\nhost = \"203.0.113.5\"\n\n[polling]\nliveness_attempts = 3\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.remote.pastel_dir.as_deref(), Some("/opt/pastel"));
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.polling.liveness_attempts, 3);
        assert_eq!(config.polling.liveness_interval_secs, 5);
        assert!(config.elevation.cached_password.is_none());
    }

    #[tokio::test]
    async fn test_save_writes_back_to_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[remote]\nhost = \"203.0.113.5\"\n").unwrap();

        let mut config = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        config.remote.host = Some("198.51.100.7".to_string());

        let saved = config.save().await.unwrap();
        assert_eq!(saved, path);

        let reloaded = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(reloaded.remote.host.as_deref(), Some("198.51.100.7"));
        assert!(!std::fs::read_to_string(&path).unwrap().contains("source"));
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).await.is_err());
    }
}
