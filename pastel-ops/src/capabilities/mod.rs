//! Host capability probing for pastel-ops
//!
//! Detects what this host can do before any orchestration starts:
//! - Service management backend (systemd or none)
//! - Privilege elevation (`sudo`, or already root)
//! - Interpreters needed by service tools (python3 for dd-service)

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::process::Command;
use tracing::debug;

/// Init system that service units are written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceBackend {
    Systemd,
    Unsupported,
}

impl fmt::Display for ServiceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceBackend::Systemd => f.write_str("systemd"),
            ServiceBackend::Unsupported => f.write_str("unsupported"),
        }
    }
}

/// Probe result, printed by `pastel-ops service status`
#[derive(Debug, Clone, Serialize)]
pub struct HostCapabilities {
    pub service_backend: ServiceBackend,
    pub can_elevate: bool,
    pub has_python3: bool,
}

pub struct CapabilityDetector;

impl CapabilityDetector {
    pub async fn detect_all() -> HostCapabilities {
        debug!("Detecting host capabilities...");

        let capabilities = HostCapabilities {
            service_backend: Self::detect_service_backend().await,
            can_elevate: Self::detect_elevation().await,
            has_python3: Self::command_exists("python3").await,
        };

        debug!(?capabilities, "Host capabilities detected");
        capabilities
    }

    /// systemd on Linux only; everything else gets the no-op manager
    pub async fn detect_service_backend() -> ServiceBackend {
        if cfg!(target_os = "linux") && Self::command_exists("systemctl").await {
            ServiceBackend::Systemd
        } else {
            ServiceBackend::Unsupported
        }
    }

    async fn detect_elevation() -> bool {
        #[cfg(unix)]
        if nix::unistd::Uid::effective().is_root() {
            return true;
        }
        Self::command_exists("sudo").await
    }

    async fn command_exists(command: &str) -> bool {
        let check_command = if cfg!(target_os = "windows") {
            Command::new("where").arg(command).output().await
        } else {
            Command::new("which").arg(command).output().await
        };

        match check_command {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}
