//! Service supervision for Pastel tools
//!
//! This module handles:
//! - Registering tools as init-system services (unit files)
//! - Start / stop / enable / disable
//! - State queries that always ask the init system, never a cache
//!
//! Hosts without a supported init system get [`NoopManager`]: every
//! operation succeeds without effect and every query answers `false`.

pub mod systemd;
pub mod tools;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::capabilities::ServiceBackend;
use crate::discovery::AddressResolver;
use crate::errors::OpsError;
use crate::execution::CommandRunner;
pub use systemd::SystemdManager;
pub use tools::{ServiceContext, ToolType};

/// Snapshot of a service as the init system reports it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceState {
    pub registered: bool,
    pub running: bool,
    pub enabled: bool,
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    fn service_name(&self, tool: ToolType) -> String {
        tools::unit_name(tool)
    }

    /// Write and load the unit; no-op when already registered or when the
    /// tool has no service form
    async fn register_service(&self, tool: ToolType, privileged: bool) -> Result<(), OpsError>;

    /// `Ok(true)` when the service is running afterwards. Unregistered or
    /// unsupported tools give `Ok(false)` without touching the init system.
    async fn start_service(&self, tool: ToolType) -> Result<bool, OpsError>;

    async fn stop_service(&self, tool: ToolType) -> Result<(), OpsError>;

    async fn enable_service(&self, tool: ToolType) -> Result<(), OpsError>;

    async fn disable_service(&self, tool: ToolType) -> Result<(), OpsError>;

    async fn is_running(&self, tool: ToolType) -> bool;

    async fn is_registered(&self, tool: ToolType) -> bool;

    async fn is_enabled(&self, tool: ToolType) -> bool;

    async fn service_state(&self, tool: ToolType) -> ServiceState {
        ServiceState {
            registered: self.is_registered(tool).await,
            running: self.is_running(tool).await,
            enabled: self.is_enabled(tool).await,
        }
    }
}

/// Manager for hosts without a supported init system
pub struct NoopManager;

#[async_trait]
impl ServiceManager for NoopManager {
    async fn register_service(&self, _tool: ToolType, _privileged: bool) -> Result<(), OpsError> {
        Ok(())
    }

    async fn start_service(&self, _tool: ToolType) -> Result<bool, OpsError> {
        Ok(false)
    }

    async fn stop_service(&self, _tool: ToolType) -> Result<(), OpsError> {
        Ok(())
    }

    async fn enable_service(&self, _tool: ToolType) -> Result<(), OpsError> {
        Ok(())
    }

    async fn disable_service(&self, _tool: ToolType) -> Result<(), OpsError> {
        Ok(())
    }

    async fn is_running(&self, _tool: ToolType) -> bool {
        false
    }

    async fn is_registered(&self, _tool: ToolType) -> bool {
        false
    }

    async fn is_enabled(&self, _tool: ToolType) -> bool {
        false
    }
}

/// Everything a concrete manager needs from the host
pub struct ManagerParts {
    pub runner: Arc<dyn CommandRunner>,
    pub resolver: Arc<dyn AddressResolver>,
    pub context: ServiceContext,
    pub unit_dir: PathBuf,
    pub staging_dir: PathBuf,
}

/// Pick the manager for the detected backend. An unsupported backend yields
/// the no-op manager together with the error the caller should report.
pub fn new_service_manager(
    backend: ServiceBackend,
    parts: ManagerParts,
) -> (Box<dyn ServiceManager>, Option<OpsError>) {
    match backend {
        ServiceBackend::Systemd => (
            Box::new(SystemdManager::new(
                parts.runner,
                parts.resolver,
                parts.context,
                parts.unit_dir,
                parts.staging_dir,
            )),
            None,
        ),
        ServiceBackend::Unsupported => {
            let reason = format!("no supported service manager on {}", std::env::consts::OS);
            warn!("{}, service operations are no-ops", reason);
            (Box::new(NoopManager), Some(OpsError::Unsupported(reason)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Network;
    use crate::discovery::StaticAddressResolver;
    use crate::testing::FakeRunner;

    fn parts(runner: Arc<FakeRunner>) -> ManagerParts {
        ManagerParts {
            runner,
            resolver: Arc::new(StaticAddressResolver("203.0.113.5".to_string())),
            context: ServiceContext {
                exec_dir: PathBuf::from("/opt/pastel"),
                working_dir: PathBuf::from("/var/lib/pastel"),
                network: Network::Mainnet,
                dev_mode: false,
                masternode_key: None,
                run_as_user: "pastel".to_string(),
            has_python3: true,
            },
            unit_dir: PathBuf::from("/etc/systemd/system"),
            staging_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_unsupported_backend_is_noop_with_error() {
        let runner = Arc::new(FakeRunner::new(|_: &str| Ok(String::new())));
        let (manager, err) = new_service_manager(ServiceBackend::Unsupported, parts(runner.clone()));

        assert!(matches!(err, Some(OpsError::Unsupported(_))));
        for tool in ToolType::ALL {
            manager.register_service(tool, true).await.unwrap();
            assert!(!manager.start_service(tool).await.unwrap());
            manager.stop_service(tool).await.unwrap();
            manager.enable_service(tool).await.unwrap();
            manager.disable_service(tool).await.unwrap();
            assert_eq!(manager.service_state(tool).await, ServiceState::default());
        }
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_systemd_backend_has_no_error() {
        let runner = Arc::new(FakeRunner::new(|_: &str| Ok(String::new())));
        let (manager, err) = new_service_manager(ServiceBackend::Systemd, parts(runner));

        assert!(err.is_none());
        assert_eq!(manager.service_name(ToolType::Hermes), "pastel-hermes.service");
    }
}
