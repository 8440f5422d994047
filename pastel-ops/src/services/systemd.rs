//! systemd-backed service manager
//!
//! State is always read back from `systemctl`; the unit may have been
//! changed by an operator or by systemd itself since the last call.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::tools::{unit_name, ServiceContext, ServiceDescriptor, ToolType};
use super::ServiceManager;
use crate::discovery::AddressResolver;
use crate::errors::OpsError;
use crate::execution::{CommandRunner, Invocation};

pub struct SystemdManager {
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn AddressResolver>,
    context: ServiceContext,
    unit_dir: PathBuf,
    staging_dir: PathBuf,
}

impl SystemdManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn AddressResolver>,
        context: ServiceContext,
        unit_dir: PathBuf,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            resolver,
            context,
            unit_dir,
            staging_dir,
        }
    }

    fn systemctl<I, S>(args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new("systemctl", args)
    }

    async fn exec(&self, invocation: &Invocation, elevated: bool) -> Result<String, OpsError> {
        if elevated {
            self.runner.run_elevated(invocation).await
        } else {
            self.runner.run(invocation).await
        }
    }

    /// Output of a status query. systemctl exits non-zero for negative answers
    /// (inactive, no unit files), so that output is an answer too.
    async fn query(&self, verb: &str, tool: ToolType) -> Option<String> {
        let invocation = Self::systemctl([verb.to_string(), unit_name(tool)]);
        match self.runner.run(&invocation).await {
            Ok(output) => Some(output),
            Err(OpsError::Command { output, .. }) => Some(output),
            Err(e) => {
                warn!(tool = %tool, "`{}` failed: {}", invocation, e);
                None
            }
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn register_service(&self, tool: ToolType, privileged: bool) -> Result<(), OpsError> {
        let Some(profile) = tool.service_profile() else {
            debug!(tool = %tool, "No service support for tool, nothing to register");
            return Ok(());
        };

        if self.is_registered(tool).await {
            info!(tool = %tool, "Service already registered");
            return Ok(());
        }

        let executable = (profile.executable)(&self.context);
        if !tokio::fs::try_exists(&executable).await.unwrap_or(false) {
            return Err(OpsError::NotFound(format!(
                "{} executable {}",
                tool,
                executable.display()
            )));
        }

        if profile.needs_python3 && !self.context.has_python3 {
            return Err(OpsError::NotFound(format!("python3 interpreter for {}", tool)));
        }

        let external_ip = if profile.needs_external_ip {
            Some(self.resolver.external_ip().await?)
        } else {
            None
        };

        let descriptor = ServiceDescriptor::build(tool, &profile, &self.context, external_ip.as_deref())?;
        let unit = descriptor.render_unit(&self.context.run_as_user);

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = self.staging_dir.join(&descriptor.unit_name);
        tokio::fs::write(&staged, unit).await?;

        let target = self.unit_dir.join(&descriptor.unit_name);
        let copy = Invocation::new(
            "cp",
            [staged.to_string_lossy().to_string(), target.to_string_lossy().to_string()],
        );
        self.exec(&copy, privileged).await?;
        self.exec(&Self::systemctl(["daemon-reload"]), privileged).await?;

        info!(tool = %tool, unit = %descriptor.unit_name, "Service registered");
        Ok(())
    }

    async fn start_service(&self, tool: ToolType) -> Result<bool, OpsError> {
        if tool.service_profile().is_none() {
            return Ok(false);
        }
        if !self.is_registered(tool).await {
            warn!(tool = %tool, "Service is not registered, not starting it");
            return Ok(false);
        }
        if self.is_running(tool).await {
            info!(tool = %tool, "Service already running");
            return Ok(true);
        }

        self.runner
            .run_elevated(&Self::systemctl(["start".to_string(), unit_name(tool)]))
            .await?;
        info!(tool = %tool, "Service started");
        Ok(true)
    }

    async fn stop_service(&self, tool: ToolType) -> Result<(), OpsError> {
        if !self.is_running(tool).await {
            debug!(tool = %tool, "Service not running, nothing to stop");
            return Ok(());
        }

        self.runner
            .run_elevated(&Self::systemctl(["stop".to_string(), unit_name(tool)]))
            .await?;
        info!(tool = %tool, "Service stopped");
        Ok(())
    }

    async fn enable_service(&self, tool: ToolType) -> Result<(), OpsError> {
        if tool.service_profile().is_none() {
            return Ok(());
        }
        self.runner
            .run_elevated(&Self::systemctl(["enable".to_string(), unit_name(tool)]))
            .await
            .map(|_| ())
    }

    async fn disable_service(&self, tool: ToolType) -> Result<(), OpsError> {
        if tool.service_profile().is_none() {
            return Ok(());
        }
        self.runner
            .run_elevated(&Self::systemctl(["disable".to_string(), unit_name(tool)]))
            .await
            .map(|_| ())
    }

    async fn is_running(&self, tool: ToolType) -> bool {
        if tool.service_profile().is_none() {
            return false;
        }
        matches!(
            self.query("is-active", tool).await.as_deref().map(str::trim),
            Some("active") | Some("activating")
        )
    }

    async fn is_registered(&self, tool: ToolType) -> bool {
        if tool.service_profile().is_none() {
            return false;
        }
        match self.query("list-unit-files", tool).await {
            Some(output) => !output.contains("0 unit files listed"),
            None => false,
        }
    }

    async fn is_enabled(&self, tool: ToolType) -> bool {
        if tool.service_profile().is_none() {
            return false;
        }
        self.query("is-enabled", tool).await.as_deref().map(str::trim) == Some("enabled")
    }
}
