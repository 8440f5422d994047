//! Fleet command execution
//!
//! Runs the same command list on every host of the selected inventory
//! groups. Hosts are independent: a refused connection or a failing command
//! is recorded in that host's report and the batch moves on. With
//! `parallel`, each group runs as its own tokio task over its own copy of
//! the group and command list.

pub mod inventory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::errors::OpsError;
use crate::session::Connector;
pub use inventory::{Inventory, InventoryGroup};

#[derive(Debug, Clone, Default)]
pub struct FleetOptions {
    /// Empty means every group
    pub groups: Vec<String>,
    pub parallel: bool,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub group: String,
    pub host: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_error: Option<String>,
    pub commands: Vec<CommandReport>,
    pub finished_at: DateTime<Utc>,
}

impl HostReport {
    pub fn succeeded(&self) -> bool {
        self.connect_error.is_none() && self.commands.iter().all(|c| c.error.is_none())
    }
}

pub struct FleetExecutor {
    connector: Arc<dyn Connector>,
    default_user: String,
}

impl FleetExecutor {
    pub fn new(connector: Arc<dyn Connector>, default_user: impl Into<String>) -> Self {
        Self {
            connector,
            default_user: default_user.into(),
        }
    }

    /// One report per selected host. Only an unknown group name fails the
    /// whole call; host failures live in the reports.
    pub async fn run(&self, inventory: &Inventory, options: &FleetOptions) -> Result<Vec<HostReport>, OpsError> {
        let groups = inventory.select(&options.groups)?;
        info!(
            groups = groups.len(),
            commands = options.commands.len(),
            parallel = options.parallel,
            "Running fleet commands"
        );

        if !options.parallel {
            let mut reports = Vec::new();
            for group in groups {
                reports.extend(run_group(self.connector.as_ref(), group, &options.commands, &self.default_user).await);
            }
            return Ok(reports);
        }

        let tasks = groups.into_iter().map(|group| {
            let connector = self.connector.clone();
            let group = group.clone();
            let commands = options.commands.clone();
            let default_user = self.default_user.clone();
            tokio::spawn(async move { run_group(connector.as_ref(), &group, &commands, &default_user).await })
        });

        let mut reports = Vec::new();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(group_reports) => reports.extend(group_reports),
                Err(e) => error!("Fleet group task failed: {}", e),
            }
        }
        Ok(reports)
    }
}

async fn run_group(
    connector: &dyn Connector,
    group: &InventoryGroup,
    commands: &[String],
    default_user: &str,
) -> Vec<HostReport> {
    let mut reports = Vec::with_capacity(group.hosts.len());
    for host in &group.hosts {
        let endpoint = group.endpoint(host, default_user);
        let mut report = HostReport {
            group: group.name.clone(),
            host: host.name.clone(),
            endpoint: endpoint.to_string(),
            connect_error: None,
            commands: Vec::new(),
            finished_at: Utc::now(),
        };

        match connector.connect(&endpoint).await {
            Ok(mut session) => {
                for command in commands {
                    let result = session.run(command).await;
                    if let Err(e) = &result {
                        warn!(group = %group.name, host = %host.name, "`{}` failed: {}", command, e);
                    }
                    report.commands.push(CommandReport {
                        command: command.clone(),
                        output: result.as_ref().ok().cloned(),
                        error: result.err().map(|e| e.to_string()),
                    });
                }
                if let Err(e) = session.close() {
                    warn!(host = %host.name, "Failed to close session: {}", e);
                }
            }
            Err(e) => {
                warn!(group = %group.name, host = %host.name, "Skipping host: {}", e);
                report.connect_error = Some(e.to_string());
            }
        }

        report.finished_at = Utc::now();
        reports.push(report);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{command_failed, respond, FakeConnector, SessionScript};

    const INVENTORY: &str = r#"
groups:
  - name: G1
    common: { user: pastel }
    hosts:
      - { name: a1, address: 10.0.1.1 }
      - { name: a2, address: 10.0.1.2 }
  - name: G2
    hosts:
      - { name: b1, address: 10.0.2.1 }
"#;

    fn echo() -> SessionScript {
        SessionScript::new(respond(|cmd| match cmd {
            "echo ok" => Ok("ok".to_string()),
            other => Err(command_failed(other, "command not found")),
        }))
    }

    fn connector() -> Arc<FakeConnector> {
        Arc::new(
            FakeConnector::new()
                .with_host("10.0.1.1", echo())
                .with_host("10.0.1.2", echo())
                .with_host("10.0.2.1", echo()),
        )
    }

    #[tokio::test]
    async fn test_group_filter_touches_only_that_group() {
        let connector = connector();
        let executor = FleetExecutor::new(connector.clone(), "op");
        let inventory = Inventory::parse(INVENTORY).unwrap();
        let options = FleetOptions {
            groups: vec!["G1".to_string()],
            commands: vec!["echo ok".to_string()],
            ..FleetOptions::default()
        };

        let reports = executor.run(&inventory, &options).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.group == "G1" && r.succeeded()));
        assert_eq!(reports[0].commands[0].output.as_deref(), Some("ok"));
        assert_eq!(connector.connected_hosts(), ["10.0.1.1", "10.0.1.2"]);
    }

    #[tokio::test]
    async fn test_parallel_run_reports_every_selected_host() {
        let connector = connector();
        let executor = FleetExecutor::new(connector.clone(), "op");
        let inventory = Inventory::parse(INVENTORY).unwrap();
        let options = FleetOptions {
            groups: vec!["G2".to_string()],
            parallel: true,
            commands: vec!["echo ok".to_string()],
        };

        let reports = executor.run(&inventory, &options).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].host, "b1");

        let all = FleetOptions {
            groups: Vec::new(),
            ..options
        };
        let mut hosts: Vec<_> = executor
            .run(&inventory, &all)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.host)
            .collect();
        hosts.sort();
        assert_eq!(hosts, ["a1", "a2", "b1"]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_batch() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_host("10.0.1.2", echo())
                .with_host("10.0.2.1", echo()),
        );
        let executor = FleetExecutor::new(connector, "op");
        let inventory = Inventory::parse(INVENTORY).unwrap();
        let options = FleetOptions {
            commands: vec!["false".to_string(), "echo ok".to_string()],
            ..FleetOptions::default()
        };

        let reports = executor.run(&inventory, &options).await.unwrap();

        assert_eq!(reports.len(), 3);
        assert!(reports[0].connect_error.is_some());
        assert!(reports[0].commands.is_empty());

        let a2 = &reports[1];
        assert!(!a2.succeeded());
        assert!(a2.commands[0].error.is_some());
        assert_eq!(a2.commands[1].output.as_deref(), Some("ok"));
        assert_eq!(reports[2].commands.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_group_is_not_found() {
        let executor = FleetExecutor::new(connector(), "op");
        let inventory = Inventory::parse(INVENTORY).unwrap();
        let options = FleetOptions {
            groups: vec!["G3".to_string()],
            ..FleetOptions::default()
        };
        assert!(matches!(
            executor.run(&inventory, &options).await,
            Err(OpsError::NotFound(_))
        ));
    }
}
