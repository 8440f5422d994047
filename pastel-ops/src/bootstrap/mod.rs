//! Cold/hot masternode bootstrap
//!
//! Handles the linear run that takes a cold wallet node and a hot remote
//! node to a running, service-managed masternode:
//! - Resolving layout, network and the masternode entry before any remote action
//! - One SSH session reused for every remote command of the run
//! - Preparing (key, PastelID, funding) and persisting the entry
//! - Detached masternode launch plus liveness and sync polling
//! - Activation, optional mnid ticket, and handing off to remote services
//!
//! Every failure carries the name of the step that produced it. Nothing is
//! rolled back; each step detects work that is already done.

pub mod cancel;
pub mod masternode_conf;
pub mod polling;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::balance::{BalancePolicy, BalanceReconciler};
use crate::config::AppConfig;
use crate::daemon::{is_live, parse_outputs, parse_pastel_id, LaunchMode, Network, NodeTools};
use crate::discovery::{local_user, AddressResolver};
use crate::errors::OpsError;
use crate::execution::{CommandRunner, Invocation};
use crate::session::{Connector, Credential, NodeEndpoint, RemoteSession};
use crate::wizard::Operator;
pub use cancel::{cancellation, Cancellation};
use masternode_conf::{EntryRequest, MasternodeConf, MasternodeConfigEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    ResolvePaths,
    ResolveMasternode,
    OpenSession,
    StartLocalNode,
    PrepareMasternode,
    LaunchRemoteMasternode,
    WaitRemoteLive,
    WaitRemoteSync,
    Activate,
    RegisterPastelId,
    StopLocalNode,
    StartRqService,
    StartMasternodeService,
}

impl BootstrapStep {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapStep::ResolvePaths => "resolve-paths",
            BootstrapStep::ResolveMasternode => "resolve-masternode",
            BootstrapStep::OpenSession => "open-session",
            BootstrapStep::StartLocalNode => "start-local-node",
            BootstrapStep::PrepareMasternode => "prepare-masternode",
            BootstrapStep::LaunchRemoteMasternode => "launch-remote-masternode",
            BootstrapStep::WaitRemoteLive => "wait-remote-live",
            BootstrapStep::WaitRemoteSync => "wait-remote-sync",
            BootstrapStep::Activate => "activate",
            BootstrapStep::RegisterPastelId => "register-pastelid",
            BootstrapStep::StopLocalNode => "stop-local-node",
            BootstrapStep::StartRqService => "start-service rq-service",
            BootstrapStep::StartMasternodeService => "start-service masternode",
        }
    }
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run choices, built from CLI flags
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    pub name: String,
    pub create: bool,
    pub update: bool,
    pub external_ip: Option<String>,
    pub external_port: Option<u16>,
    pub txid: Option<String>,
    pub tx_index: Option<u32>,
    pub passphrase: Option<String>,
    pub activate: bool,
    pub register: bool,
}

impl BootstrapOptions {
    fn prepares(&self) -> bool {
        self.create || self.update
    }
}

/// Everything outside the process the run talks to
pub struct Collaborators<'a> {
    pub runner: &'a dyn CommandRunner,
    pub connector: &'a dyn Connector,
    pub resolver: &'a dyn AddressResolver,
    pub operator: &'a dyn Operator,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub run_id: Uuid,
    pub network: Network,
    pub masternode: String,
    pub external_address: String,
    pub pastel_id: String,
    pub prepared: bool,
    pub activated: bool,
    pub registration: Option<String>,
}

struct Plan {
    network: Network,
    local: NodeTools,
    remote: NodeTools,
    conf: MasternodeConf,
    entry: MasternodeConfigEntry,
}

pub struct Bootstrap<'a> {
    config: &'a AppConfig,
    options: &'a BootstrapOptions,
    with: Collaborators<'a>,
    cancel: Cancellation,
    run_id: Uuid,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        config: &'a AppConfig,
        options: &'a BootstrapOptions,
        with: Collaborators<'a>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            config,
            options,
            with,
            cancel,
            run_id: Uuid::new_v4(),
        }
    }

    pub async fn run(&self) -> Result<BootstrapReport, OpsError> {
        info!(run_id = %self.run_id, masternode = %self.options.name, "🚀 Starting masternode bootstrap");

        let (remote, endpoint) = self.step(BootstrapStep::ResolvePaths, self.resolve_paths()).await?;
        let mut plan = self
            .step(BootstrapStep::ResolveMasternode, self.resolve_masternode(remote))
            .await?;
        let mut session = self
            .step(BootstrapStep::OpenSession, self.open_session(&endpoint, &plan.remote))
            .await?;

        let result = self.drive(session.as_ref(), &mut plan).await;
        if let Err(e) = session.close() {
            warn!(run_id = %self.run_id, "Failed to close session to {}: {}", endpoint, e);
        }

        match &result {
            Ok(_) => info!(run_id = %self.run_id, "🎉 Masternode {} is up", self.options.name),
            Err(e) => error!(run_id = %self.run_id, "Bootstrap stopped: {}", e),
        }
        result
    }

    async fn drive(&self, session: &dyn RemoteSession, plan: &mut Plan) -> Result<BootstrapReport, OpsError> {
        self.step(BootstrapStep::StartLocalNode, self.start_local_node(&plan.local))
            .await?;

        if self.options.prepares() {
            let entry = self
                .step(BootstrapStep::PrepareMasternode, self.prepare(session, plan))
                .await?;
            plan.entry = entry;
        } else {
            info!("Using masternode `{}` from masternode.conf as-is", plan.entry.name);
        }

        let entry = &plan.entry;
        self.step(BootstrapStep::LaunchRemoteMasternode, async {
            entry.ensure_launchable()?;
            let launch = plan.remote.launch(
                LaunchMode::Masternode {
                    private_key: &entry.private_key,
                },
                Some(&entry.external_ip),
            );
            session.spawn_detached(&launch.to_shell()).await
        })
        .await?;

        self.step(
            BootstrapStep::WaitRemoteLive,
            polling::wait_remote_live(session, &plan.remote, self.config.polling.liveness()),
        )
        .await?;
        self.step(
            BootstrapStep::WaitRemoteSync,
            polling::wait_remote_synced(session, &plan.remote, self.config.polling.sync()),
        )
        .await?;

        if self.options.activate {
            self.step(BootstrapStep::Activate, async {
                let output = self.with.runner.run(&plan.local.start_alias(&entry.name)).await?;
                info!("start-alias {}: {}", entry.name, output);
                Ok::<_, OpsError>(())
            })
            .await?;
        }

        let registration = if self.options.register {
            let txid = self
                .step(BootstrapStep::RegisterPastelId, self.register_pastel_id(session, &plan.remote, entry))
                .await?;
            Some(txid)
        } else {
            None
        };

        self.step(BootstrapStep::StopLocalNode, async {
            self.with.runner.run(&plan.local.stop()).await.map(|_| ())
        })
        .await?;

        let agent = self.agent_path(&plan.remote);
        self.step(BootstrapStep::StartRqService, async {
            let start = Invocation::new(agent.clone(), ["service", "start", "rq-service"]);
            session.run(&start.to_shell()).await.map(|_| ())
        })
        .await?;
        self.step(BootstrapStep::StartMasternodeService, async {
            // the detached daemon holds the data dir lock until it exits
            session.run_discard(&plan.remote.stop().to_shell()).await?;
            polling::wait_remote_down(session, &plan.remote, self.config.polling.liveness()).await?;
            let start = Invocation::new(
                agent.clone(),
                [
                    "service".to_string(),
                    "start".to_string(),
                    "masternode".to_string(),
                    "--private-key".to_string(),
                    entry.private_key.clone(),
                ],
            );
            session.run(&start.to_shell()).await.map(|_| ())
        })
        .await?;

        Ok(BootstrapReport {
            run_id: self.run_id,
            network: plan.network,
            masternode: entry.name.clone(),
            external_address: format!("{}:{}", entry.external_ip, entry.external_port),
            pastel_id: entry.pastel_id.clone(),
            prepared: self.options.prepares(),
            activated: self.options.activate,
            registration,
        })
    }

    /// Cancellation check, step logging and step-name wrapping around `fut`
    async fn step<T, F>(&self, step: BootstrapStep, fut: F) -> Result<T, OpsError>
    where
        F: Future<Output = Result<T, OpsError>>,
    {
        self.cancel.check().map_err(|e| e.at_step(step.as_str()))?;

        info!(run_id = %self.run_id, step = step.as_str(), "▶️  {}", step);
        let started = Instant::now();
        let result = self.cancel.guard(fut).await;

        match result {
            Ok(value) => {
                info!(
                    run_id = %self.run_id,
                    step = step.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "✅ {}",
                    step
                );
                Ok(value)
            }
            Err(e) => Err(e.at_step(step.as_str())),
        }
    }

    async fn resolve_paths(&self) -> Result<(NodeTools, NodeEndpoint), OpsError> {
        let remote = NodeTools::remote(&self.config.remote, Network::default())?;

        let host = self
            .config
            .remote
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| OpsError::NotFound("hot node address (remote.host)".to_string()))?;
        let credential = match &self.config.remote.identity_file {
            Some(path) => Credential::KeyFile(path.clone()),
            None => Credential::Agent,
        };
        let endpoint = NodeEndpoint {
            host,
            port: self.config.remote.port,
            user: self.config.remote.user.clone().unwrap_or_else(local_user),
            credential,
        };

        Ok((remote, endpoint))
    }

    async fn resolve_masternode(&self, remote: NodeTools) -> Result<Plan, OpsError> {
        let options = self.options;
        if options.name.is_empty() {
            return Err(OpsError::Precondition("masternode name is required".to_string()));
        }

        let network = Network::read_pastel_conf(&self.config.pastel_conf_path()).await?;
        info!(network = %network, "Local node network");
        let local = NodeTools::local(&self.config.paths, network);
        let remote = remote.on_network(network);

        let conf = MasternodeConf::load(&self.config.masternode_conf_path()).await?;
        let existing = conf.get(&options.name)?;

        let entry = if options.prepares() {
            if options.update && !options.create && existing.is_none() {
                return Err(OpsError::Precondition(format!(
                    "masternode `{}` is not in masternode.conf; use --create",
                    options.name
                )));
            }

            let external_ip = match options.external_ip.clone().or_else(|| existing.as_ref().map(|e| e.external_ip.clone())) {
                Some(ip) => ip,
                None => self.with.resolver.external_ip().await?,
            };
            let txid = options
                .txid
                .clone()
                .or_else(|| existing.as_ref().map(|e| e.txid.clone()))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| OpsError::Precondition("collateral transaction id (--txid) is required".to_string()))?;
            let passphrase = options
                .passphrase
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| OpsError::Precondition("PastelID passphrase (--passphrase) is required".to_string()))?;

            EntryRequest {
                name: options.name.clone(),
                external_ip,
                external_port: options
                    .external_port
                    .or_else(|| existing.as_ref().map(|e| e.external_port))
                    .unwrap_or_else(|| network.masternode_port()),
                txid,
                tx_index: options
                    .tx_index
                    .or_else(|| existing.as_ref().map(|e| e.tx_index))
                    .unwrap_or(0),
                passphrase: Some(passphrase),
            }
            .merge(existing.as_ref())
        } else {
            let mut entry = existing.ok_or_else(|| {
                OpsError::Precondition(format!(
                    "masternode `{}` is not in masternode.conf; use --create",
                    options.name
                ))
            })?;
            entry.ensure_launchable()?;
            entry.passphrase = options.passphrase.clone();
            entry
        };

        if options.register && entry.passphrase.as_deref().map_or(true, str::is_empty) {
            return Err(OpsError::Precondition(
                "--register needs the PastelID passphrase (--passphrase)".to_string(),
            ));
        }

        Ok(Plan {
            network,
            local,
            remote,
            conf,
            entry,
        })
    }

    async fn open_session(&self, endpoint: &NodeEndpoint, remote: &NodeTools) -> Result<Box<dyn RemoteSession>, OpsError> {
        let mut session = self.with.connector.connect(endpoint).await?;

        let check = format!("test -x {}", shell_words::quote(remote.pasteld_path()));
        match session.run(&check).await {
            Ok(_) => Ok(session),
            Err(e) => {
                let _ = session.close();
                Err(match e {
                    OpsError::Command { .. } => {
                        OpsError::NotFound(format!("pasteld at {} on {}", remote.pasteld_path(), endpoint))
                    }
                    other => other,
                })
            }
        }
    }

    async fn start_local_node(&self, local: &NodeTools) -> Result<(), OpsError> {
        if let Ok(output) = self.with.runner.run(&local.get_info()).await {
            if is_live(&output) {
                info!("Local pasteld already running");
                return Ok(());
            }
        }

        self.with.runner.run(&local.launch(LaunchMode::Plain, None)).await?;
        polling::wait_local_live(self.with.runner, local, self.config.polling.liveness()).await
    }

    async fn prepare(&self, session: &dyn RemoteSession, plan: &mut Plan) -> Result<MasternodeConfigEntry, OpsError> {
        let mut entry = plan.entry.clone();
        let passphrase = entry
            .passphrase
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| OpsError::Precondition("PastelID passphrase is required".to_string()))?;
        self.verify_collateral(&plan.local, &entry).await?;

        let launch = plan.remote.launch(LaunchMode::Plain, Some(&entry.external_ip));
        session.spawn_detached(&launch.to_shell()).await?;
        polling::wait_remote_live(session, &plan.remote, self.config.polling.liveness()).await?;

        BalanceReconciler {
            runner: self.with.runner,
            session,
            local: &plan.local,
            remote: &plan.remote,
            operator: self.with.operator,
            policy: BalancePolicy::from_config(&self.config.polling),
        }
        .reconcile()
        .await?;

        if entry.private_key.is_empty() {
            let command = plan.remote.masternode_genkey().to_shell();
            let key = session.run(&command).await?;
            if key.is_empty() {
                return Err(OpsError::Parse {
                    command,
                    detail: "empty masternode key".to_string(),
                });
            }
            info!("Generated masternode private key");
            entry.private_key = key;
        } else {
            info!("Reusing masternode private key from masternode.conf");
        }

        if entry.pastel_id.is_empty() {
            // passphrase stays out of error reports
            let shown = "pastel-cli pastelid newkey";
            let output = session
                .run(&plan.remote.pastelid_newkey(&passphrase).to_shell())
                .await
                .map_err(|e| redact(e, shown))?;
            entry.pastel_id = parse_pastel_id(shown, &output)?;
            info!(pastel_id = %entry.pastel_id, "Generated PastelID");
        } else {
            info!(pastel_id = %entry.pastel_id, "Reusing PastelID from masternode.conf");
        }

        session.run_discard(&plan.remote.stop().to_shell()).await?;
        polling::wait_remote_down(session, &plan.remote, self.config.polling.liveness()).await?;

        plan.conf.upsert(&entry, plan.network);
        plan.conf.save().await?;
        Ok(entry)
    }

    /// Checks the collateral against `masternode outputs` when the wallet can
    /// answer; an unanswered query only warns
    async fn verify_collateral(&self, local: &NodeTools, entry: &MasternodeConfigEntry) -> Result<(), OpsError> {
        let invocation = local.masternode_outputs();
        let output = match self.with.runner.run(&invocation).await {
            Ok(output) => output,
            Err(OpsError::Command { output, .. }) => {
                warn!("Could not list masternode outputs, collateral not verified: {}", output);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outputs = parse_outputs(&invocation.to_shell(), &output)?;
        if outputs.get(&entry.txid) == Some(&entry.tx_index.to_string()) {
            Ok(())
        } else {
            Err(OpsError::Precondition(format!(
                "collateral {}:{} is not among the wallet's masternode outputs",
                entry.txid, entry.tx_index
            )))
        }
    }

    async fn register_pastel_id(
        &self,
        session: &dyn RemoteSession,
        remote: &NodeTools,
        entry: &MasternodeConfigEntry,
    ) -> Result<String, OpsError> {
        let passphrase = entry.passphrase.as_deref().unwrap_or_default();
        if entry.pastel_id.is_empty() {
            return Err(OpsError::Precondition(format!(
                "masternode `{}` has no PastelID; run with --create or --update",
                entry.name
            )));
        }

        let output = session
            .run(&remote.register_mnid(&entry.pastel_id, passphrase).to_shell())
            .await
            .map_err(|e| redact(e, "pastel-cli tickets register mnid"))?;
        let txid = serde_json::from_str::<serde_json::Value>(&output)
            .ok()
            .and_then(|v| v.get("txid").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or(output);
        info!(txid = %txid, "mnid ticket registered");
        Ok(txid)
    }

    fn agent_path(&self, remote: &NodeTools) -> String {
        self.config.remote.agent_path.clone().unwrap_or_else(|| {
            let pasteld = remote.pasteld_path();
            match pasteld.rsplit_once('/') {
                Some((dir, _)) => format!("{}/pastel-ops", dir),
                None => "pastel-ops".to_string(),
            }
        })
    }
}

/// Replaces a failed command line that carried a secret
fn redact(error: OpsError, shown: &str) -> OpsError {
    match error {
        OpsError::Command { code, output, .. } => OpsError::Command {
            command: shown.to_string(),
            code,
            output,
        },
        other => other,
    }
}
