//! Pastel Ops - cold/hot masternode operations
//!
//! Operator CLI for Pastel nodes:
//! - `bootstrap`: bring a hot masternode up from the local cold wallet over SSH
//! - `service`: register and control Pastel tools under the init system
//! - `fleet`: run commands across an inventory of hosts
//! - `setup`: interactive configuration wizard

mod balance;
mod bootstrap;
mod capabilities;
mod config;
mod daemon;
mod discovery;
mod errors;
mod execution;
mod fleet;
mod services;
mod session;
mod wizard;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bootstrap::{cancellation, Bootstrap, BootstrapOptions, Collaborators};
use capabilities::CapabilityDetector;
use config::AppConfig;
use daemon::Network;
use discovery::{AddressResolver, HttpAddressResolver, StaticAddressResolver};
use errors::OpsError;
use execution::LocalRunner;
use fleet::{FleetExecutor, FleetOptions, Inventory};
use services::{ManagerParts, ServiceContext, ServiceManager, ToolType};
use session::SshConnector;
use wizard::{ConsolePrompt, Operator, SetupWizard, Unattended};

#[derive(Parser)]
#[command(name = "pastel-ops", version, about = "Cold/hot masternode operations for Pastel nodes")]
struct Cli {
    /// Configuration file (default: <config dir>/pastel-ops/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Answer every confirmation with yes; nobody is at the terminal
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive configuration wizard
    Setup,
    /// Prepare, launch and activate a hot masternode
    Bootstrap(BootstrapArgs),
    /// Control a Pastel tool as an init-system service
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
    /// Run commands on every host of an inventory
    Fleet(FleetArgs),
}

#[derive(Args)]
struct BootstrapArgs {
    /// Masternode name (alias in masternode.conf)
    name: String,
    /// Add the entry to masternode.conf, generating key and PastelID
    #[arg(long, conflicts_with = "update")]
    create: bool,
    /// Rewrite an existing entry, keeping its key and PastelID
    #[arg(long)]
    update: bool,
    #[arg(long)]
    external_ip: Option<String>,
    #[arg(long)]
    external_port: Option<u16>,
    /// Collateral transaction id
    #[arg(long)]
    txid: Option<String>,
    /// Collateral output index
    #[arg(long)]
    tx_index: Option<u32>,
    /// PastelID passphrase; read from PASTEL_ID_PASSPHRASE when omitted
    #[arg(long)]
    passphrase: Option<String>,
    /// Run `masternode start-alias` from the cold wallet
    #[arg(long)]
    activate: bool,
    /// Register the mnid ticket once the node is synced
    #[arg(long)]
    register: bool,
}

#[derive(Subcommand)]
enum ServiceAction {
    /// Write and load the unit file
    Register { tool: ToolType },
    /// Register if needed, start and enable
    Start {
        tool: ToolType,
        /// Masternode private key (masternode only)
        #[arg(long)]
        private_key: Option<String>,
    },
    Stop { tool: ToolType },
    Enable { tool: ToolType },
    Disable { tool: ToolType },
    /// Print registered/running/enabled; every service tool when none is named
    Status { tool: Option<ToolType> },
}

impl ServiceAction {
    fn tools(&self) -> Vec<ToolType> {
        match self {
            ServiceAction::Register { tool }
            | ServiceAction::Start { tool, .. }
            | ServiceAction::Stop { tool }
            | ServiceAction::Enable { tool }
            | ServiceAction::Disable { tool }
            | ServiceAction::Status { tool: Some(tool) } => vec![*tool],
            ServiceAction::Status { tool: None } => ToolType::ALL
                .into_iter()
                .filter(|t| t.service_profile().is_some())
                .collect(),
        }
    }
}

#[derive(Args)]
struct FleetArgs {
    /// Inventory file (native or Ansible YAML)
    #[arg(short, long)]
    inventory: PathBuf,
    /// Only these groups (repeatable)
    #[arg(short, long = "group")]
    groups: Vec<String>,
    /// One task per group
    #[arg(long)]
    parallel: bool,
    /// Command to run (repeatable, runs in order)
    #[arg(short, long = "command", required = true)]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "pastel_ops=debug" } else { "pastel_ops=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if report_failure(&e) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    let operator: Box<dyn Operator> = if cli.yes {
        Box::new(Unattended)
    } else {
        Box::new(ConsolePrompt)
    };

    match cli.command {
        Commands::Setup => SetupWizard::run(&config).await,
        Commands::Bootstrap(args) => run_bootstrap(&config, args, operator.as_ref()).await,
        Commands::Service { action } => run_service(&config, action).await,
        Commands::Fleet(args) => run_fleet(&config, args).await,
    }
}

/// Logs a failed run; true when it was the operator's choice and the exit
/// status stays 0. Failing commands are printed so they can be re-run by hand.
fn report_failure(e: &anyhow::Error) -> bool {
    let ops = e.chain().find_map(|cause| cause.downcast_ref::<OpsError>());

    if let Some(ops) = ops {
        if ops.is_operator_abort() {
            info!("Stopped at operator's request");
            return true;
        }
        error!("❌ {}", ops);
        if let Some(command) = ops.failed_command() {
            eprintln!("   command: {}", command);
        }
        if let Some(output) = ops.command_output() {
            eprintln!("   output:  {}", output);
        }
    } else {
        error!("❌ {:#}", e);
    }
    false
}

async fn run_bootstrap(config: &AppConfig, args: BootstrapArgs, operator: &dyn Operator) -> Result<()> {
    let options = BootstrapOptions {
        name: args.name,
        create: args.create,
        update: args.update,
        external_ip: args.external_ip,
        external_port: args.external_port,
        txid: args.txid,
        tx_index: args.tx_index,
        passphrase: args.passphrase.or_else(|| std::env::var("PASTEL_ID_PASSPHRASE").ok()),
        activate: args.activate,
        register: args.register,
    };

    let runner = LocalRunner::new(config.command_timeout(), config.elevation.cached_password.clone());
    let connector = SshConnector::new(Duration::from_secs(config.remote.connect_timeout_secs), config.command_timeout());
    let resolver: Box<dyn AddressResolver> = match &options.external_ip {
        Some(ip) => Box::new(StaticAddressResolver(ip.clone())),
        None => Box::new(HttpAddressResolver::new()?),
    };

    let (handle, cancel) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            handle.cancel();
        }
    });

    let report = Bootstrap::new(
        config,
        &options,
        Collaborators {
            runner: &runner,
            connector: &connector,
            resolver: resolver.as_ref(),
            operator,
        },
        cancel,
    )
    .run()
    .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_service(config: &AppConfig, action: ServiceAction) -> Result<()> {
    let capabilities = CapabilityDetector::detect_all().await;
    info!(
        host = %discovery::local_hostname(),
        backend = %capabilities.service_backend,
        "Service manager"
    );

    let network = match Network::read_pastel_conf(&config.pastel_conf_path()).await {
        Ok(network) => network,
        Err(e) => {
            warn!("{}, assuming {}", e, Network::default());
            Network::default()
        }
    };
    let private_key = match &action {
        ServiceAction::Start { private_key, .. } => private_key.clone(),
        _ => None,
    };
    let context = ServiceContext {
        exec_dir: config.paths.pastel_exec_dir.clone(),
        working_dir: config.paths.working_dir.clone(),
        network,
        dev_mode: config.service.dev_mode,
        masternode_key: private_key,
        run_as_user: config
            .service
            .run_as_user
            .clone()
            .unwrap_or_else(discovery::local_user),
        has_python3: capabilities.has_python3,
    };

    let runner = Arc::new(LocalRunner::new(
        config.command_timeout(),
        config.elevation.cached_password.clone(),
    ));
    let (manager, unsupported) = services::new_service_manager(
        capabilities.service_backend,
        ManagerParts {
            runner,
            resolver: Arc::new(HttpAddressResolver::new()?),
            context,
            unit_dir: config.service.unit_dir.clone(),
            staging_dir: std::env::temp_dir().join("pastel-ops"),
        },
    );
    if let Some(e) = unsupported {
        warn!("{}", e);
    }

    let privileged = capabilities.can_elevate;
    for tool in action.tools() {
        match action {
            ServiceAction::Register { .. } => manager.register_service(tool, privileged).await?,
            ServiceAction::Start { .. } => {
                manager.register_service(tool, privileged).await?;
                if manager.start_service(tool).await? {
                    manager.enable_service(tool).await?;
                } else {
                    warn!(tool = %tool, "Service was not started");
                }
            }
            ServiceAction::Stop { .. } => manager.stop_service(tool).await?,
            ServiceAction::Enable { .. } => manager.enable_service(tool).await?,
            ServiceAction::Disable { .. } => manager.disable_service(tool).await?,
            ServiceAction::Status { .. } => {
                let state = manager.service_state(tool).await;
                println!(
                    "{}",
                    serde_json::json!({
                        "service": manager.service_name(tool),
                        "state": state,
                        "host": &capabilities,
                    })
                );
            }
        }
    }
    Ok(())
}

async fn run_fleet(config: &AppConfig, args: FleetArgs) -> Result<()> {
    let inventory = Inventory::load(&args.inventory).await?;
    let options = FleetOptions {
        groups: args.groups,
        parallel: args.parallel,
        commands: args.commands,
    };

    let connector = SshConnector::new(Duration::from_secs(config.remote.connect_timeout_secs), config.command_timeout());
    let executor = FleetExecutor::new(Arc::new(connector), discovery::local_user());
    let reports = executor.run(&inventory, &options).await?;

    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    println!("{}", serde_json::to_string_pretty(&reports)?);
    info!("Fleet run finished: {} host(s), {} with failures", reports.len(), failed);
    Ok(())
}
