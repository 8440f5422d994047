//! Tool types and the table that turns each one into a service descriptor
//!
//! `ToolType::service_profile` is an exhaustive match: a new tool cannot be
//! added without deciding whether (and how) it runs as a service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::daemon::Network;
use crate::errors::OpsError;

pub const SERVICE_PREFIX: &str = "pastel-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ToolType {
    Node,
    Masternode,
    Supernode,
    RqService,
    DdService,
    Hermes,
    Walletnode,
    DdImgServer,
}

impl ToolType {
    pub const ALL: [ToolType; 8] = [
        ToolType::Node,
        ToolType::Masternode,
        ToolType::Supernode,
        ToolType::RqService,
        ToolType::DdService,
        ToolType::Hermes,
        ToolType::Walletnode,
        ToolType::DdImgServer,
    ];

    pub fn id(self) -> &'static str {
        match self {
            ToolType::Node => "node",
            ToolType::Masternode => "masternode",
            ToolType::Supernode => "supernode",
            ToolType::RqService => "rq-service",
            ToolType::DdService => "dd-service",
            ToolType::Hermes => "hermes",
            ToolType::Walletnode => "walletnode",
            ToolType::DdImgServer => "dd-img-server",
        }
    }

    /// How this tool runs under the init system; `None` for tools that are
    /// never run as services
    pub fn service_profile(self) -> Option<ToolProfile> {
        match self {
            ToolType::Node => Some(ToolProfile {
                executable: pasteld_path,
                working_dir: data_dir,
                needs_external_ip: true,
                needs_python3: false,
                arguments: node_args,
            }),
            ToolType::Masternode => Some(ToolProfile {
                executable: pasteld_path,
                working_dir: data_dir,
                needs_external_ip: true,
                needs_python3: false,
                arguments: masternode_args,
            }),
            ToolType::Supernode => Some(ToolProfile {
                executable: |ctx| ctx.exec_dir.join("supernode-linux-amd64"),
                working_dir: |ctx| ctx.working_dir.join("supernode"),
                needs_external_ip: false,
                needs_python3: false,
                arguments: supernode_args,
            }),
            ToolType::RqService => Some(ToolProfile {
                executable: |ctx| ctx.exec_dir.join("rq-service-linux-amd64"),
                working_dir: |ctx| ctx.working_dir.join("rqservice"),
                needs_external_ip: false,
                needs_python3: false,
                arguments: |ctx, exe, _| {
                    Ok(vec![
                        path_arg(exe),
                        config_file_arg(&ctx.working_dir.join("rqservice").join("rqservice.toml")),
                    ])
                },
            }),
            ToolType::DdService => Some(ToolProfile {
                executable: |ctx| ctx.exec_dir.join("dd-service").join("dd_service_server.py"),
                working_dir: |ctx| ctx.working_dir.join("dd-service"),
                needs_external_ip: false,
                needs_python3: true,
                arguments: |_, exe, _| Ok(vec!["/usr/bin/env".to_string(), "python3".to_string(), path_arg(exe)]),
            }),
            ToolType::Hermes => Some(ToolProfile {
                executable: |ctx| ctx.exec_dir.join("hermes-linux-amd64"),
                working_dir: |ctx| ctx.working_dir.join("hermes"),
                needs_external_ip: false,
                needs_python3: false,
                arguments: |ctx, exe, _| {
                    Ok(vec![
                        path_arg(exe),
                        config_file_arg(&ctx.working_dir.join("hermes").join("hermes.yml")),
                    ])
                },
            }),
            ToolType::Walletnode | ToolType::DdImgServer => None,
        }
    }
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Host layout and flags the descriptor functions read from
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub exec_dir: PathBuf,
    pub working_dir: PathBuf,
    pub network: Network,
    pub dev_mode: bool,
    pub masternode_key: Option<String>,
    pub run_as_user: String,
    pub has_python3: bool,
}

type PathFn = fn(&ServiceContext) -> PathBuf;
type ArgsFn = fn(&ServiceContext, &Path, Option<&str>) -> Result<Vec<String>, OpsError>;

/// One row of the tool table
#[derive(Clone, Copy)]
pub struct ToolProfile {
    pub executable: PathFn,
    pub working_dir: PathFn,
    pub needs_external_ip: bool,
    /// Runs under the host's python3
    pub needs_python3: bool,
    /// Full command line; the external IP is `Some` when `needs_external_ip`
    pub arguments: ArgsFn,
}

/// Everything needed to write a unit for one tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub tool: ToolType,
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub command_line: Vec<String>,
    pub unit_name: String,
}

impl ServiceDescriptor {
    pub fn build(
        tool: ToolType,
        profile: &ToolProfile,
        ctx: &ServiceContext,
        external_ip: Option<&str>,
    ) -> Result<Self, OpsError> {
        let executable = (profile.executable)(ctx);
        let command_line = (profile.arguments)(ctx, &executable, external_ip)?;
        Ok(Self {
            tool,
            working_dir: (profile.working_dir)(ctx),
            executable,
            command_line,
            unit_name: unit_name(tool),
        })
    }

    pub fn render_unit(&self, user: &str) -> String {
        format!(
            "[Unit]\n\
             Description=Pastel {tool} service\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             Restart=always\n\
             RestartSec=10\n\
             WorkingDirectory={working_dir}\n\
             ExecStart={exec_start}\n\
             User={user}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            tool = self.tool,
            working_dir = self.working_dir.display(),
            exec_start = shell_words::join(&self.command_line),
            user = user,
        )
    }
}

pub fn unit_name(tool: ToolType) -> String {
    format!("{}{}.service", SERVICE_PREFIX, tool.id())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn config_file_arg(path: &Path) -> String {
    format!("--config-file={}", path.display())
}

fn pasteld_path(ctx: &ServiceContext) -> PathBuf {
    ctx.exec_dir.join("pasteld")
}

fn data_dir(ctx: &ServiceContext) -> PathBuf {
    ctx.working_dir.clone()
}

fn node_args(ctx: &ServiceContext, exe: &Path, external_ip: Option<&str>) -> Result<Vec<String>, OpsError> {
    let external_ip = external_ip
        .ok_or_else(|| OpsError::Precondition("pasteld service needs an external IP".to_string()))?;

    let mut args = vec![
        path_arg(exe),
        format!("-datadir={}", ctx.working_dir.display()),
        format!("-externalip={}", external_ip),
    ];
    if let Some(flag) = ctx.network.flag() {
        args.push(flag.to_string());
    }
    Ok(args)
}

fn masternode_args(ctx: &ServiceContext, exe: &Path, external_ip: Option<&str>) -> Result<Vec<String>, OpsError> {
    let key = ctx
        .masternode_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| OpsError::Precondition("masternode service needs a masternode private key".to_string()))?;

    let mut args = node_args(ctx, exe, external_ip)?;
    args.push("-masternode".to_string());
    args.push("-txindex=1".to_string());
    args.push(format!("-masternodeprivkey={}", key));
    Ok(args)
}

fn supernode_args(ctx: &ServiceContext, exe: &Path, _: Option<&str>) -> Result<Vec<String>, OpsError> {
    let mut args = vec![
        path_arg(exe),
        config_file_arg(&ctx.working_dir.join("supernode").join("supernode.yml")),
    ];
    if ctx.dev_mode {
        args.push("--pprof".to_string());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ServiceContext {
        ServiceContext {
            exec_dir: PathBuf::from("/opt/pastel"),
            working_dir: PathBuf::from("/home/pastel/.pastel"),
            network: Network::Testnet,
            dev_mode: false,
            masternode_key: None,
            run_as_user: "pastel".to_string(),
            has_python3: true,
        }
    }

    #[test]
    fn test_unit_names() {
        assert_eq!(unit_name(ToolType::RqService), "pastel-rq-service.service");
        assert_eq!(unit_name(ToolType::Masternode), "pastel-masternode.service");
        for tool in ToolType::ALL {
            let name = unit_name(tool);
            assert!(name.starts_with(SERVICE_PREFIX) && name.ends_with(".service"));
        }
    }

    #[test]
    fn test_unsupported_tools_have_no_profile() {
        assert!(ToolType::Walletnode.service_profile().is_none());
        assert!(ToolType::DdImgServer.service_profile().is_none());
        assert!(ToolType::Node.service_profile().is_some());
    }

    #[test]
    fn test_masternode_requires_private_key() {
        let profile = ToolType::Masternode.service_profile().unwrap();
        let err = ServiceDescriptor::build(ToolType::Masternode, &profile, &context(), Some("203.0.113.5")).unwrap_err();
        assert!(matches!(err, OpsError::Precondition(_)));

        let ctx = ServiceContext {
            masternode_key: Some("5Kkey".to_string()),
            ..context()
        };
        let descriptor = ServiceDescriptor::build(ToolType::Masternode, &profile, &ctx, Some("203.0.113.5")).unwrap();
        assert_eq!(
            descriptor.command_line,
            vec![
                "/opt/pastel/pasteld",
                "-datadir=/home/pastel/.pastel",
                "-externalip=203.0.113.5",
                "-testnet",
                "-masternode",
                "-txindex=1",
                "-masternodeprivkey=5Kkey",
            ]
        );
    }

    #[test]
    fn test_supernode_dev_mode_adds_pprof() {
        let profile = ToolType::Supernode.service_profile().unwrap();
        let plain = ServiceDescriptor::build(ToolType::Supernode, &profile, &context(), None).unwrap();
        assert!(!plain.command_line.contains(&"--pprof".to_string()));

        let dev = ServiceContext {
            dev_mode: true,
            ..context()
        };
        let dev = ServiceDescriptor::build(ToolType::Supernode, &profile, &dev, None).unwrap();
        assert_eq!(dev.command_line.last().map(String::as_str), Some("--pprof"));
        assert_eq!(dev.working_dir, PathBuf::from("/home/pastel/.pastel/supernode"));
    }

    #[test]
    fn test_render_unit() {
        let profile = ToolType::RqService.service_profile().unwrap();
        let descriptor = ServiceDescriptor::build(ToolType::RqService, &profile, &context(), None).unwrap();
        let unit = descriptor.render_unit("pastel");

        assert!(unit.contains("Description=Pastel rq-service service\n"));
        assert!(unit.contains("WorkingDirectory=/home/pastel/.pastel/rqservice\n"));
        let exec_start = unit
            .lines()
            .find_map(|line| line.strip_prefix("ExecStart="))
            .unwrap();
        assert_eq!(
            shell_words::split(exec_start).unwrap(),
            vec![
                "/opt/pastel/rq-service-linux-amd64",
                "--config-file=/home/pastel/.pastel/rqservice/rqservice.toml",
            ]
        );
        assert!(unit.contains("User=pastel\n"));
        assert!(unit.ends_with("WantedBy=multi-user.target\n"));
    }
}
