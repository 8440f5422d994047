//! `pasteld` / `pastel-cli` invocations and the output shapes pastel-ops
//! understands
//!
//! Everything else the daemon prints is treated as opaque text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::config::{PathsConfig, RemoteConfig};
use crate::errors::OpsError;
use crate::execution::Invocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    /// Network selected by a `pastel.conf` body (`testnet=1`)
    pub fn from_pastel_conf(content: &str) -> Self {
        let testnet = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .any(|(key, value)| key.trim() == "testnet" && value.trim() == "1");
        if testnet {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }

    pub async fn read_pastel_conf(path: &Path) -> Result<Self, OpsError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Self::from_pastel_conf(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OpsError::NotFound(format!("node configuration {}", path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn flag(self) -> Option<&'static str> {
        match self {
            Network::Mainnet => None,
            Network::Testnet => Some("-testnet"),
        }
    }

    pub fn masternode_port(self) -> u16 {
        match self {
            Network::Mainnet => 9933,
            Network::Testnet => 19933,
        }
    }

    pub fn supernode_port(self) -> u16 {
        match self {
            Network::Mainnet => 4444,
            Network::Testnet => 14444,
        }
    }

    pub fn supernode_p2p_port(self) -> u16 {
        match self {
            Network::Mainnet => 4445,
            Network::Testnet => 14445,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// How `pasteld` is started
#[derive(Debug, Clone, Copy)]
pub enum LaunchMode<'a> {
    Plain,
    Masternode { private_key: &'a str },
}

/// Paths and flags for one node installation, local or remote
#[derive(Debug, Clone)]
pub struct NodeTools {
    pasteld: String,
    pastel_cli: String,
    datadir: Option<String>,
    network: Network,
}

impl NodeTools {
    pub fn local(paths: &PathsConfig, network: Network) -> Self {
        Self {
            pasteld: paths.pastel_exec_dir.join("pasteld").to_string_lossy().to_string(),
            pastel_cli: paths.pastel_exec_dir.join("pastel-cli").to_string_lossy().to_string(),
            datadir: Some(paths.working_dir.to_string_lossy().to_string()),
            network,
        }
    }

    /// Hot node tools; fails when the remote installation directory is not configured
    pub fn remote(remote: &RemoteConfig, network: Network) -> Result<Self, OpsError> {
        let dir = remote
            .pastel_dir
            .as_deref()
            .map(|d| d.trim_end_matches('/'))
            .filter(|d| !d.is_empty())
            .ok_or_else(|| OpsError::NotFound("remote pastel installation directory (remote.pastel_dir)".to_string()))?;

        Ok(Self {
            pasteld: format!("{}/pasteld", dir),
            pastel_cli: format!("{}/pastel-cli", dir),
            datadir: remote.working_dir.clone().filter(|d| !d.is_empty()),
            network,
        })
    }

    /// Same installation, other network
    pub fn on_network(self, network: Network) -> Self {
        Self { network, ..self }
    }

    pub fn pasteld_path(&self) -> &str {
        &self.pasteld
    }

    fn cli<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all: Vec<String> = self.datadir.iter().map(|d| format!("-datadir={}", d)).collect();
        all.extend(args.into_iter().map(Into::into));
        Invocation::new(self.pastel_cli.clone(), all)
    }

    pub fn get_info(&self) -> Invocation {
        self.cli(["getinfo"])
    }

    pub fn get_balance(&self) -> Invocation {
        self.cli(["getbalance"])
    }

    pub fn get_new_address(&self) -> Invocation {
        self.cli(["getnewaddress"])
    }

    pub fn send_to_address(&self, address: &str, amount: f64) -> Invocation {
        self.cli(["sendtoaddress".to_string(), address.to_string(), amount.to_string()])
    }

    pub fn mnsync_status(&self) -> Invocation {
        self.cli(["mnsync", "status"])
    }

    pub fn start_alias(&self, name: &str) -> Invocation {
        self.cli(["masternode", "start-alias", name])
    }

    pub fn stop(&self) -> Invocation {
        self.cli(["stop"])
    }

    /// Exits non-zero once no `pasteld` process is left on the host
    pub fn process_check(&self) -> Invocation {
        let name = self.pasteld.rsplit('/').next().unwrap_or("pasteld");
        Invocation::new("pgrep", ["-x", name])
    }

    pub fn masternode_genkey(&self) -> Invocation {
        self.cli(["masternode", "genkey"])
    }

    pub fn masternode_outputs(&self) -> Invocation {
        self.cli(["masternode", "outputs"])
    }

    pub fn pastelid_newkey(&self, passphrase: &str) -> Invocation {
        self.cli(["pastelid", "newkey", passphrase])
    }

    pub fn register_mnid(&self, pastel_id: &str, passphrase: &str) -> Invocation {
        self.cli(["tickets", "register", "mnid", pastel_id, passphrase])
    }

    /// `pasteld` started as a self-detaching daemon
    pub fn launch(&self, mode: LaunchMode<'_>, external_ip: Option<&str>) -> Invocation {
        let mut args: Vec<String> = self.datadir.iter().map(|d| format!("-datadir={}", d)).collect();
        if let Some(ip) = external_ip {
            args.push(format!("-externalip={}", ip));
        }
        if let LaunchMode::Masternode { private_key } = mode {
            args.push("-masternode".to_string());
            args.push("-txindex=1".to_string());
            args.push(format!("-masternodeprivkey={}", private_key));
        }
        if let Some(flag) = self.network.flag() {
            args.push(flag.to_string());
        }
        args.push("-daemon".to_string());
        Invocation::new(self.pasteld.clone(), args)
    }
}

pub fn parse_balance(command: &str, output: &str) -> Result<f64, OpsError> {
    output.trim().parse::<f64>().map_err(|e| OpsError::Parse {
        command: command.to_string(),
        detail: format!("balance {:?} is not a number: {}", output.trim(), e),
    })
}

/// `getinfo` answered with a JSON object
pub fn is_live(output: &str) -> bool {
    serde_json::from_str::<Value>(output)
        .map(|v| v.is_object())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MnSyncStatus {
    #[serde(rename = "IsBlockchainSynced", default)]
    pub blockchain_synced: bool,
    #[serde(rename = "IsMasternodeListSynced", default)]
    pub masternode_list_synced: bool,
    #[serde(rename = "IsWinnersListSynced", default)]
    pub winners_list_synced: bool,
}

impl MnSyncStatus {
    pub fn parse(output: &str) -> Option<Self> {
        serde_json::from_str(output).ok()
    }

    pub fn is_synced(&self) -> bool {
        self.blockchain_synced && self.masternode_list_synced && self.winners_list_synced
    }
}

pub fn parse_pastel_id(command: &str, output: &str) -> Result<String, OpsError> {
    let parse_error = |detail: String| OpsError::Parse {
        command: command.to_string(),
        detail,
    };
    let value: Value = serde_json::from_str(output).map_err(|e| parse_error(e.to_string()))?;
    value
        .get("pastelid")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| parse_error("missing `pastelid` field".to_string()))
}

/// `masternode outputs`: txid -> output index (index printed as string or number)
pub fn parse_outputs(command: &str, output: &str) -> Result<BTreeMap<String, String>, OpsError> {
    let value: Value = serde_json::from_str(output).map_err(|e| OpsError::Parse {
        command: command.to_string(),
        detail: e.to_string(),
    })?;
    let object = value.as_object().ok_or_else(|| OpsError::Parse {
        command: command.to_string(),
        detail: "expected a JSON object".to_string(),
    })?;

    Ok(object
        .iter()
        .map(|(txid, index)| {
            let index = match index {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (txid.clone(), index)
        })
        .collect())
}
