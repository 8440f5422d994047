//! `masternode.conf` entries
//!
//! The file is a JSON object keyed by masternode name. Fields pastel-ops does
//! not know about are kept as-is on rewrite.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::daemon::Network;
use crate::errors::OpsError;

/// One masternode identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasternodeConfigEntry {
    pub name: String,
    pub private_key: String,
    pub external_ip: String,
    pub external_port: u16,
    pub txid: String,
    pub tx_index: u32,
    pub pastel_id: String,
    /// Wallet passphrase for the PastelID; never written to disk
    pub passphrase: Option<String>,
}

impl MasternodeConfigEntry {
    /// Key and collateral both present: the entry can start a masternode
    pub fn ensure_launchable(&self) -> Result<(), OpsError> {
        if self.private_key.is_empty() {
            return Err(OpsError::Precondition(format!(
                "masternode `{}` has no private key",
                self.name
            )));
        }
        if self.txid.is_empty() {
            return Err(OpsError::Precondition(format!(
                "masternode `{}` has no collateral transaction",
                self.name
            )));
        }
        Ok(())
    }
}

/// What the operator asked for on a create/update run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRequest {
    pub name: String,
    pub external_ip: String,
    pub external_port: u16,
    pub txid: String,
    pub tx_index: u32,
    pub passphrase: Option<String>,
}

impl EntryRequest {
    /// Requested entry, reusing key and PastelID from `existing` so a
    /// repeated run converges instead of minting new identities
    pub fn merge(&self, existing: Option<&MasternodeConfigEntry>) -> MasternodeConfigEntry {
        MasternodeConfigEntry {
            name: self.name.clone(),
            private_key: existing.map(|e| e.private_key.clone()).unwrap_or_default(),
            external_ip: self.external_ip.clone(),
            external_port: self.external_port,
            txid: self.txid.clone(),
            tx_index: self.tx_index,
            pastel_id: existing.map(|e| e.pastel_id.clone()).unwrap_or_default(),
            passphrase: self.passphrase.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MasternodeRecord {
    #[serde(rename = "mnAddress", default)]
    mn_address: String,
    #[serde(rename = "mnPrivKey", default)]
    mn_priv_key: String,
    #[serde(default)]
    txid: String,
    #[serde(rename = "outIndex", default)]
    out_index: String,
    #[serde(rename = "extAddress", default)]
    ext_address: String,
    #[serde(rename = "extP2P", default)]
    ext_p2p: String,
    #[serde(rename = "extKey", default)]
    ext_key: String,
    #[serde(rename = "extCfg", default)]
    ext_cfg: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

pub struct MasternodeConf {
    path: PathBuf,
    records: BTreeMap<String, MasternodeRecord>,
}

impl MasternodeConf {
    /// Missing file reads as empty
    pub async fn load(path: &Path) -> Result<Self, OpsError> {
        let records = match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<MasternodeConfigEntry>, OpsError> {
        let Some(record) = self.records.get(name) else {
            return Ok(None);
        };

        let parse_error = |detail: String| OpsError::Parse {
            command: format!("read {}", self.path.display()),
            detail,
        };
        let (ip, port) = record
            .mn_address
            .rsplit_once(':')
            .ok_or_else(|| parse_error(format!("mnAddress {:?} of `{}` is not ip:port", record.mn_address, name)))?;
        let port = port
            .parse()
            .map_err(|_| parse_error(format!("mnAddress {:?} of `{}` has a bad port", record.mn_address, name)))?;
        let tx_index = if record.out_index.is_empty() {
            0
        } else {
            record
                .out_index
                .parse()
                .map_err(|_| parse_error(format!("outIndex {:?} of `{}` is not a number", record.out_index, name)))?
        };

        Ok(Some(MasternodeConfigEntry {
            name: name.to_string(),
            private_key: record.mn_priv_key.clone(),
            external_ip: ip.to_string(),
            external_port: port,
            txid: record.txid.clone(),
            tx_index,
            pastel_id: record.ext_key.clone(),
            passphrase: None,
        }))
    }

    pub fn upsert(&mut self, entry: &MasternodeConfigEntry, network: Network) {
        let record = self.records.entry(entry.name.clone()).or_default();
        record.mn_address = format!("{}:{}", entry.external_ip, entry.external_port);
        record.mn_priv_key = entry.private_key.clone();
        record.txid = entry.txid.clone();
        record.out_index = entry.tx_index.to_string();
        record.ext_address = format!("{}:{}", entry.external_ip, network.supernode_port());
        record.ext_p2p = format!("{}:{}", entry.external_ip, network.supernode_p2p_port());
        record.ext_key = entry.pastel_id.clone();
    }

    pub async fn save(&self) -> Result<(), OpsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&self.records)?;
        tokio::fs::write(&self.path, content).await?;
        info!("Saved {}", self.path.display());
        Ok(())
    }
}
