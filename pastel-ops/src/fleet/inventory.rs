//! Host inventories
//!
//! Two YAML shapes are accepted and normalised into [`InventoryGroup`]s:
//!
//! ```yaml
//! groups:
//!   - name: hot
//!     common: { user: pastel, identity_file: ~/.ssh/id_ed25519 }
//!     hosts:
//!       - { name: mn1, address: 203.0.113.5 }
//! ```
//!
//! and Ansible style, either under `all: children:` or as top-level groups,
//! with `ansible_host`, `ansible_port`, `ansible_user`,
//! `ansible_ssh_private_key_file` and `ansible_password` variables.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::OpsError;
use crate::session::{Credential, NodeEndpoint, DEFAULT_SSH_PORT};

/// Connection fields shared by a group or set on a single host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
}

impl ConnectionParams {
    /// Field-by-field overlay: a non-empty field of `self` wins over `base`
    pub fn over(&self, base: &ConnectionParams) -> ConnectionParams {
        fn pick<T: Clone>(own: &Option<T>, base: &Option<T>, empty: impl Fn(&T) -> bool) -> Option<T> {
            own.clone().filter(|v| !empty(v)).or_else(|| base.clone())
        }

        ConnectionParams {
            user: pick(&self.user, &base.user, |u: &String| u.is_empty()),
            port: pick(&self.port, &base.port, |p: &u16| *p == 0),
            identity_file: pick(&self.identity_file, &base.identity_file, |p: &PathBuf| {
                p.as_os_str().is_empty()
            }),
            password: pick(&self.password, &base.password, |p: &String| p.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,
    /// Defaults to `name`
    #[serde(default)]
    pub address: Option<String>,
    #[serde(flatten)]
    pub params: ConnectionParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryGroup {
    pub name: String,
    #[serde(default)]
    pub common: ConnectionParams,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

impl InventoryGroup {
    /// Effective endpoint for one host of this group
    pub fn endpoint(&self, host: &HostEntry, default_user: &str) -> NodeEndpoint {
        let params = host.params.over(&self.common);
        // The credential is chosen as a whole: any host-level secret beats the group's
        let credential = credential_of(&host.params)
            .or_else(|| credential_of(&self.common))
            .unwrap_or(Credential::Agent);

        NodeEndpoint {
            host: host
                .address
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| host.name.clone()),
            port: params.port.unwrap_or(DEFAULT_SSH_PORT),
            user: params.user.unwrap_or_else(|| default_user.to_string()),
            credential,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub groups: Vec<InventoryGroup>,
}

impl Inventory {
    pub async fn load(path: &Path) -> Result<Self, OpsError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OpsError::NotFound(format!("inventory {}", path.display())))
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, OpsError> {
        let value: Value = serde_yaml::from_str(content)?;
        let Value::Mapping(root) = value else {
            return Err(OpsError::Parse {
                command: "read inventory".to_string(),
                detail: "expected a YAML mapping at the top level".to_string(),
            });
        };

        if root.contains_key("groups") {
            debug!("Native inventory format");
            return Ok(serde_yaml::from_value(Value::Mapping(root))?);
        }

        debug!("Ansible inventory format");
        let mut groups = Vec::new();
        for (key, body) in &root {
            let name = yaml_str(key).unwrap_or_default();
            if name == "all" {
                let all_vars = ansible_params(body.get("vars"));
                if let Some(Value::Mapping(children)) = body.get("children") {
                    for (child, child_body) in children {
                        let mut group = ansible_group(yaml_str(child).unwrap_or_default(), child_body);
                        group.common = group.common.over(&all_vars);
                        groups.push(group);
                    }
                }
                if body.get("hosts").is_some() {
                    groups.push(ansible_group(name, body));
                }
            } else {
                groups.push(ansible_group(name, body));
            }
        }

        Ok(Self { groups })
    }

    /// Groups named in `filter`, or every group when it is empty. Unknown
    /// names are an error so a typo never silently runs against nothing.
    pub fn select(&self, filter: &[String]) -> Result<Vec<&InventoryGroup>, OpsError> {
        if filter.is_empty() {
            return Ok(self.groups.iter().collect());
        }
        if let Some(missing) = filter.iter().find(|f| !self.groups.iter().any(|g| &g.name == *f)) {
            return Err(OpsError::NotFound(format!("inventory group `{}`", missing)));
        }
        Ok(self.groups.iter().filter(|g| filter.contains(&g.name)).collect())
    }
}

fn credential_of(params: &ConnectionParams) -> Option<Credential> {
    if let Some(path) = params.identity_file.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        return Some(Credential::KeyFile(path.clone()));
    }
    params
        .password
        .as_ref()
        .filter(|p| !p.is_empty())
        .map(|p| Credential::Password(p.clone()))
}

fn yaml_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn ansible_params(vars: Option<&Value>) -> ConnectionParams {
    let Some(Value::Mapping(vars)) = vars else {
        return ConnectionParams::default();
    };
    let get = |key: &str| vars.get(key).and_then(yaml_str).filter(|s| !s.is_empty());

    ConnectionParams {
        user: get("ansible_user"),
        port: get("ansible_port").and_then(|p| p.parse().ok()),
        identity_file: get("ansible_ssh_private_key_file").map(PathBuf::from),
        password: get("ansible_password"),
    }
}

fn ansible_group(name: String, body: &Value) -> InventoryGroup {
    let empty = Mapping::new();
    let hosts = match body.get("hosts") {
        Some(Value::Mapping(hosts)) => hosts,
        _ => &empty,
    };

    InventoryGroup {
        name,
        common: ansible_params(body.get("vars")),
        hosts: hosts
            .iter()
            .filter_map(|(host, vars)| {
                let name = yaml_str(host)?;
                let address = match vars {
                    Value::Mapping(m) => m.get("ansible_host").and_then(yaml_str),
                    _ => None,
                };
                Some(HostEntry {
                    name,
                    address,
                    params: ansible_params(Some(vars)),
                })
            })
            .collect(),
    }
}
