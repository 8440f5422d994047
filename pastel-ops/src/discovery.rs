//! Host discovery for pastel-ops
//!
//! This module handles:
//! - Externally-visible IP address lookup (needed by daemon command lines)
//! - Local identity (hostname, login user) for unit files and log context

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::OpsError;

/// Lookup services tried in order
const EXTERNAL_IP_SOURCES: &[&str] = &["https://ipinfo.io/ip", "https://api.ipify.org"];

/// Source of this host's externally-visible address
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn external_ip(&self) -> Result<String, OpsError>;
}

/// Resolver asking public "what is my IP" endpoints over HTTPS
pub struct HttpAddressResolver {
    client: reqwest::Client,
}

impl HttpAddressResolver {
    pub fn new() -> Result<Self, OpsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OpsError::Connection {
                endpoint: "external IP lookup".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AddressResolver for HttpAddressResolver {
    async fn external_ip(&self) -> Result<String, OpsError> {
        let mut last_error = String::from("no lookup source configured");

        for source in EXTERNAL_IP_SOURCES {
            debug!("Resolving external IP via {}", source);
            let body = match self.client.get(*source).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => resp.text().await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(e.to_string()),
            };

            match body.and_then(|text| parse_ip(&text).ok_or_else(|| format!("not an IP address: {:?}", text))) {
                Ok(ip) => {
                    info!("External IP resolved: {}", ip);
                    return Ok(ip);
                }
                Err(e) => last_error = format!("{}: {}", source, e),
            }
        }

        Err(OpsError::NotFound(format!("external IP address ({})", last_error)))
    }
}

/// Resolver returning a fixed address (`--external-ip`)
pub struct StaticAddressResolver(pub String);

#[async_trait]
impl AddressResolver for StaticAddressResolver {
    async fn external_ip(&self) -> Result<String, OpsError> {
        Ok(self.0.clone())
    }
}

fn parse_ip(text: &str) -> Option<String> {
    text.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Login name used for `User=` when none is configured
pub fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip("203.0.113.9\n"), Some("203.0.113.9".to_string()));
        assert_eq!(parse_ip("2001:db8::1"), Some("2001:db8::1".to_string()));
        assert_eq!(parse_ip("<html>rate limited</html>"), None);
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticAddressResolver("198.51.100.4".to_string());
        assert_eq!(resolver.external_ip().await.unwrap(), "198.51.100.4");
    }

    #[test]
    fn test_local_identity_is_not_empty() {
        assert!(!local_hostname().is_empty());
        assert!(!local_user().is_empty());
    }
}
