//! The registry's data model and the blocking-query client interface the
//! watcher consumes.
//!
//! Field names follow the registry's JSON encoding so that any transport can
//! decode responses directly into these types.

use crate::health::HealthStatus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// A free-form configuration block attached to a proxy or upstream.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Models the registry operations used by the watcher.
///
/// Blocking queries take the last-seen index (or content hash) in
/// [`QueryOptions`] and return once the value changes or `wait_time` elapses,
/// along with the new index/hash in [`QueryMeta`]. An unchanged index in the
/// response means the wait timed out.
#[async_trait::async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Resolves the ID of the sidecar proxy registered for `service_id`.
    async fn sidecar_proxy_id(&self, service_id: &str) -> Result<String>;

    /// Fetches a local agent service registration, blocking on `wait_hash`.
    async fn service(
        &self,
        service_id: &str,
        opts: &QueryOptions,
    ) -> Result<(AgentService, QueryMeta)>;

    /// Lists mesh-capable instances of `service`, blocking on `wait_index`.
    async fn healthy_instances(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<ServiceEntry>, QueryMeta)>;

    /// Executes a prepared query. Never blocks.
    async fn execute_prepared_query(
        &self,
        name: &str,
        opts: &QueryOptions,
    ) -> Result<Vec<ServiceEntry>>;

    /// Fetches the mesh's trust roots, blocking on `wait_index`.
    async fn ca_roots(&self, opts: &QueryOptions) -> Result<(CaRootList, QueryMeta)>;

    /// Fetches the leaf certificate for `service`, blocking on `wait_index`.
    async fn leaf_cert(&self, service: &str, opts: &QueryOptions) -> Result<(LeafCert, QueryMeta)>;
}

/// Errors a registry implementation may report.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub datacenter: Option<String>,
    pub wait_index: u64,
    pub wait_hash: Option<String>,
    pub wait_time: Option<Duration>,
    pub connect: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryMeta {
    pub last_index: u64,
    pub last_content_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Weights {
    pub passing: u32,
    pub warning: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub destination_service_name: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub upstreams: Vec<UpstreamDefinition>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    PreparedQuery,
    /// Also used when the registration leaves the type unset or names one this watcher doesn't
    /// know.
    #[default]
    #[serde(other)]
    Service,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpstreamDefinition {
    #[serde(default)]
    pub destination_type: DestinationType,
    pub destination_name: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub local_bind_address: String,
    #[serde(default)]
    pub local_bind_port: u16,
    #[serde(default)]
    pub config: ConfigMap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    pub node: Node,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(default)]
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(default)]
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, rename = "ServiceID")]
    pub service_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRootList {
    #[serde(rename = "ActiveRootID")]
    pub active_root_id: String,
    #[serde(default)]
    pub roots: Vec<CaRoot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRoot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "RootCertPEM")]
    pub root_cert_pem: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LeafCert {
    pub service: String,
    pub serial_number: String,
    #[serde(rename = "CertPEM")]
    pub cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    pub private_key_pem: String,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
}

// === impl Weights ===

/// The registry assigns these weights to services registered without any.
impl Default for Weights {
    fn default() -> Self {
        Self {
            passing: 1,
            warning: 1,
        }
    }
}

// === impl DestinationType ===

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::PreparedQuery => "prepared_query",
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ProxyConfig ===

impl ProxyConfig {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        config_str(&self.config, key)
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(serde_json::Value::as_bool)
    }
}

// === impl UpstreamDefinition ===

impl UpstreamDefinition {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        config_str(&self.config, key)
    }

    /// The datacenter to query, if the upstream names one.
    pub fn datacenter(&self) -> Option<&str> {
        Some(self.datacenter.as_str()).filter(|dc| !dc.is_empty())
    }
}

fn config_str<'c>(config: &'c ConfigMap, key: &str) -> Option<&'c str> {
    config.get(key).and_then(serde_json::Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_sidecar_registration() {
        let svc: AgentService = serde_json::from_str(
            r#"{
                "ID": "web-1-sidecar-proxy",
                "Service": "web-sidecar-proxy",
                "Port": 21000,
                "Proxy": {
                    "DestinationServiceName": "web",
                    "Config": {"protocol": "http", "enable_forwardfor": true},
                    "Upstreams": [
                        {"DestinationName": "db", "LocalBindPort": 9191},
                        {
                            "DestinationType": "prepared_query",
                            "DestinationName": "geo-cache",
                            "Datacenter": "dc2",
                            "LocalBindAddress": "127.0.0.2",
                            "LocalBindPort": 9192,
                            "Config": {"poll_interval": "1s"}
                        }
                    ]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(svc.port, 21000);
        assert_eq!(svc.weights, Weights::default());
        let proxy = svc.proxy.unwrap();
        assert_eq!(proxy.config_str("protocol"), Some("http"));
        assert_eq!(proxy.config_bool("enable_forwardfor"), Some(true));
        assert_eq!(proxy.config_bool("protocol"), None);
        assert_eq!(proxy.config_str("bind_address"), None);

        let [db, cache] = &proxy.upstreams[..] else {
            panic!("expected two upstreams");
        };
        assert_eq!(db.destination_type, DestinationType::Service);
        assert_eq!(db.datacenter(), None);
        assert_eq!(cache.destination_type, DestinationType::PreparedQuery);
        assert_eq!(cache.datacenter(), Some("dc2"));
        assert_eq!(cache.config_str("poll_interval"), Some("1s"));
    }

    #[test]
    fn unset_or_unknown_destination_type_is_a_service() {
        let up: UpstreamDefinition =
            serde_json::from_str(r#"{"DestinationType": "", "DestinationName": "db"}"#).unwrap();
        assert_eq!(up.destination_type, DestinationType::Service);
        assert_eq!(up.destination_type.to_string(), "service");

        let up: UpstreamDefinition =
            serde_json::from_str(r#"{"DestinationType": "mesh-gateway", "DestinationName": "gw"}"#)
                .unwrap();
        assert_eq!(up.destination_type, DestinationType::Service);

        let up: UpstreamDefinition = serde_json::from_str(r#"{"DestinationName": "db"}"#).unwrap();
        assert_eq!(up.destination_type, DestinationType::Service);

        let up: UpstreamDefinition =
            serde_json::from_str(r#"{"DestinationType": "prepared_query", "DestinationName": "q"}"#)
                .unwrap();
        assert_eq!(up.destination_type, DestinationType::PreparedQuery);
    }

    #[test]
    fn decodes_leaf_cert() {
        let leaf: LeafCert = serde_json::from_str(
            r#"{
                "Service": "web",
                "SerialNumber": "0a:0b",
                "CertPEM": "cert",
                "PrivateKeyPEM": "key",
                "ValidAfter": "2024-01-01T00:00:00Z",
                "ValidBefore": "2024-01-04T00:00:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(leaf.serial_number, "0a:0b");
        assert!(leaf.valid_after < leaf.valid_before);
    }
}
