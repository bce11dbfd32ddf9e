//! The configuration snapshot handed to the proxy configuration writer.
//!
//! A [`Config`] is a value: the watcher never mutates one after publishing it,
//! and every change in the registry produces a new one.

use crate::identity::{LeafIdentity, TrustRoots};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub service_name: String,
    pub service_id: String,
    pub trust_roots: Arc<TrustRoots>,
    pub downstream: Downstream,
    /// Ordered by upstream name.
    pub upstreams: Vec<Upstream>,
}

/// The inbound listener the sidecar exposes for the local application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Downstream {
    pub local_bind_address: String,
    pub local_bind_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub protocol: Option<String>,
    pub enable_forward_for: bool,
    pub app_name_header: Option<String>,
    pub tls: Tls,
}

/// An outbound listener forwarding to the live instances of one upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    /// `<destination type>_<destination name>`.
    pub name: String,
    pub local_bind_address: String,
    pub local_bind_port: u16,
    pub datacenter: Option<String>,
    pub protocol: Option<String>,
    /// Ordered by node name.
    pub nodes: Vec<UpstreamNode>,
    pub tls: Tls,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpstreamNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Always non-zero.
    pub weight: u32,
}

/// TLS material shared by every listener of the sidecar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tls {
    pub trust_roots: Arc<TrustRoots>,
    pub leaf: Arc<LeafIdentity>,
}
