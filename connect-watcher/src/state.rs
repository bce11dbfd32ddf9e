use crate::upstream::UpstreamKey;
use ahash::AHashMap as HashMap;
use connect_watcher_core::{
    aggregated_status,
    registry::{AgentService, ServiceEntry, UpstreamDefinition},
    Config, Downstream, HealthStatus, LeafIdentity, Tls, TrustRoots, Upstream, UpstreamNode,
    DEFAULT_DOWNSTREAM_BIND_ADDR, DEFAULT_TARGET_ADDR,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) type SharedState = Arc<Mutex<State>>;

/// All mutable watch state. Every read and write happens under the one lock.
#[derive(Debug)]
pub(crate) struct State {
    service_name: String,
    service_id: String,
    trust_roots: Option<Arc<TrustRoots>>,
    leaf: Option<Arc<LeafIdentity>>,
    downstream: DownstreamState,
    upstreams: HashMap<UpstreamKey, UpstreamState>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct DownstreamState {
    local_bind_address: String,
    local_bind_port: u16,
    target_address: String,
    target_port: u16,
    protocol: Option<String>,
    enable_forward_for: bool,
    app_name_header: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct UpstreamState {
    local_bind_address: String,
    local_bind_port: u16,
    datacenter: Option<String>,
    protocol: Option<String>,
    /// The raw discovery result. Health filtering happens at synthesis.
    entries: Vec<ServiceEntry>,
}

/// Instance counts for a synthesized configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub(crate) alive: usize,
    pub(crate) total: usize,
    /// In the same order as the configuration's upstreams.
    pub(crate) by_upstream: Vec<EndpointCounts>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct EndpointCounts {
    pub(crate) alive: usize,
    pub(crate) total: usize,
}

// === impl State ===

impl State {
    pub(crate) fn shared(service_name: String, service_id: String) -> SharedState {
        Arc::new(Mutex::new(Self {
            service_name,
            service_id,
            trust_roots: None,
            leaf: None,
            downstream: DownstreamState::default(),
            upstreams: HashMap::default(),
        }))
    }

    pub(crate) fn set_trust_roots(&mut self, roots: TrustRoots) {
        self.trust_roots = Some(Arc::new(roots));
    }

    pub(crate) fn set_leaf(&mut self, leaf: LeafIdentity) {
        self.leaf = Some(Arc::new(leaf));
    }

    pub(crate) fn set_target_port(&mut self, port: u16) {
        self.downstream.target_port = port;
    }

    /// Updates the inbound listener from the sidecar's registration.
    ///
    /// The bind and target addresses revert to their defaults unless the proxy configuration sets
    /// them. The protocol, forwarding flag, and header name keep their prior values when the
    /// configuration omits them. Unknown keys, and keys with the wrong type, are ignored.
    pub(crate) fn apply_sidecar(&mut self, sidecar: &AgentService) {
        let ds = &mut self.downstream;
        ds.local_bind_address = DEFAULT_DOWNSTREAM_BIND_ADDR.to_string();
        ds.local_bind_port = sidecar.port;
        ds.target_address = DEFAULT_TARGET_ADDR.to_string();

        let Some(proxy) = sidecar.proxy.as_ref() else {
            return;
        };
        if let Some(protocol) = proxy.config_str("protocol") {
            ds.protocol = Some(protocol.to_string());
        }
        if let Some(addr) = proxy.config_str("bind_address") {
            ds.local_bind_address = addr.to_string();
        }
        if let Some(addr) = proxy.config_str("local_service_address") {
            ds.target_address = addr.to_string();
        }
        if let Some(enabled) = proxy.config_bool("enable_forwardfor") {
            ds.enable_forward_for = enabled;
        }
        if let Some(header) = proxy.config_str("appname_header") {
            ds.app_name_header = Some(header.to_string());
        }
    }

    pub(crate) fn insert_upstream(&mut self, key: UpstreamKey, upstream: UpstreamState) {
        self.upstreams.insert(key, upstream);
    }

    pub(crate) fn remove_upstream(&mut self, key: &UpstreamKey) {
        self.upstreams.remove(key);
    }

    /// Replaces an upstream's instances. Returns false if the upstream is no longer tracked.
    pub(crate) fn set_upstream_entries(
        &mut self,
        key: &UpstreamKey,
        entries: Vec<ServiceEntry>,
    ) -> bool {
        match self.upstreams.get_mut(key) {
            Some(upstream) => {
                upstream.entries = entries;
                true
            }
            None => false,
        }
    }

    /// Synthesizes a configuration from the current state.
    ///
    /// Returns `None` until both the trust roots and the leaf certificate are known.
    pub(crate) fn snapshot(&self) -> Option<(Config, Endpoints)> {
        let tls = Tls {
            trust_roots: self.trust_roots.clone()?,
            leaf: self.leaf.clone()?,
        };

        let mut upstreams = self.upstreams.iter().collect::<Vec<_>>();
        upstreams.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut endpoints = Endpoints::default();
        let upstreams = upstreams
            .into_iter()
            .map(|(key, up)| {
                let nodes = live_nodes(&up.entries);
                let counts = EndpointCounts {
                    alive: nodes.len(),
                    total: up.entries.len(),
                };
                endpoints.alive += counts.alive;
                endpoints.total += counts.total;
                endpoints.by_upstream.push(counts);

                Upstream {
                    name: key.to_string(),
                    local_bind_address: up.local_bind_address.clone(),
                    local_bind_port: up.local_bind_port,
                    datacenter: up.datacenter.clone(),
                    protocol: up.protocol.clone(),
                    nodes,
                    tls: tls.clone(),
                }
            })
            .collect();

        let ds = &self.downstream;
        let config = Config {
            service_name: self.service_name.clone(),
            service_id: self.service_id.clone(),
            trust_roots: tls.trust_roots.clone(),
            downstream: Downstream {
                local_bind_address: ds.local_bind_address.clone(),
                local_bind_port: ds.local_bind_port,
                target_address: ds.target_address.clone(),
                target_port: ds.target_port,
                protocol: ds.protocol.clone(),
                enable_forward_for: ds.enable_forward_for,
                app_name_header: ds.app_name_header.clone(),
                tls,
            },
            upstreams,
        };
        Some((config, endpoints))
    }
}

/// Derives the routable nodes of an upstream from its raw instances.
///
/// Passing instances take their passing weight and warning instances their warning weight; any
/// other status excludes the instance, as does a weight of zero. Nodes are ordered by name.
pub(crate) fn live_nodes(entries: &[ServiceEntry]) -> Vec<UpstreamNode> {
    let mut nodes = entries
        .iter()
        .filter_map(|entry| {
            let weight = match aggregated_status(&entry.checks) {
                HealthStatus::Passing => entry.service.weights.passing,
                HealthStatus::Warning => entry.service.weights.warning,
                _ => return None,
            };
            if weight == 0 {
                return None;
            }

            let address = if entry.service.address.is_empty() {
                entry.node.address.clone()
            } else {
                entry.service.address.clone()
            };
            Some(UpstreamNode {
                name: entry.node.node.clone(),
                address,
                port: entry.service.port,
                weight,
            })
        })
        .collect::<Vec<_>>();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes
}

// === impl DownstreamState ===

impl Default for DownstreamState {
    fn default() -> Self {
        Self {
            local_bind_address: DEFAULT_DOWNSTREAM_BIND_ADDR.to_string(),
            local_bind_port: 0,
            target_address: DEFAULT_TARGET_ADDR.to_string(),
            target_port: 0,
            protocol: None,
            enable_forward_for: false,
            app_name_header: None,
        }
    }
}

// === impl UpstreamState ===

impl From<&UpstreamDefinition> for UpstreamState {
    fn from(def: &UpstreamDefinition) -> Self {
        Self {
            local_bind_address: def.local_bind_address.clone(),
            local_bind_port: def.local_bind_port,
            datacenter: def.datacenter().map(ToString::to_string),
            protocol: def.config_str("protocol").map(ToString::to_string),
            entries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{entry, leaf_cert, sidecar};
    use connect_watcher_core::registry::{HealthCheck, Weights};
    use pretty_assertions::assert_eq;

    fn check(status: HealthStatus) -> HealthCheck {
        HealthCheck {
            check_id: "service:web".to_string(),
            status,
            ..Default::default()
        }
    }

    fn ready_state() -> State {
        let mut state = State {
            service_name: "web".to_string(),
            service_id: "web-1".to_string(),
            trust_roots: None,
            leaf: None,
            downstream: DownstreamState::default(),
            upstreams: HashMap::default(),
        };
        state.set_trust_roots(TrustRoots::from_roots(&[]));
        state.set_leaf(leaf_cert("web", "01").into());
        state
    }

    #[test]
    fn excludes_unhealthy_and_zero_weight_instances() {
        let mut critical = entry("n1", "10.0.0.1", 8080);
        critical.checks = vec![check(HealthStatus::Critical)];

        let mut maintenance = entry("n2", "10.0.0.2", 8080);
        maintenance.checks = vec![HealthCheck {
            check_id: "_node_maintenance".to_string(),
            status: HealthStatus::Critical,
            ..Default::default()
        }];

        let mut zero = entry("n3", "10.0.0.3", 8080);
        zero.service.weights = Weights {
            passing: 0,
            warning: 1,
        };

        let mut warning_zero = entry("n4", "10.0.0.4", 8080);
        warning_zero.checks = vec![check(HealthStatus::Warning)];
        warning_zero.service.weights = Weights {
            passing: 10,
            warning: 0,
        };

        let mut warning = entry("n5", "10.0.0.5", 8080);
        warning.checks = vec![check(HealthStatus::Passing), check(HealthStatus::Warning)];
        warning.service.weights = Weights {
            passing: 10,
            warning: 2,
        };

        let mut passing = entry("n6", "10.0.0.6", 8080);
        passing.checks = vec![check(HealthStatus::Passing)];
        passing.service.weights = Weights {
            passing: 10,
            warning: 2,
        };

        let nodes = live_nodes(&[critical, maintenance, zero, warning_zero, warning, passing]);
        assert_eq!(
            nodes,
            vec![
                UpstreamNode {
                    name: "n5".to_string(),
                    address: "10.0.0.5".to_string(),
                    port: 8080,
                    weight: 2,
                },
                UpstreamNode {
                    name: "n6".to_string(),
                    address: "10.0.0.6".to_string(),
                    port: 8080,
                    weight: 10,
                },
            ]
        );
    }

    #[test]
    fn falls_back_to_node_address() {
        let mut svc_addr = entry("n1", "10.0.0.1", 8080);
        svc_addr.service.address = "192.168.0.1".to_string();
        let node_addr = entry("n2", "10.0.0.2", 8080);

        let nodes = live_nodes(&[svc_addr, node_addr]);
        assert_eq!(nodes[0].address, "192.168.0.1");
        assert_eq!(nodes[1].address, "10.0.0.2");
    }

    #[test]
    fn orders_nodes_by_name() {
        let entries = [
            entry("n3", "10.0.0.3", 8080),
            entry("n1", "10.0.0.1", 8080),
            entry("n2", "10.0.0.2", 8080),
        ];
        let mut reversed = entries.clone();
        reversed.reverse();

        let names = |nodes: Vec<UpstreamNode>| {
            nodes.into_iter().map(|n| n.name).collect::<Vec<_>>()
        };
        assert_eq!(names(live_nodes(&entries)), vec!["n1", "n2", "n3"]);
        assert_eq!(live_nodes(&entries), live_nodes(&reversed));
    }

    #[test]
    fn no_snapshot_without_identity() {
        let state = State::shared("web".to_string(), "web-1".to_string());
        assert!(state.lock().snapshot().is_none());

        state.lock().set_trust_roots(TrustRoots::from_roots(&[]));
        assert!(state.lock().snapshot().is_none());

        state.lock().set_leaf(leaf_cert("web", "01").into());
        assert!(state.lock().snapshot().is_some());
    }

    #[test]
    fn applies_sidecar_registration() {
        let mut state = ready_state();
        state.set_target_port(8080);
        state.apply_sidecar(&sidecar(
            21000,
            serde_json::json!({
                "protocol": "http",
                "bind_address": "10.1.1.1",
                "local_service_address": "127.0.0.2",
                "enable_forwardfor": true,
                "appname_header": "X-App",
                "unrelated": {"nested": true},
            }),
            vec![],
        ));

        let (config, _) = state.snapshot().unwrap();
        let ds = config.downstream;
        assert_eq!(ds.local_bind_address, "10.1.1.1");
        assert_eq!(ds.local_bind_port, 21000);
        assert_eq!(ds.target_address, "127.0.0.2");
        assert_eq!(ds.target_port, 8080);
        assert_eq!(ds.protocol.as_deref(), Some("http"));
        assert!(ds.enable_forward_for);
        assert_eq!(ds.app_name_header.as_deref(), Some("X-App"));
    }

    #[test]
    fn sidecar_defaults_and_retained_values() {
        let mut state = ready_state();
        state.apply_sidecar(&sidecar(
            21000,
            serde_json::json!({
                "protocol": "http",
                "bind_address": "10.1.1.1",
                "enable_forwardfor": true,
            }),
            vec![],
        ));

        // Addresses revert to their defaults; the rest keeps its prior value. Values of the wrong
        // type are ignored.
        state.apply_sidecar(&sidecar(
            21001,
            serde_json::json!({ "enable_forwardfor": "no" }),
            vec![],
        ));
        let (config, _) = state.snapshot().unwrap();
        let ds = config.downstream;
        assert_eq!(ds.local_bind_address, DEFAULT_DOWNSTREAM_BIND_ADDR);
        assert_eq!(ds.local_bind_port, 21001);
        assert_eq!(ds.target_address, DEFAULT_TARGET_ADDR);
        assert_eq!(ds.protocol.as_deref(), Some("http"));
        assert!(ds.enable_forward_for);

        state.apply_sidecar(&AgentService {
            port: 21002,
            proxy: None,
            ..Default::default()
        });
        let (config, _) = state.snapshot().unwrap();
        assert_eq!(config.downstream.local_bind_port, 21002);
        assert_eq!(config.downstream.protocol.as_deref(), Some("http"));
    }

    #[test]
    fn upstreams_share_identity_and_are_ordered() {
        let mut state = ready_state();

        for name in ["db", "cache"] {
            let def = UpstreamDefinition {
                destination_name: name.to_string(),
                local_bind_port: 9000,
                config: serde_json::json!({ "protocol": "tcp" })
                    .as_object()
                    .cloned()
                    .unwrap(),
                ..Default::default()
            };
            state.insert_upstream(UpstreamKey::new(&def), (&def).into());
        }
        let cache = UpstreamKey::new(&UpstreamDefinition {
            destination_name: "cache".to_string(),
            ..Default::default()
        });
        assert!(state.set_upstream_entries(
            &cache,
            vec![entry("n2", "10.0.0.2", 6379), entry("n1", "10.0.0.1", 6379)],
        ));

        let (config, endpoints) = state.snapshot().unwrap();
        let names = config
            .upstreams
            .iter()
            .map(|u| u.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["service_cache", "service_db"]);
        assert_eq!(config.upstreams[0].nodes.len(), 2);
        assert_eq!(config.upstreams[0].protocol.as_deref(), Some("tcp"));
        for up in &config.upstreams {
            assert_eq!(up.tls, config.downstream.tls);
            assert!(Arc::ptr_eq(&up.tls.leaf, &config.downstream.tls.leaf));
        }
        assert_eq!(
            endpoints,
            Endpoints {
                alive: 2,
                total: 2,
                by_upstream: vec![
                    EndpointCounts { alive: 2, total: 2 },
                    EndpointCounts { alive: 0, total: 0 },
                ],
            }
        );

        state.remove_upstream(&cache);
        assert!(!state.set_upstream_entries(&cache, vec![entry("n1", "10.0.0.1", 6379)]));
        assert_eq!(state.snapshot().unwrap().0.upstreams.len(), 1);
    }
}
