use crate::state::Endpoints;
use connect_watcher_core::Config;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Metrics describing the watches and the configurations they produce.
///
/// The default value is not registered anywhere; it still counts, but nothing exports it.
#[derive(Clone, Debug, Default)]
pub struct WatchMetrics {
    poll_updates: Family<WatchLabels, Counter>,
    poll_errors: Family<WatchLabels, Counter>,
    snapshots: Counter,
    upstreams: Gauge,
    upstream_endpoints: Family<EndpointLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct WatchLabels {
    watch: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EndpointLabels {
    upstream: String,
    state: String,
}

impl WatchMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "poll_updates",
            "Count of changed values observed by each watch",
            metrics.poll_updates.clone(),
        );
        prom.register(
            "poll_errors",
            "Count of failed queries by each watch",
            metrics.poll_errors.clone(),
        );
        prom.register(
            "snapshots",
            "Count of configurations generated",
            metrics.snapshots.clone(),
        );
        prom.register(
            "upstreams",
            "Gauge of the number of upstreams being watched",
            metrics.upstreams.clone(),
        );
        prom.register(
            "upstream_endpoints",
            "Gauge of the number of endpoints in the last configuration, by upstream and health",
            metrics.upstream_endpoints.clone(),
        );

        metrics
    }

    pub(crate) fn poll_updated(&self, watch: &str) {
        self.poll_updates
            .get_or_create(&WatchLabels {
                watch: watch.to_string(),
            })
            .inc();
    }

    pub(crate) fn poll_failed(&self, watch: &str) {
        self.poll_errors
            .get_or_create(&WatchLabels {
                watch: watch.to_string(),
            })
            .inc();
    }

    pub(crate) fn set_upstreams(&self, n: usize) {
        self.upstreams.set(n as i64);
    }

    pub(crate) fn upstream_removed(&self, upstream: &str) {
        for state in ["alive", "total"] {
            self.upstream_endpoints.remove(&EndpointLabels {
                upstream: upstream.to_string(),
                state: state.to_string(),
            });
        }
    }

    pub(crate) fn snapshot_generated(&self, config: &Config, endpoints: &Endpoints) {
        self.snapshots.inc();
        for (upstream, counts) in config.upstreams.iter().zip(&endpoints.by_upstream) {
            for (state, n) in [("alive", counts.alive), ("total", counts.total)] {
                self.upstream_endpoints
                    .get_or_create(&EndpointLabels {
                        upstream: upstream.name.clone(),
                        state: state.to_string(),
                    })
                    .set(n as i64);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn poll_errors(&self, watch: &str) -> u64 {
        self.poll_errors
            .get_or_create(&WatchLabels {
                watch: watch.to_string(),
            })
            .get()
    }

    #[cfg(test)]
    pub(crate) fn snapshots(&self) -> u64 {
        self.snapshots.get()
    }
}
