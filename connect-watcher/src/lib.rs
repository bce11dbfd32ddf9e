//! Connect sidecar topology watcher
//!
//! The watcher tracks everything a sidecar proxy needs to know about the mesh and republishes it as
//! a single [`Config`] whenever any of it changes. It runs the following watches concurrently, each
//! as its own task:
//!
//! - The mesh's CA roots, from which the trust pool is rebuilt on every change.
//! - This service's leaf certificate, replaced wholesale on every rotation.
//! - The sidecar's own registration, which describes the inbound listener and the list of
//!   upstreams. Every change reconciles the set of running upstream watches against that list.
//! - This service's own registration, whose port is the inbound listener's forwarding target.
//! - One watch per upstream: either a blocking health query for a named service or a fixed-interval
//!   poll of a prepared query.
//!
//! ```text
//! [ CA roots ] [ leaf ] [ sidecar ] [ service ]   [ upstream ]*
//!       \          \        |   \        /            /
//!        +----------+-------+----+------+------------+
//!                           |  (lock, notify)
//!                      [ State ] --> [ synthesizer ] --> Config
//! ```
//!
//! All watches write into one mutex-guarded [`State`](state::State) and then signal a single-slot
//! notifier, so bursts of changes collapse into one regeneration. No configuration is published
//! until the CA, leaf, sidecar, and service watches have each completed one successful poll.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod ca;
mod leaf;
pub mod metrics;
mod notify;
mod poll;
mod service;
mod state;
mod upstream;


pub use self::{metrics::WatchMetrics, upstream::InvalidUpstream};
pub use connect_watcher_core as core;
pub use connect_watcher_core::{Config, Registry};

use self::{
    notify::{Changes, Notifier},
    state::SharedState,
};
use anyhow::{Context as _, Result};
use connect_watcher_core::{duration, registry::QueryOptions};
use futures::future;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Tunes the watch loops. Durations deserialize from Go duration strings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// How long a watch sleeps after a failed query before retrying.
    #[serde(deserialize_with = "duration::deserialize")]
    pub error_backoff: Duration,

    /// How long the registry may hold a blocking query open.
    #[serde(deserialize_with = "duration::deserialize")]
    pub wait_time: Duration,

    /// How often prepared queries are executed unless an upstream sets `poll_interval`.
    #[serde(deserialize_with = "duration::deserialize")]
    pub prepared_query_interval: Duration,
}

/// Watches the registry on behalf of one service's sidecar.
pub struct Watcher<R> {
    service_id: String,
    registry: Arc<R>,
    config: WatcherConfig,
    metrics: WatchMetrics,
    configs: mpsc::Sender<Config>,
}

/// Everything a watch task needs. Cloned into each task.
pub(crate) struct Context<R> {
    pub(crate) registry: Arc<R>,
    pub(crate) state: SharedState,
    pub(crate) notifier: Notifier,
    pub(crate) config: WatcherConfig,
    pub(crate) metrics: WatchMetrics,
}

// === impl WatcherConfig ===

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_secs(5),
            wait_time: Duration::from_secs(10 * 60),
            prepared_query_interval: Duration::from_secs(30),
        }
    }
}

// === impl Watcher ===

impl<R: Registry> Watcher<R> {
    /// Creates a watcher for the service registered as `service_id`.
    ///
    /// Configurations are published on the returned receiver. The channel holds at most one
    /// configuration, so a slow consumer throttles regeneration.
    pub fn new(
        service_id: impl ToString,
        registry: Arc<R>,
        config: WatcherConfig,
    ) -> (Self, mpsc::Receiver<Config>) {
        let (configs, rx) = mpsc::channel(1);
        let watcher = Self {
            service_id: service_id.to_string(),
            registry,
            config,
            metrics: WatchMetrics::default(),
            configs,
        };
        (watcher, rx)
    }

    pub fn with_metrics(mut self, metrics: WatchMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Runs all watches until `shutdown` is cancelled or the configuration receiver is dropped.
    ///
    /// Fails only if the service's identity can't be established at startup. Once the watches are
    /// running, every error is logged and retried.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            service_id,
            registry,
            config,
            metrics,
            configs,
        } = self;

        let proxy_id = registry
            .sidecar_proxy_id(&service_id)
            .await
            .with_context(|| format!("failed to resolve sidecar proxy for {service_id}"))?;
        let (service, _) = registry
            .service(&service_id, &QueryOptions::default())
            .await
            .with_context(|| format!("failed to fetch service definition for {service_id}"))?;
        info!(service = %service.service, id = %service_id, proxy = %proxy_id, "Starting watches");

        let service_name = service.service;
        let (notifier, changes) = notify::channel();
        let ctx = Context {
            registry,
            state: state::State::shared(service_name.clone(), service_id.clone()),
            notifier,
            config,
            metrics,
        };

        let tasks = shutdown.child_token();
        let (ca_ready, ca_rx) = poll::ready();
        let (leaf_ready, leaf_rx) = poll::ready();
        let (sidecar_ready, sidecar_rx) = poll::ready();
        let (service_ready, service_rx) = poll::ready();
        let handles = vec![
            tokio::spawn(
                ca::watch(ctx.clone(), ca_ready, tasks.clone()).instrument(info_span!("ca_roots")),
            ),
            tokio::spawn(
                leaf::watch(ctx.clone(), service_name, leaf_ready, tasks.clone())
                    .instrument(info_span!("leaf")),
            ),
            tokio::spawn(
                service::watch_sidecar(ctx.clone(), proxy_id.clone(), sidecar_ready, tasks.clone())
                    .instrument(info_span!("sidecar", id = %proxy_id)),
            ),
            tokio::spawn(
                service::watch_target_port(
                    ctx.clone(),
                    service_id.clone(),
                    service_ready,
                    tasks.clone(),
                )
                .instrument(info_span!("service", id = %service_id)),
            ),
        ];
        let ready = vec![ca_rx, leaf_rx, sidecar_rx, service_rx];

        let res = publish(&ctx, changes, ready, configs, &shutdown).await;

        tasks.cancel();
        future::join_all(handles).await;
        debug!("Watches stopped");
        res
    }
}

/// Publishes a configuration for every coalesced change once all initial watches are ready.
async fn publish<R>(
    ctx: &Context<R>,
    mut changes: Changes,
    ready: Vec<oneshot::Receiver<()>>,
    configs: mpsc::Sender<Config>,
    shutdown: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        res = future::try_join_all(ready) => {
            res.context("watch terminated before becoming ready")?;
        }
        _ = shutdown.cancelled() => return Ok(()),
    }
    info!("Watches ready");

    loop {
        tokio::select! {
            changed = changes.changed() => if !changed {
                return Ok(());
            },
            _ = shutdown.cancelled() => return Ok(()),
        }

        let snapshot = ctx.state.lock().snapshot();
        let Some((config, endpoints)) = snapshot else {
            debug!("Identity not yet available; skipping configuration");
            continue;
        };
        debug!(
            service = %config.service_name,
            id = %config.service_id,
            alive = endpoints.alive,
            total = endpoints.total,
            "Generated configuration"
        );
        ctx.metrics.snapshot_generated(&config, &endpoints);

        tokio::select! {
            res = configs.send(config) => if res.is_err() {
                debug!("Configuration receiver dropped");
                return Ok(());
            },
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

// === impl Context ===

impl<R> Clone for Context<R> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            state: self.state.clone(),
            notifier: self.notifier.clone(),
            config: self.config,
            metrics: self.metrics.clone(),
        }
    }
}

impl<R> Context<R> {
    pub(crate) fn long_poll<C: Default>(&self, watch: impl Into<String>) -> poll::LongPoll<C> {
        poll::LongPoll::new(watch, self.config.error_backoff, self.metrics.clone())
    }

    /// Options for an index-based blocking query.
    pub(crate) fn wait_index(&self, index: u64) -> QueryOptions {
        QueryOptions {
            wait_index: index,
            wait_time: Some(self.config.wait_time),
            ..Default::default()
        }
    }

    /// Options for a content-hash-based blocking query.
    pub(crate) fn wait_hash(&self, hash: String) -> QueryOptions {
        QueryOptions {
            wait_hash: Some(hash).filter(|h| !h.is_empty()),
            wait_time: Some(self.config.wait_time),
            ..Default::default()
        }
    }
}
