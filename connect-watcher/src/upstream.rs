use crate::Context;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use connect_watcher_core::{
    duration::{GoDuration, ParseError},
    registry::{DestinationType, QueryOptions, ServiceEntry, UpstreamDefinition},
    Registry,
};
use std::{fmt, time::Duration};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Identifies an upstream by its destination type and name, e.g. `service_db`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct UpstreamKey(String);

/// An upstream definition that can't be watched.
#[derive(Debug, thiserror::Error)]
pub enum InvalidUpstream {
    #[error("invalid poll_interval {value:?}: {source}")]
    PollInterval {
        value: String,
        #[source]
        source: ParseError,
    },

    /// Go accepts a zero duration, but a prepared query polled every `0s` would spin against the
    /// registry, so only positive intervals are allowed.
    #[error("poll_interval must be positive, not {0}")]
    NonPositivePollInterval(GoDuration),
}

/// The set of running upstream watches.
///
/// Each watch runs as its own task under a child of the sidecar watch's cancellation token, so
/// stopping the sidecar watch stops every upstream with it.
pub(crate) struct Upstreams<R> {
    ctx: Context<R>,
    shutdown: CancellationToken,
    tasks: HashMap<UpstreamKey, Task>,
}

struct Task {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// === impl UpstreamKey ===

impl UpstreamKey {
    pub(crate) fn new(def: &UpstreamDefinition) -> Self {
        Self(format!("{}_{}", def.destination_type, def.destination_name))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl Upstreams ===

impl<R: Registry> Upstreams<R> {
    pub(crate) fn new(ctx: Context<R>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            shutdown,
            tasks: HashMap::default(),
        }
    }

    /// Starts a watch for every listed upstream that isn't already running and stops every running
    /// watch that is no longer listed.
    ///
    /// Upstreams are matched by key only; a running upstream whose definition changed keeps its
    /// existing watch. When a key is listed more than once, the first definition is used.
    pub(crate) async fn reconcile(&mut self, defs: &[UpstreamDefinition]) {
        let mut keep = HashSet::default();
        for def in defs {
            let key = UpstreamKey::new(def);
            if !keep.insert(key.clone()) {
                debug!(upstream = %key, "Ignoring duplicate upstream");
                continue;
            }
            if self.tasks.contains_key(&key) {
                continue;
            }
            if let Err(error) = self.start(key.clone(), def) {
                error!(upstream = %key, %error, "Invalid upstream");
            }
        }

        let removed = self
            .tasks
            .keys()
            .filter(|key| !keep.contains(*key))
            .cloned()
            .collect::<Vec<_>>();
        for key in removed {
            self.stop(&key).await;
        }

        self.ctx.metrics.set_upstreams(self.tasks.len());
    }

    /// Stops all upstream watches.
    pub(crate) async fn shutdown(mut self) {
        let keys = self.tasks.keys().cloned().collect::<Vec<_>>();
        for key in keys {
            self.stop(&key).await;
        }
        self.ctx.metrics.set_upstreams(0);
    }

    fn start(
        &mut self,
        key: UpstreamKey,
        def: &UpstreamDefinition,
    ) -> Result<(), InvalidUpstream> {
        // Validate before recording any state.
        let interval = match def.destination_type {
            DestinationType::Service => None,
            DestinationType::PreparedQuery => Some(poll_interval(
                def,
                self.ctx.config.prepared_query_interval,
            )?),
        };

        info!(upstream = %key, datacenter = ?def.datacenter(), "Watching upstream");
        self.ctx
            .state
            .lock()
            .insert_upstream(key.clone(), def.into());

        let cancel = self.shutdown.child_token();
        let span = info_span!("upstream", %key);
        let handle = match interval {
            None => tokio::spawn(
                watch_service(self.ctx.clone(), key.clone(), def.clone(), cancel.clone())
                    .instrument(span),
            ),
            Some(interval) => tokio::spawn(
                watch_prepared_query(
                    self.ctx.clone(),
                    key.clone(),
                    def.clone(),
                    interval,
                    cancel.clone(),
                )
                .instrument(span),
            ),
        };
        self.tasks.insert(key, Task { cancel, handle });
        Ok(())
    }

    /// Stops an upstream's watch and forgets its state.
    ///
    /// The watch has exited by the time its state is removed, so it can never write to a removed
    /// upstream.
    async fn stop(&mut self, key: &UpstreamKey) {
        let Some(Task { cancel, handle }) = self.tasks.remove(key) else {
            return;
        };
        info!(upstream = %key, "Removing upstream");
        cancel.cancel();
        if let Err(error) = handle.await {
            if error.is_panic() {
                error!(upstream = %key, %error, "Upstream watch panicked");
            }
        }
        self.ctx.state.lock().remove_upstream(key);
        self.ctx.metrics.upstream_removed(key.as_str());
    }
}

/// Determines how often a prepared query is executed.
///
/// A `poll_interval` that isn't a string is ignored. One that is a string must be a positive Go
/// duration.
fn poll_interval(def: &UpstreamDefinition, default: Duration) -> Result<Duration, InvalidUpstream> {
    let Some(value) = def.config_str("poll_interval") else {
        return Ok(default);
    };
    let interval = value
        .parse::<GoDuration>()
        .map_err(|source| InvalidUpstream::PollInterval {
            value: value.to_string(),
            source,
        })?;
    if interval.is_negative() || interval.is_zero() {
        return Err(InvalidUpstream::NonPositivePollInterval(interval));
    }
    Ok(interval.into())
}

/// Watches the mesh-capable, healthy instances of a named service.
async fn watch_service<R: Registry>(
    ctx: Context<R>,
    key: UpstreamKey,
    def: UpstreamDefinition,
    cancel: CancellationToken,
) {
    let mut poll = ctx.long_poll::<u64>(key.as_str());
    let registry = &*ctx.registry;
    let name = def.destination_name.as_str();
    let datacenter = def.datacenter().map(ToString::to_string);

    loop {
        let entries = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entries = poll.changed(|index| {
                let opts = QueryOptions {
                    datacenter: datacenter.clone(),
                    connect: true,
                    ..ctx.wait_index(index)
                };
                async move {
                    let res = registry.healthy_instances(name, &opts).await;
                    res.map(|(entries, meta)| (entries, meta.last_index))
                }
            }) => entries,
        };

        if !update(&ctx, &key, entries) {
            break;
        }
    }
    debug!("Stopped");
}

/// Executes a prepared query on a fixed interval.
///
/// Prepared queries can't block, so a change is detected by comparing each result with the last
/// one applied.
async fn watch_prepared_query<R: Registry>(
    ctx: Context<R>,
    key: UpstreamKey,
    def: UpstreamDefinition,
    interval: Duration,
    cancel: CancellationToken,
) {
    let opts = QueryOptions {
        datacenter: def.datacenter().map(ToString::to_string),
        connect: true,
        wait_time: Some(ctx.config.wait_time),
        ..Default::default()
    };
    let mut last = None::<Vec<ServiceEntry>>;

    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = ctx.registry.execute_prepared_query(&def.destination_name, &opts) => res,
        };

        let delay = match res {
            Ok(entries) if last.as_ref() == Some(&entries) => interval,
            Ok(entries) => {
                ctx.metrics.poll_updated(key.as_str());
                if !update(&ctx, &key, entries.clone()) {
                    break;
                }
                last = Some(entries);
                interval
            }
            Err(error) => {
                error!(query = %def.destination_name, %error, "Prepared query failed");
                ctx.metrics.poll_failed(key.as_str());
                ctx.config.error_backoff
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = time::sleep(delay) => {}
        }
    }
    debug!("Stopped");
}

/// Applies an upstream's instances and signals the change. Returns false if the upstream has been
/// removed.
fn update<R>(ctx: &Context<R>, key: &UpstreamKey, entries: Vec<ServiceEntry>) -> bool {
    let instances = entries.len();
    if !ctx.state.lock().set_upstream_entries(key, entries) {
        return false;
    }
    debug!(instances, "Updated upstream");
    ctx.notifier.notify();
    true
}
