use crate::metrics::WatchMetrics;
use std::{fmt, future::Future, time::Duration};
use tokio::{sync::oneshot, time};
use tracing::{debug, error};

/// Drives a blocking query that resumes from a cursor: the registry's change index, or a content
/// hash.
///
/// The query is expected to block until the value changes or its wait time elapses. A response
/// carrying the cursor we sent means the wait timed out and the query is simply reissued.
pub(crate) struct LongPoll<C> {
    watch: String,
    cursor: C,
    synced: bool,
    backoff: Duration,
    metrics: WatchMetrics,
}

/// Marks one watch as ready the first time it applies a value.
#[derive(Debug)]
pub(crate) struct Ready(Option<oneshot::Sender<()>>);

pub(crate) fn ready() -> (Ready, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (Ready(Some(tx)), rx)
}

// === impl LongPoll ===

impl<C: Default> LongPoll<C> {
    pub(crate) fn new(watch: impl Into<String>, backoff: Duration, metrics: WatchMetrics) -> Self {
        Self {
            watch: watch.into(),
            cursor: C::default(),
            synced: false,
            backoff,
            metrics,
        }
    }
}

impl<C> LongPoll<C>
where
    C: Clone + Default + PartialEq + fmt::Debug,
{
    /// Issues queries until one returns a changed value.
    ///
    /// The first successful response is always a change. When a query fails, the error is logged,
    /// the cursor is reset, and the query is retried after the backoff, so the next success is a
    /// full resync rather than a resumption from a possibly stale position.
    pub(crate) async fn changed<T, F, Fut>(&mut self, mut fetch: F) -> T
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = anyhow::Result<(T, C)>>,
    {
        loop {
            match fetch(self.cursor.clone()).await {
                Ok((value, cursor)) => {
                    let changed = !self.synced || cursor != self.cursor;
                    self.cursor = cursor;
                    self.synced = true;
                    if changed {
                        debug!(watch = %self.watch, cursor = ?self.cursor, "Changed");
                        self.metrics.poll_updated(&self.watch);
                        return value;
                    }
                }
                Err(error) => {
                    error!(watch = %self.watch, %error, "Query failed");
                    self.metrics.poll_failed(&self.watch);
                    self.cursor = C::default();
                    self.synced = false;
                    time::sleep(self.backoff).await;
                }
            }
        }
    }
}

// === impl Ready ===

impl Ready {
    /// Returns true the first time it's called.
    pub(crate) fn mark(&mut self) -> bool {
        match self.0.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}
