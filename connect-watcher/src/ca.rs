use crate::{poll::Ready, Context};
use connect_watcher_core::{Registry, TrustRoots};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Watches the mesh's CA roots, rebuilding the trust pool from scratch on every change.
pub(crate) async fn watch<R: Registry>(
    ctx: Context<R>,
    mut ready: Ready,
    shutdown: CancellationToken,
) {
    let mut poll = ctx.long_poll::<u64>("ca_roots");
    let registry = &*ctx.registry;

    loop {
        let roots = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            roots = poll.changed(|index| {
                let opts = ctx.wait_index(index);
                async move {
                    let res = registry.ca_roots(&opts).await;
                    res.map(|(roots, meta)| (roots, meta.last_index))
                }
            }) => roots,
        };

        // Parse outside of the lock.
        let trust = TrustRoots::from_roots(&roots.roots);
        info!(
            active = %roots.active_root_id,
            roots = roots.roots.len(),
            pool = trust.store().len(),
            "Updated CA roots"
        );
        ctx.state.lock().set_trust_roots(trust);
        ctx.notifier.notify();
        if ready.mark() {
            debug!("Ready");
        }
    }
    debug!("Stopped");
}
