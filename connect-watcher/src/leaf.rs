use crate::{poll::Ready, Context};
use connect_watcher_core::{LeafIdentity, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Watches this service's leaf certificate. Every rotation replaces the identity wholesale.
pub(crate) async fn watch<R: Registry>(
    ctx: Context<R>,
    service_name: String,
    mut ready: Ready,
    shutdown: CancellationToken,
) {
    let mut poll = ctx.long_poll::<u64>("leaf");
    let registry = &*ctx.registry;
    let service_name = service_name.as_str();

    loop {
        let leaf = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            leaf = poll.changed(|index| {
                let opts = ctx.wait_index(index);
                async move {
                    let res = registry.leaf_cert(service_name, &opts).await;
                    res.map(|(leaf, meta)| (leaf, meta.last_index))
                }
            }) => leaf,
        };

        info!(
            serial = %leaf.serial_number,
            valid_after = %leaf.valid_after,
            valid_before = %leaf.valid_before,
            "Updated leaf certificate"
        );
        ctx.state.lock().set_leaf(LeafIdentity::from(leaf));
        ctx.notifier.notify();
        if ready.mark() {
            debug!("Ready");
        }
    }
    debug!("Stopped");
}
