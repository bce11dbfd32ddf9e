use crate::{poll::Ready, upstream::Upstreams, Context};
use connect_watcher_core::Registry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Watches the sidecar's own registration.
///
/// Each change updates the inbound listener and reconciles the running upstream watches against
/// the registration's upstream list. The upstream watches stop when this watch does.
pub(crate) async fn watch_sidecar<R: Registry>(
    ctx: Context<R>,
    proxy_id: String,
    mut ready: Ready,
    shutdown: CancellationToken,
) {
    let mut poll = ctx.long_poll::<String>("sidecar");
    let mut upstreams = Upstreams::new(ctx.clone(), shutdown.child_token());
    let registry = &*ctx.registry;
    let proxy_id = proxy_id.as_str();

    loop {
        let sidecar = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sidecar = poll.changed(|hash| {
                let opts = ctx.wait_hash(hash);
                async move {
                    let res = registry.service(proxy_id, &opts).await;
                    res.map(|(sidecar, meta)| (sidecar, meta.last_content_hash))
                }
            }) => sidecar,
        };

        let defs = sidecar
            .proxy
            .as_ref()
            .map(|proxy| &proxy.upstreams[..])
            .unwrap_or_default();
        debug!(
            port = sidecar.port,
            upstreams = defs.len(),
            "Updated sidecar registration"
        );
        ctx.state.lock().apply_sidecar(&sidecar);
        upstreams.reconcile(defs).await;
        ctx.notifier.notify();
        if ready.mark() {
            debug!("Ready");
        }
    }

    upstreams.shutdown().await;
    debug!("Stopped");
}

/// Watches this service's own registration for the port the inbound listener forwards to.
pub(crate) async fn watch_target_port<R: Registry>(
    ctx: Context<R>,
    service_id: String,
    mut ready: Ready,
    shutdown: CancellationToken,
) {
    let mut poll = ctx.long_poll::<String>("service");
    let registry = &*ctx.registry;
    let service_id = service_id.as_str();

    loop {
        let service = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            service = poll.changed(|hash| {
                let opts = ctx.wait_hash(hash);
                async move {
                    let res = registry.service(service_id, &opts).await;
                    res.map(|(service, meta)| (service, meta.last_content_hash))
                }
            }) => service,
        };

        debug!(port = service.port, "Updated service registration");
        ctx.state.lock().set_target_port(service.port);
        ctx.notifier.notify();
        if ready.mark() {
            debug!("Ready");
        }
    }
    debug!("Stopped");
}
