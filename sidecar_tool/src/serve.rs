use core::{net::SocketAddr, time::Duration};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};
use p2p::{BlobSidecarsByRangeServer, RateLimiter};
use prometheus_metrics::Metrics;
use sidecar_store::SidecarStore;
use tokio::{net::TcpListener, signal, time};
use tokio_util::sync::CancellationToken;
use types::{config::Config, primitives::Slot};

const RATE_LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(
    config: Arc<Config>,
    store: Arc<SidecarStore>,
    metrics: Arc<Metrics>,
    listen: SocketAddr,
    current_slot: Option<Slot>,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    let rate_limiter = Arc::new(RateLimiter::from_config(&config));
    let cancel = CancellationToken::new();

    let server = Arc::new(BlobSidecarsByRangeServer::new(
        config,
        Arc::clone(&store),
        Arc::clone(&rate_limiter),
        Some(metrics),
    ));

    let mut prune_interval = time::interval(RATE_LIMITER_PRUNE_INTERVAL);

    info!("serving BlobSidecarsByRange requests on {listen}");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("shutting down");
                cancel.cancel();
                break;
            }
            _ = prune_interval.tick() => rate_limiter.prune_idle(),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;

                let current_slot = match current_slot {
                    Some(slot) => slot,
                    None => store.occupancy()?.highest_slot.unwrap_or_default(),
                };

                let server = Arc::clone(&server);
                let cancel = cancel.child_token();

                debug!("accepted connection from {peer}");

                tokio::spawn(async move {
                    let result = server
                        .handle_stream(&peer, stream, current_slot, &cancel)
                        .await;

                    if let Err(error) = result {
                        debug!("BlobSidecarsByRange request from {peer} failed: {error}");
                    }
                });
            }
        }
    }

    Ok(())
}
