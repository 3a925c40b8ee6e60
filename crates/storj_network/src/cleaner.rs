//! The routing-table cleaner (§4.9): on a fixed interval, drops contacts whose
//! protocol has drifted incompatible or whose address has gone unroutable.

use std::sync::Arc;
use std::time::Duration;

use storj_crypto::ProtocolVersion;

use crate::router::RoutingTable;

/// Runs [`RoutingTable::clean`] every `interval` until `shutdown` fires.
pub async fn run_cleaner_loop(
    router: Arc<RoutingTable>,
    self_version: ProtocolVersion,
    allow_loopback: bool,
    interval: Duration,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = router.clean(&self_version, allow_loopback).await;
                if !removed.is_empty() {
                    tracing::debug!(count = removed.len(), "routing-table cleaner dropped stale contacts");
                }
            }
            _ = shutdown.notified() => return,
        }
    }
}
