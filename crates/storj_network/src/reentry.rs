//! Inactivity reentry (§4.9): after a configured idle period with no received
//! traffic, the node re-runs the overlay join rather than silently drifting out of
//! everyone else's routing table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tracks the last time this node observed inbound traffic. `storj_rpc`'s dispatcher
/// (or whatever wraps it) calls [`Self::touch`] on every verified inbound envelope.
pub struct ActivityTracker {
    last_activity: Mutex<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self { last_activity: Mutex::new(Instant::now()) }
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-runs the overlay join. Implemented by the network facade; kept as a trait here
/// so this module doesn't need to know about seeds, tunnel clients, or any of the
/// facade's other join-time machinery.
#[async_trait]
pub trait RejoinCallback: Send + Sync {
    async fn rejoin(&self);
}

/// Polls `tracker` every `idle_threshold` and invokes `rejoin` whenever the node has
/// gone at least that long without inbound traffic, until `shutdown` fires.
pub async fn run_reentry_loop(
    tracker: Arc<ActivityTracker>,
    rejoin: Arc<dyn RejoinCallback>,
    idle_threshold: Duration,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut ticker = tokio::time::interval(idle_threshold);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tracker.idle_for().await >= idle_threshold {
                    tracing::info!("node idle past threshold, re-running overlay join");
                    rejoin.rejoin().await;
                    tracker.touch().await;
                }
            }
            _ = shutdown.notified() => return,
        }
    }
}
