//! Periodic removal of file records whose paths disappeared.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::IndexSession;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sweep every `period` until `shutdown_rx` turns true. The first sweep runs
/// one full period after spawning.
#[must_use]
pub fn spawn_sweeper(
    session: IndexSession,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match session.sweep().await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "sweeper removed stale file records"),
                        Err(e) => tracing::warn!("sweep failed: {e:#}"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("sweeper shutting down");
                        break;
                    }
                }
            }
        }
    })
}
