//! Liveness Monitor — spec.md §4.8: publish a self-addressed ping on the
//! admin channel every 20s; if no reply (from ourselves, via the relay
//! round trip) lands within 50s, treat the relay link as dead and exit
//! non-zero so a process supervisor restarts the daemon. Grounded on the
//! teacher's `run_autoscaler` background-task shape, reusing the same
//! `CancellationToken`-driven loop as `ledger::run_expiry_sweeper`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::relay::RelayTransport;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const DEATH_TIMEOUT: Duration = Duration::from_secs(50);

/// The self-addressed ping body. Plain text, not JSON-RPC — the admin plane
/// must special-case it before attempting `parse_request`.
pub const PING_MESSAGE: &str = "liveness-ping";

pub struct LivenessMonitor {
    last_seen_unix: AtomicI64,
}

impl LivenessMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_seen_unix: AtomicI64::new(Utc::now().timestamp()),
        })
    }

    pub fn mark_alive(&self) {
        self.last_seen_unix.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn seconds_since_seen(&self) -> i64 {
        Utc::now().timestamp() - self.last_seen_unix.load(Ordering::Relaxed)
    }

    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn RelayTransport>,
        admin_pubkey: String,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("liveness monitor shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = transport.send(&admin_pubkey, &admin_pubkey, PING_MESSAGE).await {
                        error!(error = %e, "liveness ping publish failed");
                    }
                    if self.seconds_since_seen() > DEATH_TIMEOUT.as_secs() as i64 {
                        error!("no liveness response in {:?}, exiting", DEATH_TIMEOUT);
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_monitor_has_not_timed_out() {
        let monitor = LivenessMonitor::new();
        assert!(monitor.seconds_since_seen() < DEATH_TIMEOUT.as_secs() as i64);
    }

    #[test]
    fn mark_alive_resets_the_clock() {
        let monitor = LivenessMonitor::new();
        monitor.last_seen_unix.store(0, Ordering::Relaxed);
        assert!(monitor.seconds_since_seen() > 1_000_000_000);
        monitor.mark_alive();
        assert!(monitor.seconds_since_seen() < 5);
    }
}
