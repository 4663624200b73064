use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::client::Transport;

/// Periodic keepalive and staleness watchdog.
///
/// While connected, sends a lightweight ping on a fixed interval and tracks
/// inbound silence. Silence beyond the stale threshold is treated as a dead
/// connection and forces a close, which the reconnection supervisor picks up.
pub struct HeartbeatMonitor;

impl HeartbeatMonitor {
    pub fn spawn(transport: Transport) -> JoinHandle<()> {
        tokio::spawn(Self::run(transport))
    }

    async fn run(transport: Transport) {
        let config = transport.config().heartbeat;
        let interval = Duration::from_secs(config.interval_secs);
        let stale_after = Duration::from_secs(config.stale_after_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so a fresh connection is not
        // pinged before it has exchanged anything.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if transport.is_shutdown() {
                return;
            }
            if transport.state() != digitbot_core::ConnectionState::Connected {
                continue;
            }
            if transport.last_inbound_elapsed() > stale_after {
                transport.force_close("no inbound frames within stale threshold");
                continue;
            }
            if let Err(e) = transport.ping().await {
                debug!(error = %e, "Keepalive ping failed");
            }
        }
    }
}
