use digitbot_core::{ConnectionState, TransportError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::Transport;

/// Watches connection state and drives reconnection.
///
/// Reacts to every transition into `Disconnected` that was not caller
/// initiated: retries `connect()` with exponential backoff, re-authorizes if
/// credentials were previously established, then replays every registered
/// subscription. Exhausting the attempt budget is fatal and surfaces as the
/// task's return value.
pub struct ReconnectionSupervisor;

impl ReconnectionSupervisor {
    pub fn spawn(transport: Transport) -> JoinHandle<Result<(), TransportError>> {
        tokio::spawn(Self::run(transport))
    }

    async fn run(transport: Transport) -> Result<(), TransportError> {
        let mut state_rx = transport.state_changes();
        loop {
            if state_rx.changed().await.is_err() {
                return Ok(());
            }
            if transport.is_shutdown() {
                return Ok(());
            }
            let state = *state_rx.borrow_and_update();
            if state != ConnectionState::Disconnected {
                continue;
            }
            Self::reconnect(&transport).await?;
        }
    }

    async fn reconnect(transport: &Transport) -> Result<(), TransportError> {
        let config = transport.config().reconnect;
        for attempt in 0..config.max_attempts {
            let delay = config.delay_for(attempt);
            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
            if transport.is_shutdown() {
                return Ok(());
            }
            match transport.connect().await {
                Ok(()) => {
                    if let Err(e) = transport.reauthorize().await {
                        warn!(error = %e, "Re-authorization failed");
                        transport.force_close("re-authorization failed");
                        continue;
                    }
                    transport.replay_subscriptions().await;
                    info!(attempt = attempt + 1, "Reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                }
            }
        }
        error!(
            attempts = config.max_attempts,
            "Reconnect attempts exhausted, giving up"
        );
        Err(TransportError::ReconnectExhausted {
            attempts: config.max_attempts,
        })
    }
}
