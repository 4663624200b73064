//! Broker transport over a single persistent websocket.
//!
//! One socket multiplexes every correlated request/response exchange and
//! every push stream. The transport owns the connection lifecycle, the
//! heartbeat monitor treats inbound silence as failure, and the reconnection
//! supervisor re-authorizes and replays subscriptions after every reconnect
//! so subscribers only ever observe a gap in pushes.

pub mod client;
pub mod config;
pub mod correlator;
pub mod heartbeat;
pub mod registry;
pub mod supervisor;

pub use client::Transport;
pub use config::{HeartbeatConfig, ReconnectConfig, TransportConfig};
pub use heartbeat::HeartbeatMonitor;
pub use supervisor::ReconnectionSupervisor;
