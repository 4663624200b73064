use std::time::Duration;

/// Socket-level failures. These never crash the process; they feed the
/// reconnection supervisor.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Transport closed")]
    Closed,
    #[error("Connection stale: no inbound frames for {0:?}")]
    Stale(Duration),
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

/// Malformed inbound frames. Logged and dropped at the read loop, never
/// propagated as a crash.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Missing or invalid field: {0}")]
    MissingField(&'static str),
}

/// Failures surfaced to the caller of one correlated request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The server answered with an error payload for this request.
    #[error("{code}: {message}")]
    Api { code: String, message: String },
    #[error("Request timed out")]
    Timeout,
    #[error("Connection lost while request was pending")]
    ConnectionLost,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
