//! Automated trade-execution loop.
//!
//! The engine chains proposal → buy → settlement tracking into a stateful
//! martingale session on top of a [`digitbot_core::BrokerLink`]. It is the
//! only component that sequences multiple broker calls; callers drive it
//! through `run`/`stop` and observe progress via session updates.

pub mod session;

pub use session::{EngineConfig, TradingEngine};
