use crate::errors::RequestError;
use crate::models::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Broker Link Trait
// ---------------------------------------------------------------------------

/// The typed operations the trading engine needs from the broker connection.
///
/// The live transport implements this over its single websocket; tests
/// implement it with scripted fakes. Streaming operations return a receiver
/// that yields pushes until the stream is forgotten or the link shuts down;
/// the caller never suspends waiting for a push at subscribe time.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Establish the session's credentials. Must complete before any trading
    /// request.
    async fn authorize(&self, token: &str) -> Result<AccountInfo, RequestError>;

    /// Subscribe to the tick stream for a symbol. Subscribing twice for the
    /// same symbol replaces the receiver without a duplicate wire request.
    async fn subscribe_ticks(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>, RequestError>;

    /// Request a price/terms quote for a contract.
    async fn request_proposal(&self, request: &ProposalRequest)
        -> Result<Proposal, RequestError>;

    /// Execute a proposal at an acceptable price.
    async fn buy(&self, proposal_id: &str, price: Decimal)
        -> Result<ContractPurchase, RequestError>;

    /// Subscribe to updates for a purchased contract until settlement.
    async fn track_contract(&self, contract_id: u64)
        -> Result<mpsc::Receiver<Contract>, RequestError>;

    /// Best-effort cancellation of a contract update stream.
    async fn forget_contract(&self, contract_id: u64);

    /// Best-effort cancellation of a tick stream.
    async fn forget_ticks(&self, symbol: &str);
}
