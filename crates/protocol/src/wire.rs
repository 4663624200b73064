//! Outbound request frames. The correlation id is injected by the transport
//! just before the frame is written.

use digitbot_core::ProposalRequest;
use rust_decimal::Decimal;
use serde_json::{json, Value};

/// Establish session credentials.
pub fn authorize(token: &str) -> Value {
    json!({ "authorize": token })
}

/// Liveness keepalive; the reply carries no business payload.
pub fn ping() -> Value {
    json!({ "ping": 1 })
}

/// Subscribe to the tick stream for a symbol.
pub fn ticks(symbol: &str) -> Value {
    json!({ "ticks": symbol, "subscribe": 1 })
}

/// Request a quote for a contract at the given stake.
pub fn proposal(request: &ProposalRequest) -> Value {
    let mut frame = json!({
        "proposal": 1,
        "amount": request.stake,
        "basis": "stake",
        "contract_type": request.contract_type.wire_name(),
        "currency": request.currency,
        "duration": request.duration,
        "duration_unit": request.duration_unit,
        "symbol": request.symbol,
    });
    if let Some(barrier) = &request.barrier {
        frame["barrier"] = json!(barrier);
    }
    frame
}

/// Execute a proposal at an acceptable price.
pub fn buy(proposal_id: &str, price: Decimal) -> Value {
    json!({ "buy": proposal_id, "price": price })
}

/// Subscribe to updates for a purchased contract.
pub fn track_contract(contract_id: u64) -> Value {
    json!({
        "proposal_open_contract": 1,
        "contract_id": contract_id,
        "subscribe": 1,
    })
}

/// Cancel a broker-side stream by its subscription id.
pub fn forget(subscription_id: &str) -> Value {
    json!({ "forget": subscription_id })
}
