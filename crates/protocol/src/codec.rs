//! Inbound frame decoding and classification.
//!
//! Every inbound text frame decodes to a [`RawFrame`]; classification then
//! sorts it into a correlated response (a pending caller is waiting on its
//! `req_id`), a push for a stream key, or a bare keepalive reply. Frames
//! matching none of those are dropped by the caller.

use chrono::{DateTime, Utc};
use digitbot_core::digits;
use digitbot_core::{
    AccountInfo, Contract, ContractPurchase, ContractStatus, Proposal, ProtocolError, StreamKey,
    Tick,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Error payload carried on a correlated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// A decoded but unclassified inbound frame.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub msg_type: Option<String>,
    pub req_id: Option<u64>,
    pub error: Option<ApiError>,
    pub body: Value,
}

/// A classified inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// Resolves exactly one pending request.
    Response {
        req_id: u64,
        result: Result<Value, ApiError>,
    },
    /// Stream event with no caller waiting.
    Push { key: StreamKey, payload: Value },
    /// Keepalive reply; only refreshes liveness.
    Keepalive,
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<RawFrame, ProtocolError> {
    let body: Value = serde_json::from_str(text)?;
    if !body.is_object() {
        return Err(ProtocolError::MissingField("frame object"));
    }
    let msg_type = body
        .get("msg_type")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let req_id = body.get("req_id").and_then(Value::as_u64);
    let error = body.get("error").map(|e| ApiError {
        code: e
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("UnknownError")
            .to_string(),
        message: e
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    });
    Ok(RawFrame {
        msg_type,
        req_id,
        error,
        body,
    })
}

/// Classify a decoded frame. `is_pending` reports whether a caller is still
/// waiting on a given correlation id; a frame whose id matches a pending
/// request is its response, everything else falls through to push/keepalive
/// shape matching. Returns `None` for frames that match nothing.
pub fn classify<F>(raw: RawFrame, is_pending: F) -> Option<Frame>
where
    F: Fn(u64) -> bool,
{
    if let Some(req_id) = raw.req_id {
        if is_pending(req_id) {
            let result = match raw.error {
                Some(error) => Err(error),
                None => Ok(raw.body),
            };
            return Some(Frame::Response { req_id, result });
        }
    }
    match raw.msg_type.as_deref() {
        Some("tick") => {
            let symbol = raw.body.get("tick")?.get("symbol")?.as_str()?.to_string();
            Some(Frame::Push {
                key: StreamKey::Ticks(symbol),
                payload: raw.body,
            })
        }
        Some("proposal_open_contract") => {
            let contract_id = raw
                .body
                .get("proposal_open_contract")?
                .get("contract_id")?
                .as_u64()?;
            Some(Frame::Push {
                key: StreamKey::Contract(contract_id),
                payload: raw.body,
            })
        }
        Some("ping") => Some(Frame::Keepalive),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Typed payload parsers
// ---------------------------------------------------------------------------

pub fn parse_account(body: &Value) -> Result<AccountInfo, ProtocolError> {
    let account = body
        .get("authorize")
        .ok_or(ProtocolError::MissingField("authorize"))?;
    Ok(AccountInfo {
        loginid: str_field(account, "loginid")?.to_string(),
        balance: decimal_field(account, "balance")?,
        currency: str_field(account, "currency")?.to_string(),
    })
}

pub fn parse_tick(body: &Value) -> Result<Tick, ProtocolError> {
    let tick = body.get("tick").ok_or(ProtocolError::MissingField("tick"))?;
    let quote = tick
        .get("quote")
        .and_then(Value::as_f64)
        .ok_or(ProtocolError::MissingField("quote"))?;
    let pip_size = tick
        .get("pip_size")
        .and_then(Value::as_f64)
        .ok_or(ProtocolError::MissingField("pip_size"))?;
    let epoch_secs = tick
        .get("epoch")
        .and_then(Value::as_i64)
        .ok_or(ProtocolError::MissingField("epoch"))?;
    let epoch = DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .ok_or(ProtocolError::MissingField("epoch"))?;
    Ok(Tick {
        symbol: str_field(tick, "symbol")?.to_string(),
        quote: decimal_field(tick, "quote")?,
        epoch,
        digit: digits::last_digit(quote, pip_size),
    })
}

pub fn parse_contract(body: &Value) -> Result<Contract, ProtocolError> {
    let poc = body
        .get("proposal_open_contract")
        .ok_or(ProtocolError::MissingField("proposal_open_contract"))?;
    let contract_id = poc
        .get("contract_id")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("contract_id"))?;
    let status = match str_field(poc, "status")? {
        "open" => ContractStatus::Open,
        "sold" => ContractStatus::Sold,
        "expired" | "won" | "lost" => ContractStatus::Expired,
        _ => return Err(ProtocolError::MissingField("status")),
    };
    Ok(Contract {
        contract_id,
        status,
        entry_spot: poc.get("entry_spot").and_then(decimal_value),
        exit_spot: poc.get("exit_spot").and_then(decimal_value),
        payout: optional_decimal_field(poc, "payout"),
        profit: optional_decimal_field(poc, "profit"),
    })
}

pub fn parse_proposal(body: &Value) -> Result<Proposal, ProtocolError> {
    let proposal = body
        .get("proposal")
        .ok_or(ProtocolError::MissingField("proposal"))?;
    Ok(Proposal {
        id: str_field(proposal, "id")?.to_string(),
        ask_price: decimal_field(proposal, "ask_price")?,
        payout: decimal_field(proposal, "payout")?,
    })
}

pub fn parse_purchase(body: &Value) -> Result<ContractPurchase, ProtocolError> {
    let buy = body.get("buy").ok_or(ProtocolError::MissingField("buy"))?;
    let contract_id = buy
        .get("contract_id")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("contract_id"))?;
    Ok(ContractPurchase {
        contract_id,
        buy_price: decimal_field(buy, "buy_price")?,
    })
}

/// Broker-side subscription id carried on a subscribe acknowledgement.
pub fn parse_subscription_id(body: &Value) -> Option<String> {
    body.get("subscription")?
        .get("id")?
        .as_str()
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Field helpers — broker payloads carry numbers either as JSON numbers or
// as strings, so decimals accept both.
// ---------------------------------------------------------------------------

fn str_field<'a>(value: &'a Value, name: &'static str) -> Result<&'a str, ProtocolError> {
    value
        .get(name)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(name))
}

fn decimal_field(value: &Value, name: &'static str) -> Result<Decimal, ProtocolError> {
    value
        .get(name)
        .and_then(decimal_value)
        .ok_or(ProtocolError::MissingField(name))
}

fn optional_decimal_field(value: &Value, name: &str) -> Decimal {
    value
        .get(name)
        .and_then(decimal_value)
        .unwrap_or(Decimal::ZERO)
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}
