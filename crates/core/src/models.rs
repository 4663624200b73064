use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Lifecycle state of the single broker connection.
///
/// Owned exclusively by the transport; everyone else observes transitions
/// through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Identifies one push stream multiplexed over the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// Tick stream for a symbol.
    Ticks(String),
    /// Update stream for an open contract.
    Contract(u64),
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::Ticks(symbol) => write!(f, "tick:{}", symbol),
            StreamKey::Contract(id) => write!(f, "contract:{}", id),
        }
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// A single price update for an instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub quote: Decimal,
    pub epoch: DateTime<Utc>,
    /// Last displayed digit of the quote, the value digit contracts settle
    /// against.
    pub digit: u8,
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Settlement state of a purchased contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Open,
    Sold,
    Expired,
}

/// A purchased contract as reported by the broker's update stream.
///
/// Mutates in place as pushes arrive for the same id; terminal once the
/// status leaves `Open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: u64,
    pub status: ContractStatus,
    pub entry_spot: Option<Decimal>,
    pub exit_spot: Option<Decimal>,
    pub payout: Decimal,
    pub profit: Decimal,
}

impl Contract {
    pub fn is_final(&self) -> bool {
        self.status != ContractStatus::Open
    }
}

/// The contract families this client can trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractType {
    #[serde(rename = "DIGITMATCH")]
    DigitMatch,
    #[serde(rename = "DIGITDIFF")]
    DigitDiff,
    #[serde(rename = "DIGITEVEN")]
    DigitEven,
    #[serde(rename = "DIGITODD")]
    DigitOdd,
    #[serde(rename = "DIGITOVER")]
    DigitOver,
    #[serde(rename = "DIGITUNDER")]
    DigitUnder,
    #[serde(rename = "CALL")]
    Rise,
    #[serde(rename = "PUT")]
    Fall,
}

impl ContractType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            ContractType::DigitMatch => "DIGITMATCH",
            ContractType::DigitDiff => "DIGITDIFF",
            ContractType::DigitEven => "DIGITEVEN",
            ContractType::DigitOdd => "DIGITODD",
            ContractType::DigitOver => "DIGITOVER",
            ContractType::DigitUnder => "DIGITUNDER",
            ContractType::Rise => "CALL",
            ContractType::Fall => "PUT",
        }
    }

    /// Whether a proposal for this type must carry a barrier (the predicted
    /// digit for match/diff/over/under).
    pub fn requires_barrier(&self) -> bool {
        matches!(
            self,
            ContractType::DigitMatch
                | ContractType::DigitDiff
                | ContractType::DigitOver
                | ContractType::DigitUnder
        )
    }
}

// ---------------------------------------------------------------------------
// Requests & Responses
// ---------------------------------------------------------------------------

/// Parameters for a price/terms quote ("proposal") request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub symbol: String,
    pub contract_type: ContractType,
    pub stake: Decimal,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: String,
    pub barrier: Option<String>,
}

/// A short-lived quote for a contract, referenced by id when buying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub ask_price: Decimal,
    pub payout: Decimal,
}

/// Result of a successful buy request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractPurchase {
    pub contract_id: u64,
    pub buy_price: Decimal,
}

/// Account snapshot returned by authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub loginid: String,
    pub balance: Decimal,
    pub currency: String,
}

// ---------------------------------------------------------------------------
// Trading Session
// ---------------------------------------------------------------------------

/// State of the trading engine's execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Proposing,
    AwaitingSettlement,
    Evaluating,
    Stopped,
}

/// Why a session reached `SessionState::Stopped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TakeProfit,
    StopLoss,
    MaxSteps,
    /// A proposal or buy request was rejected by the broker.
    TradeRejected(String),
    /// Caller-requested stop.
    Manual,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TakeProfit => write!(f, "take-profit"),
            StopReason::StopLoss => write!(f, "stop-loss"),
            StopReason::MaxSteps => write!(f, "max-steps"),
            StopReason::TradeRejected(msg) => write!(f, "trade-rejected: {}", msg),
            StopReason::Manual => write!(f, "manual"),
        }
    }
}

/// Static parameters of a trading session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub symbol: String,
    pub contract_type: ContractType,
    #[serde(default)]
    pub barrier: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default = "default_duration_unit")]
    pub duration_unit: String,
    pub base_stake: Decimal,
    pub multiplier: Decimal,
    pub max_stake: Decimal,
    pub max_steps: u32,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_duration() -> u32 {
    5
}

fn default_duration_unit() -> String {
    "t".to_string()
}

/// Live state of one trading session. Created on start, mutated only by the
/// engine's own loop, terminal once `state` is `Stopped`.
#[derive(Debug, Clone)]
pub struct TradingSession {
    pub config: SessionConfig,
    pub state: SessionState,
    pub current_stake: Decimal,
    pub step_count: u32,
    pub cumulative_profit: Decimal,
    pub trades: u32,
    pub stop_reason: Option<StopReason>,
}

impl TradingSession {
    pub fn new(config: SessionConfig) -> Self {
        let current_stake = config.base_stake;
        Self {
            config,
            state: SessionState::Idle,
            current_stake,
            step_count: 0,
            cumulative_profit: Decimal::ZERO,
            trades: 0,
            stop_reason: None,
        }
    }

    /// Build the proposal request for the next trade at the current stake.
    pub fn proposal_request(&self) -> ProposalRequest {
        ProposalRequest {
            symbol: self.config.symbol.clone(),
            contract_type: self.config.contract_type,
            stake: self.current_stake,
            currency: self.config.currency.clone(),
            duration: self.config.duration,
            duration_unit: self.config.duration_unit.clone(),
            barrier: self.config.barrier.clone(),
        }
    }

    /// Check the configured stop conditions, in priority order.
    pub fn stop_condition(&self) -> Option<StopReason> {
        if self.cumulative_profit >= self.config.take_profit {
            Some(StopReason::TakeProfit)
        } else if self.cumulative_profit <= -self.config.stop_loss {
            Some(StopReason::StopLoss)
        } else if self.step_count >= self.config.max_steps {
            Some(StopReason::MaxSteps)
        } else {
            None
        }
    }

    pub fn finish(&mut self, reason: StopReason) {
        self.state = SessionState::Stopped;
        self.stop_reason = Some(reason);
    }

    pub fn update(&self) -> SessionUpdate {
        SessionUpdate {
            state: self.state,
            cumulative_profit: self.cumulative_profit,
            step_count: self.step_count,
            stop_reason: self.stop_reason.clone(),
        }
    }
}

/// Session-state change notification delivered to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub state: SessionState,
    pub cumulative_profit: Decimal,
    pub step_count: u32,
    pub stop_reason: Option<StopReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn session() -> TradingSession {
        TradingSession::new(SessionConfig {
            symbol: "R_100".to_string(),
            contract_type: ContractType::DigitOdd,
            barrier: None,
            currency: "USD".to_string(),
            duration: 5,
            duration_unit: "t".to_string(),
            base_stake: dec!(1),
            multiplier: dec!(2),
            max_stake: dec!(20),
            max_steps: 5,
            take_profit: dec!(10),
            stop_loss: dec!(30),
        })
    }

    #[test]
    fn test_take_profit_triggers_at_threshold() {
        let mut s = session();
        s.cumulative_profit = dec!(9.99);
        assert!(s.stop_condition().is_none());
        s.cumulative_profit = dec!(10);
        assert_eq!(s.stop_condition(), Some(StopReason::TakeProfit));
    }

    #[test]
    fn test_stop_loss_triggers_on_drawdown() {
        let mut s = session();
        s.cumulative_profit = dec!(-30);
        assert_eq!(s.stop_condition(), Some(StopReason::StopLoss));
    }

    #[test]
    fn test_max_steps_triggers() {
        let mut s = session();
        s.step_count = 5;
        assert_eq!(s.stop_condition(), Some(StopReason::MaxSteps));
    }

    #[test]
    fn test_barrier_requirement_per_type() {
        assert!(ContractType::DigitOver.requires_barrier());
        assert!(ContractType::DigitMatch.requires_barrier());
        assert!(!ContractType::DigitEven.requires_barrier());
        assert!(!ContractType::Rise.requires_barrier());
    }
}
