use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use digitbot_core::*;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Tuning for the execution loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on waiting for a contract to settle. On expiry the trade
    /// is booked as a loss and the session continues rather than deadlocking.
    pub settlement_timeout: Duration,
    /// Buffer capacity of the session update channel.
    pub update_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settlement_timeout: Duration::from_secs(120),
            update_buffer: 32,
        }
    }
}

/// Martingale-driven continuous trading loop.
///
/// One live session per engine. The loop is sequential by construction: a
/// new proposal is never issued while a contract is awaiting settlement.
/// `stop()` lets an in-flight contract settle and records its result before
/// halting.
pub struct TradingEngine {
    link: Arc<dyn BrokerLink>,
    config: EngineConfig,
    stop_requested: Arc<AtomicBool>,
    updates: mpsc::Sender<SessionUpdate>,
}

impl TradingEngine {
    /// Returns the engine plus the receiver for session-state notifications.
    pub fn new(
        link: Arc<dyn BrokerLink>,
        config: EngineConfig,
    ) -> (Self, mpsc::Receiver<SessionUpdate>) {
        let (updates, rx) = mpsc::channel(config.update_buffer);
        (
            Self {
                link,
                config,
                stop_requested: Arc::new(AtomicBool::new(false)),
                updates,
            },
            rx,
        )
    }

    /// Request the session to stop. If a contract is awaiting settlement,
    /// its result is still recorded before the session halts.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Run one trading session to a terminal stop condition. Returns the
    /// final session state.
    pub async fn run(&self, config: SessionConfig) -> TradingSession {
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut session = TradingSession::new(config);
        let mut ladder = StakeLadder::new(
            session.config.base_stake,
            session.config.multiplier,
            session.config.max_stake,
        );
        info!(
            symbol = %session.config.symbol,
            contract_type = session.config.contract_type.wire_name(),
            base_stake = %session.config.base_stake,
            take_profit = %session.config.take_profit,
            stop_loss = %session.config.stop_loss,
            "Trading session starting"
        );
        self.emit(&session);

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                session.finish(StopReason::Manual);
                break;
            }

            session.current_stake = ladder.current();
            session.state = SessionState::Proposing;
            self.emit(&session);

            let request = session.proposal_request();
            let proposal = match self.link.request_proposal(&request).await {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(error = %e, stake = %session.current_stake, "Proposal rejected");
                    session.finish(StopReason::TradeRejected(e.to_string()));
                    break;
                }
            };

            let purchase = match self.link.buy(&proposal.id, proposal.ask_price).await {
                Ok(purchase) => purchase,
                Err(e) => {
                    warn!(error = %e, proposal_id = %proposal.id, "Buy rejected");
                    session.finish(StopReason::TradeRejected(e.to_string()));
                    break;
                }
            };
            session.trades += 1;
            info!(
                contract_id = purchase.contract_id,
                stake = %session.current_stake,
                step = session.step_count,
                "Contract purchased"
            );

            session.state = SessionState::AwaitingSettlement;
            self.emit(&session);
            let profit = self
                .await_settlement(purchase.contract_id, session.current_stake)
                .await;

            session.state = SessionState::Evaluating;
            session.cumulative_profit += profit;
            self.emit(&session);

            if profit > Decimal::ZERO {
                ladder.record_win();
            } else {
                ladder.record_loss();
            }
            session.step_count = ladder.steps();
            info!(
                profit = %profit,
                cumulative = %session.cumulative_profit,
                next_stake = %ladder.current(),
                "Trade settled"
            );

            if let Some(reason) = session.stop_condition() {
                session.finish(reason);
                break;
            }
        }

        let reason = session
            .stop_reason
            .clone()
            .unwrap_or(StopReason::Manual);
        info!(
            reason = %reason,
            cumulative = %session.cumulative_profit,
            trades = session.trades,
            "Trading session stopped"
        );
        self.emit(&session);
        session
    }

    /// Wait for the contract's settlement push, bounded by the configured
    /// timeout. A timeout or a prematurely closed stream is a settlement
    /// anomaly: booked as a loss of the full stake so the ladder and stop
    /// conditions stay coherent.
    async fn await_settlement(&self, contract_id: u64, stake: Decimal) -> Decimal {
        let mut updates = match self.link.track_contract(contract_id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(contract_id, error = %e, "Could not track contract, booking as loss");
                return -stake;
            }
        };
        let deadline = tokio::time::Instant::now() + self.config.settlement_timeout;
        loop {
            match tokio::time::timeout_at(deadline, updates.recv()).await {
                Ok(Some(contract)) if contract.is_final() => {
                    self.link.forget_contract(contract_id).await;
                    return contract.profit;
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    warn!(contract_id, "Contract stream closed before settlement, booking as loss");
                    return -stake;
                }
                Err(_) => {
                    warn!(contract_id, "Settlement wait timed out, booking as loss");
                    self.link.forget_contract(contract_id).await;
                    return -stake;
                }
            }
        }
    }

    fn emit(&self, session: &TradingSession) {
        // Updates are advisory; a slow or absent listener must never stall
        // the trading loop.
        if let Err(mpsc::error::TrySendError::Full(_)) = self.updates.try_send(session.update()) {
            warn!("Session update listener lagging, dropping update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    /// Broker fake that settles each trade with the next scripted profit.
    struct ScriptedLink {
        outcomes: Mutex<VecDeque<Decimal>>,
        next_contract_id: AtomicU64,
        stakes: Mutex<Vec<Decimal>>,
        open_contracts: AtomicU64,
        max_open_contracts: AtomicU64,
        reject_proposals: bool,
    }

    impl ScriptedLink {
        fn new(outcomes: Vec<Decimal>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                next_contract_id: AtomicU64::new(1),
                stakes: Mutex::new(Vec::new()),
                open_contracts: AtomicU64::new(0),
                max_open_contracts: AtomicU64::new(0),
                reject_proposals: false,
            }
        }

        fn stakes(&self) -> Vec<Decimal> {
            self.stakes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerLink for ScriptedLink {
        async fn authorize(&self, _token: &str) -> Result<AccountInfo, RequestError> {
            Ok(AccountInfo {
                loginid: "TEST1".to_string(),
                balance: dec!(1000),
                currency: "USD".to_string(),
            })
        }

        async fn subscribe_ticks(
            &self,
            _symbol: &str,
        ) -> Result<mpsc::Receiver<Tick>, RequestError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn request_proposal(
            &self,
            request: &ProposalRequest,
        ) -> Result<Proposal, RequestError> {
            if self.reject_proposals {
                return Err(RequestError::Api {
                    code: "InvalidStake".to_string(),
                    message: "Stake exceeds balance".to_string(),
                });
            }
            self.stakes.lock().unwrap().push(request.stake);
            Ok(Proposal {
                id: "prop-1".to_string(),
                ask_price: request.stake,
                payout: request.stake * dec!(1.95),
            })
        }

        async fn buy(
            &self,
            _proposal_id: &str,
            price: Decimal,
        ) -> Result<ContractPurchase, RequestError> {
            let open = self.open_contracts.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open_contracts.fetch_max(open, Ordering::SeqCst);
            Ok(ContractPurchase {
                contract_id: self.next_contract_id.fetch_add(1, Ordering::SeqCst),
                buy_price: price,
            })
        }

        async fn track_contract(
            &self,
            contract_id: u64,
        ) -> Result<mpsc::Receiver<Contract>, RequestError> {
            let (tx, rx) = mpsc::channel(4);
            let profit = self.outcomes.lock().unwrap().pop_front();
            if let Some(profit) = profit {
                tx.send(Contract {
                    contract_id,
                    status: ContractStatus::Sold,
                    entry_spot: Some(dec!(100.1)),
                    exit_spot: Some(dec!(100.2)),
                    payout: dec!(1.95),
                    profit,
                })
                .await
                .unwrap();
            }
            // No scripted outcome: leave the stream open so the settlement
            // timeout path runs.
            std::mem::forget(tx);
            Ok(rx)
        }

        async fn forget_contract(&self, _contract_id: u64) {
            self.open_contracts.fetch_sub(1, Ordering::SeqCst);
        }

        async fn forget_ticks(&self, _symbol: &str) {}
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            symbol: "R_100".to_string(),
            contract_type: ContractType::DigitOdd,
            barrier: None,
            currency: "USD".to_string(),
            duration: 5,
            duration_unit: "t".to_string(),
            base_stake: dec!(1),
            multiplier: dec!(2),
            max_stake: dec!(20),
            max_steps: 7,
            take_profit: dec!(10),
            stop_loss: dec!(100),
        }
    }

    fn engine(link: Arc<ScriptedLink>) -> (TradingEngine, mpsc::Receiver<SessionUpdate>) {
        TradingEngine::new(
            link,
            EngineConfig {
                settlement_timeout: Duration::from_millis(200),
                update_buffer: 256,
            },
        )
    }

    #[tokio::test]
    async fn test_take_profit_stops_the_session() {
        let link = Arc::new(ScriptedLink::new(vec![
            dec!(2),
            dec!(2),
            dec!(2),
            dec!(2),
            dec!(2),
        ]));
        let (engine, _updates) = engine(link.clone());
        let session = engine.run(session_config()).await;

        assert_eq!(session.state, SessionState::Stopped);
        assert_eq!(session.stop_reason, Some(StopReason::TakeProfit));
        assert_eq!(session.cumulative_profit, dec!(10));
        // Every trade was a win, so every stake is the base stake.
        assert_eq!(link.stakes(), vec![dec!(1); 5]);
    }

    #[tokio::test]
    async fn test_loss_ladder_doubles_caps_and_stops_on_max_steps() {
        let link = Arc::new(ScriptedLink::new(vec![dec!(-1); 7]));
        let (engine, _updates) = engine(link.clone());
        let session = engine.run(session_config()).await;

        assert_eq!(session.stop_reason, Some(StopReason::MaxSteps));
        assert_eq!(
            link.stakes(),
            vec![
                dec!(1),
                dec!(2),
                dec!(4),
                dec!(8),
                dec!(16),
                dec!(20),
                dec!(20)
            ]
        );
    }

    #[tokio::test]
    async fn test_win_resets_the_ladder() {
        // Two losses, a win, then enough wins to take profit.
        let link = Arc::new(ScriptedLink::new(vec![
            dec!(-1),
            dec!(-2),
            dec!(4),
            dec!(5),
            dec!(5),
        ]));
        let (engine, _updates) = engine(link.clone());
        let session = engine.run(session_config()).await;

        assert_eq!(session.stop_reason, Some(StopReason::TakeProfit));
        assert_eq!(
            link.stakes(),
            vec![dec!(1), dec!(2), dec!(4), dec!(1), dec!(1)]
        );
    }

    #[tokio::test]
    async fn test_stop_loss_stops_the_session() {
        let mut config = session_config();
        config.stop_loss = dec!(3);
        config.max_steps = 50;
        let link = Arc::new(ScriptedLink::new(vec![dec!(-1), dec!(-2), dec!(-4)]));
        let (engine, _updates) = engine(link.clone());
        let session = engine.run(config).await;

        assert_eq!(session.stop_reason, Some(StopReason::StopLoss));
        assert_eq!(session.cumulative_profit, dec!(-3));
    }

    #[tokio::test]
    async fn test_proposal_rejection_stops_without_retry() {
        let mut link = ScriptedLink::new(vec![]);
        link.reject_proposals = true;
        let link = Arc::new(link);
        let (engine, _updates) = engine(link.clone());
        let session = engine.run(session_config()).await;

        match session.stop_reason {
            Some(StopReason::TradeRejected(message)) => {
                assert!(message.contains("InvalidStake"));
            }
            other => panic!("Expected trade rejection, got {:?}", other),
        }
        assert_eq!(link.stakes().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_timeout_is_booked_as_loss_and_continues() {
        // Two scripted losses, then a contract that never settles. The
        // timeout books the full stake of the third trade as a loss, which
        // trips the stop-loss.
        let mut config = session_config();
        config.stop_loss = dec!(7);
        config.max_steps = 50;
        let link = Arc::new(ScriptedLink::new(vec![dec!(-2), dec!(-4)]));
        let (engine, _updates) = engine(link.clone());
        let session = engine.run(config).await;

        assert_eq!(session.stop_reason, Some(StopReason::StopLoss));
        assert_eq!(session.cumulative_profit, dec!(-10));
        assert_eq!(link.stakes(), vec![dec!(1), dec!(2), dec!(4)]);
    }

    #[tokio::test]
    async fn test_never_more_than_one_contract_awaiting_settlement() {
        let link = Arc::new(ScriptedLink::new(vec![
            dec!(-1),
            dec!(2),
            dec!(-1),
            dec!(2),
            dec!(2),
            dec!(2),
            dec!(2),
            dec!(2),
        ]));
        let (engine, _updates) = engine(link.clone());
        let _session = engine.run(session_config()).await;

        assert_eq!(link.max_open_contracts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_updates_report_state_and_profit() {
        let link = Arc::new(ScriptedLink::new(vec![dec!(10)]));
        let (engine, mut updates) = engine(link);
        let _session = engine.run(session_config()).await;

        let mut states = Vec::new();
        while let Ok(update) = updates.try_recv() {
            states.push(update.state);
        }
        assert_eq!(
            states,
            vec![
                SessionState::Idle,
                SessionState::Proposing,
                SessionState::AwaitingSettlement,
                SessionState::Evaluating,
                SessionState::Stopped,
            ]
        );
    }
}
