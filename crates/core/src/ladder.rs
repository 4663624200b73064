use rust_decimal::Decimal;

/// Martingale stake ladder: the stake is multiplied after every loss,
/// capped at a maximum, and reset to the base after a win.
///
/// The current stake always stays within `[base, max_stake]`.
#[derive(Debug, Clone)]
pub struct StakeLadder {
    base: Decimal,
    multiplier: Decimal,
    max_stake: Decimal,
    current: Decimal,
    steps: u32,
}

impl StakeLadder {
    pub fn new(base: Decimal, multiplier: Decimal, max_stake: Decimal) -> Self {
        Self {
            base,
            multiplier,
            max_stake,
            current: base,
            steps: 0,
        }
    }

    /// Stake for the next trade.
    pub fn current(&self) -> Decimal {
        self.current
    }

    /// Consecutive losses since the last win.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// A win resets the ladder to the base stake.
    pub fn record_win(&mut self) {
        self.current = self.base;
        self.steps = 0;
    }

    /// A loss multiplies the stake, capped at the maximum.
    pub fn record_loss(&mut self) {
        self.current = (self.current * self.multiplier).min(self.max_stake);
        self.steps += 1;
    }
}
