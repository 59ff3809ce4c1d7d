//! Deterministic transmission pricing.

use faxline_core::models::{Direction, Transmission};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Scale stored costs are rounded to.
const COST_SCALE: u32 = 4;

/// Rate table for outbound transmissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostConfig {
    /// Price per page before the destination multiplier.
    pub base_rate: Decimal,
    /// Recipient prefix billed at `domestic_multiplier`.
    pub domestic_prefix: String,
    /// Multiplier for domestic recipients.
    pub domestic_multiplier: Decimal,
    /// Recipient prefix billed at `secondary_multiplier`.
    pub secondary_prefix: String,
    /// Multiplier for the secondary country.
    pub secondary_multiplier: Decimal,
    /// Multiplier for every other destination.
    pub default_multiplier: Decimal,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            base_rate: Decimal::new(10, 2),
            domestic_prefix: "1".to_string(),
            domestic_multiplier: Decimal::ONE,
            secondary_prefix: "44".to_string(),
            secondary_multiplier: Decimal::new(15, 1),
            default_multiplier: Decimal::TWO,
        }
    }
}

/// Pure cost function over a transmission.
#[derive(Debug, Clone, Default)]
pub struct CostCalculator {
    config: CostConfig,
}

impl CostCalculator {
    /// Creates a calculator for the given rate table.
    pub const fn new(config: CostConfig) -> Self {
        Self { config }
    }

    /// Rate table in use.
    pub const fn config(&self) -> &CostConfig {
        &self.config
    }

    /// Multiplier applied for a recipient number.
    pub fn multiplier_for(&self, recipient: &str) -> Decimal {
        if recipient.starts_with(&self.config.domestic_prefix) {
            self.config.domestic_multiplier
        } else if recipient.starts_with(&self.config.secondary_prefix) {
            self.config.secondary_multiplier
        } else {
            self.config.default_multiplier
        }
    }

    /// `pages * base_rate * multiplier` for outbound, zero for inbound.
    pub fn cost(&self, tx: &Transmission) -> Decimal {
        match tx.direction {
            Direction::Inbound => Decimal::ZERO,
            Direction::Outbound => {
                let pages = Decimal::from(tx.pages.max(0));
                (pages * self.config.base_rate * self.multiplier_for(&tx.recipient))
                    .round_dp(COST_SCALE)
            },
        }
    }
}
