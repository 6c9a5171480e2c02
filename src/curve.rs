//! Off-chain mirror of the launch bonding curve.
//!
//! `price(supply) = initial_price + price_increment * supply`. A quote sums
//! the per-unit price over every unit traded, so a large buy pays for the
//! price it pushes up rather than the price it started at.

use serde::{Deserialize, Serialize};

use crate::types::{Side, VerificationTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum QuoteError {
    #[error("insufficient curve supply")]
    InsufficientSupply,
    #[error("token has graduated from the bonding curve")]
    Graduated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondingCurveState {
    pub token_id: String,
    pub current_supply: u64,
    pub max_supply: u64,
    pub initial_price: f64,
    pub price_increment: f64,
    pub graduation_threshold_supply: u64,
    /// Latched once the threshold is reached; never cleared.
    pub graduated: bool,
    /// Minimum verification tier for the launch phase.
    pub min_verification_tier: VerificationTier,
}

impl BondingCurveState {
    pub fn new(
        token_id: &str,
        max_supply: u64,
        initial_price: f64,
        price_increment: f64,
        graduation_threshold_supply: u64,
    ) -> Self {
        Self {
            token_id: token_id.to_string(),
            current_supply: 0,
            max_supply,
            initial_price,
            price_increment,
            graduation_threshold_supply,
            graduated: false,
            min_verification_tier: VerificationTier::None,
        }
    }

    pub fn with_min_tier(mut self, tier: VerificationTier) -> Self {
        self.min_verification_tier = tier;
        self
    }

    pub fn is_graduated(&self) -> bool {
        self.graduated || self.current_supply >= self.graduation_threshold_supply
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub side: Side,
    pub amount: u64,
    /// Total cost of a buy or proceeds of a sell.
    pub total: f64,
    pub average_price: f64,
    pub supply_after: u64,
}

pub struct BondingCurvePricer;

impl BondingCurvePricer {
    /// Instantaneous price of the unit at `supply`.
    pub fn price_at(curve: &BondingCurveState, supply: u64) -> f64 {
        curve.initial_price + curve.price_increment * supply as f64
    }

    /// Sum of per-unit prices for units `start..start + amount`.
    fn integrate(curve: &BondingCurveState, start: u64, amount: u64) -> f64 {
        let a = amount as f64;
        let s = start as f64;
        a * curve.initial_price + curve.price_increment * (a * s + a * (a - 1.0) / 2.0)
    }

    pub fn quote(curve: &BondingCurveState, side: Side, amount: u64) -> Result<Quote, QuoteError> {
        if curve.is_graduated() {
            return Err(QuoteError::Graduated);
        }
        let (start, supply_after) = match side {
            Side::Buy => {
                let after = curve
                    .current_supply
                    .checked_add(amount)
                    .filter(|after| *after <= curve.max_supply)
                    .ok_or(QuoteError::InsufficientSupply)?;
                (curve.current_supply, after)
            }
            Side::Sell => {
                let after = curve
                    .current_supply
                    .checked_sub(amount)
                    .ok_or(QuoteError::InsufficientSupply)?;
                (after, after)
            }
        };
        let total = Self::integrate(curve, start, amount);
        let average_price = if amount == 0 { Self::price_at(curve, start) } else { total / amount as f64 };
        Ok(Quote {
            side,
            amount,
            total,
            average_price,
            supply_after,
        })
    }

    /// Move supply to the quoted level and latch graduation.
    pub fn apply(curve: &mut BondingCurveState, quote: &Quote) {
        curve.current_supply = quote.supply_after.min(curve.max_supply);
        if curve.current_supply >= curve.graduation_threshold_supply {
            curve.graduated = true;
        }
    }

    /// `current_supply * 100 / graduation_threshold_supply`, truncated, in [0, 100].
    pub fn graduation_progress(curve: &BondingCurveState) -> u8 {
        if curve.graduated || curve.graduation_threshold_supply == 0 {
            return 100;
        }
        let pct = curve.current_supply as u128 * 100 / curve.graduation_threshold_supply as u128;
        pct.min(100) as u8
    }
}
