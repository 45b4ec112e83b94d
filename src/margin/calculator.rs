//! Margin arithmetic.
//!
//! Pure functions over decimals; no I/O, no state. Everything here is
//! USDT-margined: notional and margin are quote-denominated.

use crate::models::{PositionSide, RiskLevel};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// One bracket of a symbol's leverage table. Tables are monotone in
/// notional; the first bracket covering the notional wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageTier {
    pub tier: u32,
    pub min_notional: Decimal,
    pub max_notional: Decimal,
    pub max_leverage: u32,
    pub maintenance_rate: Decimal,
    pub maintenance_flat: Decimal,
}

/// Default bracket table applied to symbols without an explicit override.
pub fn default_tiers() -> Vec<LeverageTier> {
    vec![
        LeverageTier {
            tier: 1,
            min_notional: Decimal::ZERO,
            max_notional: dec!(50_000),
            max_leverage: 125,
            maintenance_rate: dec!(0.004),
            maintenance_flat: Decimal::ZERO,
        },
        LeverageTier {
            tier: 2,
            min_notional: dec!(50_000),
            max_notional: dec!(250_000),
            max_leverage: 100,
            maintenance_rate: dec!(0.005),
            maintenance_flat: dec!(50),
        },
        LeverageTier {
            tier: 3,
            min_notional: dec!(250_000),
            max_notional: dec!(1_000_000),
            max_leverage: 50,
            maintenance_rate: dec!(0.01),
            maintenance_flat: dec!(1_300),
        },
        LeverageTier {
            tier: 4,
            min_notional: dec!(1_000_000),
            max_notional: dec!(5_000_000),
            max_leverage: 20,
            maintenance_rate: dec!(0.025),
            maintenance_flat: dec!(16_300),
        },
        LeverageTier {
            tier: 5,
            min_notional: dec!(5_000_000),
            max_notional: dec!(50_000_000),
            max_leverage: 10,
            maintenance_rate: dec!(0.05),
            maintenance_flat: dec!(141_300),
        },
        LeverageTier {
            tier: 6,
            min_notional: dec!(50_000_000),
            max_notional: Decimal::MAX,
            max_leverage: 5,
            maintenance_rate: dec!(0.1),
            maintenance_flat: dec!(2_641_300),
        },
    ]
}

/// Find the bracket covering `notional`. Falls back to the last tier for
/// out-of-range notionals so callers never lose a lookup.
pub fn tier_for<'a>(tiers: &'a [LeverageTier], notional: Decimal) -> &'a LeverageTier {
    tiers
        .iter()
        .find(|t| notional >= t.min_notional && notional < t.max_notional)
        .unwrap_or_else(|| tiers.last().expect("tier table is never empty"))
}

pub fn initial_margin(notional: Decimal, leverage: u32) -> Decimal {
    notional / Decimal::from(leverage)
}

pub fn maintenance_margin(notional: Decimal, tier: &LeverageTier) -> Decimal {
    notional * tier.maintenance_rate + tier.maintenance_flat
}

pub fn unrealised_pnl(
    side: PositionSide,
    entry: Decimal,
    mark: Decimal,
    quantity: Decimal,
) -> Decimal {
    match side {
        PositionSide::Long => (mark - entry) * quantity,
        PositionSide::Short => (entry - mark) * quantity,
    }
}

/// `maintenance / equity`, where equity = margin + unrealised PnL.
/// Non-positive equity is already past bankruptcy; the ratio is clamped
/// high so every threshold downstream trips.
pub fn margin_ratio(maintenance: Decimal, margin: Decimal, unrealised: Decimal) -> Decimal {
    let equity = margin + unrealised;
    if equity <= Decimal::ZERO {
        return dec!(10);
    }
    maintenance / equity
}

pub fn liquidation_price(
    side: PositionSide,
    entry: Decimal,
    leverage: u32,
    maintenance_rate: Decimal,
    liquidation_fee_rate: Decimal,
) -> Decimal {
    let inv_lev = Decimal::ONE / Decimal::from(leverage);
    match side {
        PositionSide::Long => {
            entry * (Decimal::ONE - inv_lev + maintenance_rate + liquidation_fee_rate)
        }
        PositionSide::Short => {
            entry * (Decimal::ONE + inv_lev - maintenance_rate - liquidation_fee_rate)
        }
    }
}

pub fn bankruptcy_price(side: PositionSide, entry: Decimal, leverage: u32) -> Decimal {
    let inv_lev = Decimal::ONE / Decimal::from(leverage);
    match side {
        PositionSide::Long => entry * (Decimal::ONE - inv_lev),
        PositionSide::Short => entry * (Decimal::ONE + inv_lev),
    }
}

pub fn risk_level(ratio: Decimal) -> RiskLevel {
    if ratio >= dec!(0.95) {
        RiskLevel::Liquidation
    } else if ratio >= dec!(0.85) {
        RiskLevel::Critical
    } else if ratio >= dec!(0.7) {
        RiskLevel::Danger
    } else if ratio >= dec!(0.5) {
        RiskLevel::Warning
    } else {
        RiskLevel::Safe
    }
}
