//! Liquidation monitoring, the partial-liquidation ladder, and the
//! insurance fund.

pub mod engine;
pub mod insurance;

pub use engine::{LiquidationConfig, LiquidationEngine};
pub use insurance::InsuranceFund;
