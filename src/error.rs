//! Engine error taxonomy.
//!
//! Every user-visible rejection maps to one of these kinds. Background loops
//! log and continue; unit-of-work failures abort and release holds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request or constraint violation (tick size, min notional,
    /// leverage cap). No state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Balance reservation failed. No state change.
    #[error("insufficient funds: need {required} {asset}, have {available}")]
    InsufficientFunds {
        asset: String,
        required: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    /// Order, position, market, or session does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Entity cannot transition from its current status. Idempotent in bulk
    /// operations, a failure in single operations.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Symbol paused or engine in maintenance.
    #[error("market halted: {0}")]
    MarketHalted(String),

    /// Price source disconnect or data corruption. Never surfaced to user
    /// operations; handled via failover and reconnect.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Invariant violation. Aborts the current unit of work.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable kind for `order_rejected` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::MarketHalted(_) => "market_halted",
            Self::Upstream(_) => "upstream",
            Self::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("sqlite: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_kinds() {
        assert_eq!(EngineError::validation("bad tick").kind(), "validation");
        assert_eq!(
            EngineError::InsufficientFunds {
                asset: "USDT".into(),
                required: dec!(100),
                available: dec!(50),
            }
            .kind(),
            "insufficient_funds"
        );
        assert_eq!(
            EngineError::not_found("order", "ORD-1").kind(),
            "not_found"
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::InsufficientFunds {
            asset: "USDT".into(),
            required: dec!(100.5),
            available: dec!(20),
        };
        let msg = err.to_string();
        assert!(msg.contains("USDT"));
        assert!(msg.contains("100.5"));
    }
}
