//! Insurance fund.
//!
//! A singleton pot that collects liquidation fees and absorbs the deficit
//! of insolvent liquidations. All mutation is serialised behind one mutex;
//! the balance never goes negative, it clamps at zero and the shortfall is
//! surfaced to the caller.

use crate::storage::db::Store;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize)]
pub struct InsuranceFundState {
    pub balance: Decimal,
    pub target_balance: Decimal,
    pub contributions: Decimal,
    pub payouts: Decimal,
    pub utilisation: Decimal,
    pub last_update: DateTime<Utc>,
}

struct FundInner {
    balance: Decimal,
    initial_balance: Decimal,
    contributions: Decimal,
    payouts: Decimal,
    last_update: DateTime<Utc>,
}

pub struct InsuranceFund {
    store: Arc<Store>,
    target: Decimal,
    inner: Mutex<FundInner>,
}

impl InsuranceFund {
    pub fn new(store: Arc<Store>, initial: Decimal, target: Decimal) -> Self {
        let (balance, contributions, payouts) = store
            .load_insurance_fund()
            .ok()
            .flatten()
            .unwrap_or((initial, Decimal::ZERO, Decimal::ZERO));
        Self {
            store,
            target,
            inner: Mutex::new(FundInner {
                balance,
                initial_balance: balance - contributions + payouts,
                contributions,
                payouts,
                last_update: Utc::now(),
            }),
        }
    }

    /// Book a liquidation-fee contribution.
    pub fn contribute(&self, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.balance += amount;
            inner.contributions += amount;
            inner.last_update = Utc::now();
            (inner.balance, inner.contributions, inner.payouts)
        };
        self.persist(snapshot);
    }

    /// Draw a deficit from the fund. Returns the amount actually covered;
    /// anything beyond the balance is an uncovered shortfall (ADL
    /// territory, out of scope past the alert).
    pub fn payout(&self, amount: Decimal) -> Decimal {
        if amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let (covered, snapshot) = {
            let mut inner = self.inner.lock();
            let covered = amount.min(inner.balance);
            inner.balance -= covered;
            inner.payouts += covered;
            inner.last_update = Utc::now();
            (covered, (inner.balance, inner.contributions, inner.payouts))
        };
        if covered < amount {
            error!(
                requested = %amount,
                covered = %covered,
                "insurance fund exhausted; uncovered deficit remains"
            );
        }
        self.persist(snapshot);
        covered
    }

    pub fn utilisation(&self) -> Decimal {
        if self.target <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.inner.lock().balance / self.target
    }

    pub fn balance(&self) -> Decimal {
        self.inner.lock().balance
    }

    pub fn snapshot(&self) -> InsuranceFundState {
        let inner = self.inner.lock();
        InsuranceFundState {
            balance: inner.balance,
            target_balance: self.target,
            contributions: inner.contributions,
            payouts: inner.payouts,
            utilisation: if self.target > Decimal::ZERO {
                inner.balance / self.target
            } else {
                Decimal::ZERO
            },
            last_update: inner.last_update,
        }
    }

    /// `contributions - payouts = balance - initial_balance` must hold at
    /// every commit.
    pub fn check_invariant(&self) -> bool {
        let inner = self.inner.lock();
        inner.contributions - inner.payouts == inner.balance - inner.initial_balance
    }

    fn persist(&self, (balance, contributions, payouts): (Decimal, Decimal, Decimal)) {
        if let Err(e) = self
            .store
            .save_insurance_fund(balance, contributions, payouts)
        {
            warn!(error = %e, "insurance fund persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fund() -> InsuranceFund {
        InsuranceFund::new(
            Arc::new(Store::open_in_memory().unwrap()),
            dec!(1000),
            dec!(5000),
        )
    }

    #[test]
    fn test_contribute_and_payout() {
        let fund = fund();
        fund.contribute(dec!(100));
        assert_eq!(fund.balance(), dec!(1100));
        let covered = fund.payout(dec!(300));
        assert_eq!(covered, dec!(300));
        assert_eq!(fund.balance(), dec!(800));
        assert!(fund.check_invariant());
    }

    #[test]
    fn test_payout_clamps_at_zero() {
        let fund = fund();
        let covered = fund.payout(dec!(2500));
        assert_eq!(covered, dec!(1000));
        assert_eq!(fund.balance(), Decimal::ZERO);
        assert!(fund.check_invariant());
    }

    #[test]
    fn test_utilisation() {
        let fund = fund();
        assert_eq!(fund.utilisation(), dec!(0.2));
        fund.contribute(dec!(4000));
        assert_eq!(fund.utilisation(), dec!(1));
    }

    #[test]
    fn test_persists_across_reopen() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        {
            let fund = InsuranceFund::new(store.clone(), dec!(1000), dec!(5000));
            fund.contribute(dec!(250));
        }
        let fund = InsuranceFund::new(store, dec!(1000), dec!(5000));
        assert_eq!(fund.balance(), dec!(1250));
        assert!(fund.check_invariant());
    }
}
