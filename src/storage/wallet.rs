//! Wallet ledger.
//!
//! Balances live in the durable store; this keeps a write-through cache with
//! one async mutex per user, so concurrent orders of the same user serialise
//! on their unit of work. Invariant at every commit: `total = available +
//! locked` per balance, and no balance component goes negative.

use crate::error::{EngineError, EngineResult};
use crate::models::Balance;
use crate::storage::db::Store;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

type Account = HashMap<String, Balance>;

pub struct WalletLedger {
    store: Arc<Store>,
    accounts: RwLock<HashMap<String, Arc<Mutex<Account>>>>,
    /// Quote credit granted to unseen users (demo environments; zero
    /// disables).
    demo_credit: Decimal,
    demo_asset: String,
}

impl WalletLedger {
    pub fn new(store: Arc<Store>, demo_credit: Decimal) -> Self {
        Self {
            store,
            accounts: RwLock::new(HashMap::new()),
            demo_credit,
            demo_asset: "USDT".to_string(),
        }
    }

    /// Warm the cache from the store at boot.
    pub fn load(&self) -> anyhow::Result<()> {
        let rows = self.store.load_all_wallets()?;
        let mut accounts = self.accounts.write();
        for (user_id, balance) in rows {
            let account = accounts
                .entry(user_id)
                .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())));
            // Boot runs before any worker; try_lock cannot contend here.
            account
                .try_lock()
                .expect("wallet boot load before workers start")
                .insert(balance.asset.clone(), balance);
        }
        debug!(users = accounts.len(), "wallet cache warmed");
        Ok(())
    }

    fn account(&self, user_id: &str) -> Arc<Mutex<Account>> {
        if let Some(acc) = self.accounts.read().get(user_id) {
            return acc.clone();
        }
        let mut accounts = self.accounts.write();
        accounts
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let mut fresh = HashMap::new();
                if self.demo_credit > Decimal::ZERO {
                    fresh.insert(
                        self.demo_asset.clone(),
                        Balance {
                            asset: self.demo_asset.clone(),
                            available: self.demo_credit,
                            locked: Decimal::ZERO,
                        },
                    );
                }
                Arc::new(Mutex::new(fresh))
            })
            .clone()
    }

    /// Run one unit of work against a user's account. The mutation either
    /// commits (persisted, snapshot returned) or leaves no trace.
    pub async fn with_account<R>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut Account) -> EngineResult<R>,
    ) -> EngineResult<(R, Vec<Balance>)> {
        let account = self.account(user_id);
        let mut guard = account.lock().await;
        let backup = guard.clone();

        let out = match f(&mut guard) {
            Ok(out) => out,
            Err(e) => {
                *guard = backup;
                return Err(e);
            }
        };

        for b in guard.values() {
            if b.available < Decimal::ZERO || b.locked < Decimal::ZERO {
                let asset = b.asset.clone();
                *guard = backup;
                return Err(EngineError::internal(format!(
                    "wallet invariant violated for {user_id}/{asset}"
                )));
            }
        }

        let snapshot: Vec<Balance> = guard.values().cloned().collect();
        if let Err(e) = self.store.save_wallet(user_id, &snapshot) {
            error!(user_id, error = %e, "wallet persist failed; rolling back");
            *guard = backup;
            return Err(EngineError::internal(format!("wallet persist: {e}")));
        }
        Ok((out, snapshot))
    }

    pub async fn credit(&self, user_id: &str, asset: &str, amount: Decimal) -> EngineResult<Vec<Balance>> {
        let asset = asset.to_string();
        let (_, snapshot) = self
            .with_account(user_id, move |acc| {
                let b = acc
                    .entry(asset.clone())
                    .or_insert_with(|| Balance::zero(asset.clone()));
                b.available += amount;
                Ok(())
            })
            .await?;
        Ok(snapshot)
    }

    /// Move `available -> locked`, failing without a state change when the
    /// available balance is short.
    pub async fn reserve(&self, user_id: &str, asset: &str, amount: Decimal) -> EngineResult<Vec<Balance>> {
        let asset_owned = asset.to_string();
        let (_, snapshot) = self
            .with_account(user_id, move |acc| {
                let b = acc
                    .entry(asset_owned.clone())
                    .or_insert_with(|| Balance::zero(asset_owned.clone()));
                if b.available < amount {
                    return Err(EngineError::InsufficientFunds {
                        asset: asset_owned.clone(),
                        required: amount,
                        available: b.available,
                    });
                }
                b.available -= amount;
                b.locked += amount;
                Ok(())
            })
            .await?;
        Ok(snapshot)
    }

    /// Move `locked -> available` (reservation release / margin return).
    pub async fn release(&self, user_id: &str, asset: &str, amount: Decimal) -> EngineResult<Vec<Balance>> {
        let asset_owned = asset.to_string();
        let (_, snapshot) = self
            .with_account(user_id, move |acc| {
                let b = acc
                    .entry(asset_owned.clone())
                    .or_insert_with(|| Balance::zero(asset_owned.clone()));
                let take = amount.min(b.locked);
                b.locked -= take;
                b.available += take;
                Ok(())
            })
            .await?;
        Ok(snapshot)
    }

    /// Consume locked funds (fill settlement). Fails when locked is short,
    /// which would mean the reservation accounting went wrong upstream.
    pub async fn spend_locked(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
    ) -> EngineResult<Vec<Balance>> {
        let asset_owned = asset.to_string();
        let (_, snapshot) = self
            .with_account(user_id, move |acc| {
                let b = acc
                    .entry(asset_owned.clone())
                    .or_insert_with(|| Balance::zero(asset_owned.clone()));
                if b.locked < amount {
                    return Err(EngineError::internal(format!(
                        "locked underflow for {}: have {}, spending {}",
                        asset_owned, b.locked, amount
                    )));
                }
                b.locked -= amount;
                Ok(())
            })
            .await?;
        Ok(snapshot)
    }

    /// Debit available funds directly (negative PnL settlement).
    pub async fn debit_available(
        &self,
        user_id: &str,
        asset: &str,
        amount: Decimal,
    ) -> EngineResult<Vec<Balance>> {
        let asset_owned = asset.to_string();
        let (_, snapshot) = self
            .with_account(user_id, move |acc| {
                let b = acc
                    .entry(asset_owned.clone())
                    .or_insert_with(|| Balance::zero(asset_owned.clone()));
                b.available = (b.available - amount).max(Decimal::ZERO);
                Ok(())
            })
            .await?;
        Ok(snapshot)
    }

    pub async fn balances(&self, user_id: &str) -> Vec<Balance> {
        let account = self.account(user_id);
        let guard = account.lock().await;
        guard.values().cloned().collect()
    }

    pub async fn available(&self, user_id: &str, asset: &str) -> Decimal {
        let account = self.account(user_id);
        let guard = account.lock().await;
        guard
            .get(asset)
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn locked(&self, user_id: &str, asset: &str) -> Decimal {
        let account = self.account(user_id);
        let guard = account.lock().await;
        guard.get(asset).map(|b| b.locked).unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> WalletLedger {
        WalletLedger::new(Arc::new(Store::open_in_memory().unwrap()), Decimal::ZERO)
    }

    #[tokio::test]
    async fn test_reserve_and_release_roundtrip() {
        let ledger = ledger();
        ledger.credit("u1", "USDT", dec!(1000)).await.unwrap();
        ledger.reserve("u1", "USDT", dec!(400)).await.unwrap();

        assert_eq!(ledger.available("u1", "USDT").await, dec!(600));
        assert_eq!(ledger.locked("u1", "USDT").await, dec!(400));

        ledger.release("u1", "USDT", dec!(400)).await.unwrap();
        assert_eq!(ledger.available("u1", "USDT").await, dec!(1000));
        assert_eq!(ledger.locked("u1", "USDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reserve_insufficient_leaves_no_trace() {
        let ledger = ledger();
        ledger.credit("u1", "USDT", dec!(100)).await.unwrap();
        let err = ledger.reserve("u1", "USDT", dec!(500)).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(ledger.available("u1", "USDT").await, dec!(100));
        assert_eq!(ledger.locked("u1", "USDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_spend_locked_underflow_is_internal_error() {
        let ledger = ledger();
        ledger.credit("u1", "USDT", dec!(100)).await.unwrap();
        ledger.reserve("u1", "USDT", dec!(50)).await.unwrap();
        let err = ledger
            .spend_locked("u1", "USDT", dec!(80))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
        // untouched
        assert_eq!(ledger.locked("u1", "USDT").await, dec!(50));
    }

    #[tokio::test]
    async fn test_unit_of_work_rolls_back_on_error() {
        let ledger = ledger();
        ledger.credit("u1", "USDT", dec!(100)).await.unwrap();
        let res: EngineResult<((), Vec<Balance>)> = ledger
            .with_account("u1", |acc| {
                let b = acc.get_mut("USDT").unwrap();
                b.available -= dec!(60);
                Err(EngineError::conflict("abort mid-flight"))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(ledger.available("u1", "USDT").await, dec!(100));
    }

    #[tokio::test]
    async fn test_total_invariant_holds() {
        let ledger = ledger();
        ledger.credit("u1", "USDT", dec!(250.5)).await.unwrap();
        ledger.reserve("u1", "USDT", dec!(100.25)).await.unwrap();
        let balances = ledger.balances("u1").await;
        let usdt = balances.iter().find(|b| b.asset == "USDT").unwrap();
        assert_eq!(usdt.total(), dec!(250.5));
    }

    #[tokio::test]
    async fn test_demo_credit_applied_once() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = WalletLedger::new(store, dec!(10000));
        assert_eq!(ledger.available("newuser", "USDT").await, dec!(10000));
        // touching the account again does not re-credit
        assert_eq!(ledger.available("newuser", "USDT").await, dec!(10000));
    }
}
