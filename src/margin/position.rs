//! Position manager.
//!
//! Owns every leveraged position. One async mutex per position gives each
//! its own unit of work; the map of positions is only locked to look up or
//! insert handles. The liquidation engine reduces positions exclusively
//! through `liquidation_reduce`.
//!
//! Wallet coupling: a position's `margin` stays in the owner's locked
//! balance for its whole life. Opening/increasing attributes locked funds
//! to the position; reducing/closing releases the proportional share plus
//! realised PnL back to the available balance.

use crate::error::{EngineError, EngineResult};
use crate::feeds::aggregator::PriceAggregator;
use crate::margin::calculator::{
    self, bankruptcy_price, default_tiers, initial_margin, liquidation_price, maintenance_margin,
    tier_for, unrealised_pnl, LeverageTier,
};
use crate::models::{
    MarginMode, Position, PositionSide, PositionStatus, Price, Qty, Side, SymbolInfo,
    WsServerEvent,
};
use crate::storage::db::Store;
use crate::storage::wallet::WalletLedger;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

/// Outcome of folding one reducing fill into a position.
#[derive(Debug, Clone)]
pub struct ReduceOutcome {
    pub closed_qty: Qty,
    pub realised_pnl: Decimal,
    pub margin_released: Decimal,
    pub fully_closed: bool,
    /// Quantity left over after the position hit zero (flips to a new
    /// position on the opposite side).
    pub flip_qty: Qty,
}

pub struct PositionManager {
    store: Arc<Store>,
    wallets: Arc<WalletLedger>,
    positions: RwLock<HashMap<String, Arc<Mutex<Position>>>>,
    by_user_symbol: RwLock<HashMap<(String, String), String>>,
    tiers: RwLock<HashMap<String, Vec<LeverageTier>>>,
    events: broadcast::Sender<WsServerEvent>,
    ids: Arc<crate::engine::ids::IdGen>,
    liquidation_fee_rate: Decimal,
}

impl PositionManager {
    pub fn new(
        store: Arc<Store>,
        wallets: Arc<WalletLedger>,
        events: broadcast::Sender<WsServerEvent>,
        ids: Arc<crate::engine::ids::IdGen>,
        liquidation_fee_rate: Decimal,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            wallets,
            positions: RwLock::new(HashMap::new()),
            by_user_symbol: RwLock::new(HashMap::new()),
            tiers: RwLock::new(HashMap::new()),
            events,
            ids,
            liquidation_fee_rate,
        })
    }

    /// Rehydrate open positions at boot.
    pub fn load(&self) -> anyhow::Result<usize> {
        let open = self.store.load_open_positions()?;
        let mut positions = self.positions.write();
        let mut index = self.by_user_symbol.write();
        for p in open {
            index.insert(
                (p.user_id.clone(), p.symbol.clone()),
                p.position_id.clone(),
            );
            positions.insert(p.position_id.clone(), Arc::new(Mutex::new(p)));
        }
        Ok(positions.len())
    }

    // ------------------------------------------------------------------
    // Leverage tiers
    // ------------------------------------------------------------------

    pub fn tiers_for(&self, symbol: &str) -> Vec<LeverageTier> {
        self.tiers
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(default_tiers)
    }

    pub fn set_tiers(&self, symbol: &str, tiers: Vec<LeverageTier>) -> EngineResult<()> {
        if tiers.is_empty() {
            return Err(EngineError::validation("tier table cannot be empty"));
        }
        for pair in tiers.windows(2) {
            if pair[0].max_notional != pair[1].min_notional {
                return Err(EngineError::validation("tier table has gaps"));
            }
        }
        self.tiers.write().insert(symbol.to_string(), tiers);
        Ok(())
    }

    pub fn max_leverage(&self, symbol: &str, notional: Decimal) -> u32 {
        tier_for(&self.tiers_for(symbol), notional).max_leverage
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn handle(&self, position_id: &str) -> Option<Arc<Mutex<Position>>> {
        self.positions.read().get(position_id).cloned()
    }

    pub fn find_for(&self, user_id: &str, symbol: &str) -> Option<Arc<Mutex<Position>>> {
        let id = self
            .by_user_symbol
            .read()
            .get(&(user_id.to_string(), symbol.to_string()))
            .cloned()?;
        self.handle(&id)
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        let handles: Vec<Arc<Mutex<Position>>> =
            self.positions.read().values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let p = handle.lock().await;
            if p.status != PositionStatus::Closed && p.status != PositionStatus::Liquidated {
                out.push(p.clone());
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Fill application
    // ------------------------------------------------------------------

    /// Fold one leveraged fill into the user's position on the symbol:
    /// opens, increases, reduces, or flips. Returns the updated (or new)
    /// position snapshot.
    pub async fn apply_fill(
        &self,
        user_id: &str,
        info: &SymbolInfo,
        order_side: Side,
        qty: Qty,
        price: Price,
        leverage: u32,
        mode: MarginMode,
    ) -> EngineResult<Position> {
        if let Some(handle) = self.find_for(user_id, &info.symbol) {
            let mut position = handle.lock().await;
            if position.status == PositionStatus::Open
                || position.status == PositionStatus::Liquidating
            {
                if order_side == position.side.entry_order_side() {
                    self.increase(&mut position, qty, price).await?;
                    return Ok(position.clone());
                }
                let outcome = self.reduce_locked(&mut position, qty, price, false).await?;
                if outcome.flip_qty > Decimal::ZERO {
                    drop(position);
                    return self
                        .open(user_id, info, order_side, outcome.flip_qty, price, leverage, mode)
                        .await;
                }
                return Ok(position.clone());
            }
        }
        self.open(user_id, info, order_side, qty, price, leverage, mode)
            .await
    }

    async fn open(
        &self,
        user_id: &str,
        info: &SymbolInfo,
        order_side: Side,
        qty: Qty,
        price: Price,
        leverage: u32,
        mode: MarginMode,
    ) -> EngineResult<Position> {
        let side = match order_side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        };
        let notional = qty * price;
        let tiers = self.tiers_for(&info.symbol);
        let tier = tier_for(&tiers, notional);
        if leverage > tier.max_leverage {
            return Err(EngineError::validation(format!(
                "leverage {}x exceeds tier cap {}x at notional {}",
                leverage, tier.max_leverage, notional
            )));
        }

        let margin = initial_margin(notional, leverage);
        let maintenance = maintenance_margin(notional, tier);
        let now = Utc::now();
        let position = Position {
            position_id: self.ids.next("POS"),
            user_id: user_id.to_string(),
            symbol: info.symbol.clone(),
            side,
            status: PositionStatus::Open,
            margin_mode: mode,
            quantity: qty,
            entry_price: price,
            mark_price: price,
            liquidation_price: liquidation_price(
                side,
                price,
                leverage,
                tier.maintenance_rate,
                self.liquidation_fee_rate,
            ),
            bankruptcy_price: bankruptcy_price(side, price, leverage),
            leverage,
            margin,
            maintenance_margin: maintenance,
            margin_ratio: calculator::margin_ratio(maintenance, margin, Decimal::ZERO),
            isolated_margin: (mode == MarginMode::Isolated).then_some(margin),
            unrealised_pnl: Decimal::ZERO,
            realised_pnl: Decimal::ZERO,
            risk_level: calculator::risk_level(calculator::margin_ratio(
                maintenance,
                margin,
                Decimal::ZERO,
            )),
            opened_at: now,
            updated_at: now,
            closed_at: None,
        };

        self.persist(&position)?;
        self.positions.write().insert(
            position.position_id.clone(),
            Arc::new(Mutex::new(position.clone())),
        );
        self.by_user_symbol.write().insert(
            (user_id.to_string(), info.symbol.clone()),
            position.position_id.clone(),
        );
        info!(
            position_id = %position.position_id,
            user_id,
            symbol = %info.symbol,
            side = side.as_str(),
            qty = %qty,
            leverage,
            "position opened"
        );
        self.broadcast(&position);
        Ok(position)
    }

    async fn increase(&self, position: &mut Position, qty: Qty, price: Price) -> EngineResult<()> {
        let new_qty = position.quantity + qty;
        position.entry_price =
            (position.quantity * position.entry_price + qty * price) / new_qty;
        position.quantity = new_qty;
        position.margin += initial_margin(qty * price, position.leverage);
        if let Some(iso) = position.isolated_margin.as_mut() {
            *iso = position.margin;
        }
        self.revalue(position, price);
        self.persist(position)?;
        self.broadcast(position);
        Ok(())
    }

    async fn reduce_locked(
        &self,
        position: &mut Position,
        qty: Qty,
        price: Price,
        liquidation: bool,
    ) -> EngineResult<ReduceOutcome> {
        let closed_qty = qty.min(position.quantity);
        let flip_qty = qty - closed_qty;
        let share = closed_qty / position.quantity;
        let margin_released = position.margin * share;
        let pnl = unrealised_pnl(position.side, position.entry_price, price, closed_qty);

        position.quantity -= closed_qty;
        position.margin -= margin_released;
        if let Some(iso) = position.isolated_margin.as_mut() {
            *iso = position.margin;
        }
        position.realised_pnl += pnl;
        position.updated_at = Utc::now();

        let fully_closed = position.quantity == Decimal::ZERO;
        if fully_closed {
            position.status = if liquidation {
                PositionStatus::Liquidated
            } else {
                PositionStatus::Closed
            };
            position.closed_at = Some(Utc::now());
            position.unrealised_pnl = Decimal::ZERO;
        } else {
            self.revalue(position, price);
        }

        // Releasing margin and settling PnL is one logical step with the
        // status transition; wallet failure aborts the whole reduction.
        if !liquidation {
            self.wallets
                .release(&position.user_id, "USDT", margin_released)
                .await?;
            if pnl > Decimal::ZERO {
                self.wallets.credit(&position.user_id, "USDT", pnl).await?;
            } else if pnl < Decimal::ZERO {
                self.wallets
                    .debit_available(&position.user_id, "USDT", -pnl)
                    .await?;
            }
        }

        self.persist(position)?;
        if fully_closed {
            self.store
                .insert_position_history(position)
                .map_err(|e| EngineError::internal(format!("position history: {e}")))?;
            self.forget(position);
        }
        self.broadcast(position);

        Ok(ReduceOutcome {
            closed_qty,
            realised_pnl: pnl,
            margin_released,
            fully_closed,
            flip_qty,
        })
    }

    /// Liquidation path: reduce without touching the user's wallet; the
    /// liquidation engine settles margin, loss, and fee against the
    /// insurance fund.
    pub async fn liquidation_reduce(
        &self,
        position_id: &str,
        qty: Qty,
        exec_price: Price,
    ) -> EngineResult<ReduceOutcome> {
        let handle = self
            .handle(position_id)
            .ok_or_else(|| EngineError::not_found("position", position_id))?;
        let mut position = handle.lock().await;
        self.reduce_locked(&mut position, qty, exec_price, true).await
    }

    pub async fn set_status(&self, position_id: &str, status: PositionStatus) -> EngineResult<()> {
        let handle = self
            .handle(position_id)
            .ok_or_else(|| EngineError::not_found("position", position_id))?;
        let mut position = handle.lock().await;
        position.status = status;
        position.updated_at = Utc::now();
        self.persist(&position)?;
        self.broadcast(&position);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Margin & leverage adjustments
    // ------------------------------------------------------------------

    pub async fn add_margin(&self, position_id: &str, amount: Decimal) -> EngineResult<Position> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::validation("margin amount must be positive"));
        }
        let handle = self
            .handle(position_id)
            .ok_or_else(|| EngineError::not_found("position", position_id))?;
        let mut position = handle.lock().await;
        if position.margin_mode != MarginMode::Isolated {
            return Err(EngineError::conflict(
                "margin can only be added to isolated positions",
            ));
        }
        self.wallets
            .reserve(&position.user_id, "USDT", amount)
            .await?;
        position.margin += amount;
        position.isolated_margin = Some(position.margin);
        let mark = position.mark_price;
        self.revalue(&mut position, mark);
        self.persist(&position)?;
        self.broadcast(&position);
        Ok(position.clone())
    }

    pub async fn remove_margin(&self, position_id: &str, amount: Decimal) -> EngineResult<Position> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::validation("margin amount must be positive"));
        }
        let handle = self
            .handle(position_id)
            .ok_or_else(|| EngineError::not_found("position", position_id))?;
        let mut position = handle.lock().await;
        if position.margin_mode != MarginMode::Isolated {
            return Err(EngineError::conflict(
                "margin can only be removed from isolated positions",
            ));
        }
        // never below the leverage-implied minimum
        let floor = initial_margin(position.quantity * position.entry_price, position.leverage);
        if position.margin - amount < floor {
            return Err(EngineError::validation(format!(
                "removal would drop margin below minimum {floor}"
            )));
        }
        self.wallets
            .release(&position.user_id, "USDT", amount)
            .await?;
        position.margin -= amount;
        position.isolated_margin = Some(position.margin);
        let mark = position.mark_price;
        self.revalue(&mut position, mark);
        self.persist(&position)?;
        self.broadcast(&position);
        Ok(position.clone())
    }

    pub async fn adjust_leverage(
        &self,
        position_id: &str,
        new_leverage: u32,
    ) -> EngineResult<Position> {
        if new_leverage == 0 {
            return Err(EngineError::validation("leverage must be at least 1x"));
        }
        let handle = self
            .handle(position_id)
            .ok_or_else(|| EngineError::not_found("position", position_id))?;
        let mut position = handle.lock().await;

        let notional = position.quantity * position.entry_price;
        let tiers = self.tiers_for(&position.symbol);
        let tier = tier_for(&tiers, notional);
        if new_leverage > tier.max_leverage {
            return Err(EngineError::validation(format!(
                "leverage {}x exceeds tier cap {}x",
                new_leverage, tier.max_leverage
            )));
        }

        let target_margin = initial_margin(notional, new_leverage);
        let delta = target_margin - position.margin;
        if delta > Decimal::ZERO {
            self.wallets
                .reserve(&position.user_id, "USDT", delta)
                .await?;
        } else if delta < Decimal::ZERO {
            self.wallets
                .release(&position.user_id, "USDT", -delta)
                .await?;
        }

        position.leverage = new_leverage;
        position.margin = target_margin;
        if let Some(iso) = position.isolated_margin.as_mut() {
            *iso = target_margin;
        }
        position.liquidation_price = liquidation_price(
            position.side,
            position.entry_price,
            new_leverage,
            tier.maintenance_rate,
            self.liquidation_fee_rate,
        );
        position.bankruptcy_price =
            bankruptcy_price(position.side, position.entry_price, new_leverage);
        let mark = position.mark_price;
        self.revalue(&mut position, mark);
        self.persist(&position)?;
        self.broadcast(&position);
        Ok(position.clone())
    }

    pub async fn switch_mode(&self, position_id: &str, mode: MarginMode) -> EngineResult<Position> {
        let handle = self
            .handle(position_id)
            .ok_or_else(|| EngineError::not_found("position", position_id))?;
        let mut position = handle.lock().await;
        if position.margin_mode == mode {
            return Err(EngineError::conflict(format!(
                "position already in {} mode",
                mode.as_str()
            )));
        }
        match mode {
            MarginMode::Isolated => {
                // the earmark is the current margin; it must be covered by
                // equity or the switch would under-collateralise
                if position.equity() < position.margin {
                    return Err(EngineError::validation(
                        "insufficient equity to earmark isolated margin",
                    ));
                }
                position.isolated_margin = Some(position.margin);
            }
            MarginMode::Cross => {
                position.isolated_margin = None;
            }
        }
        position.margin_mode = mode;
        position.updated_at = Utc::now();
        self.persist(&position)?;
        self.broadcast(&position);
        Ok(position.clone())
    }

    // ------------------------------------------------------------------
    // Mark refresh
    // ------------------------------------------------------------------

    fn revalue(&self, position: &mut Position, mark: Price) {
        position.mark_price = mark;
        position.unrealised_pnl =
            unrealised_pnl(position.side, position.entry_price, mark, position.quantity);
        let notional = position.quantity * mark;
        let tiers = self.tiers_for(&position.symbol);
        let tier = tier_for(&tiers, notional);
        position.maintenance_margin = maintenance_margin(notional, tier);
        position.margin_ratio = calculator::margin_ratio(
            position.maintenance_margin,
            position.margin,
            position.unrealised_pnl,
        );
        position.risk_level = calculator::risk_level(position.margin_ratio);
        position.updated_at = Utc::now();
    }

    /// Periodic mark-to-market over every open position.
    pub fn spawn_mark_refresh(self: &Arc<Self>, agg: Arc<PriceAggregator>, cadence: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cadence);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = manager.refresh_marks(&agg).await {
                    error!(error = %e, "mark refresh pass failed");
                }
            }
        });
    }

    pub async fn refresh_marks(&self, agg: &PriceAggregator) -> EngineResult<()> {
        let handles: Vec<Arc<Mutex<Position>>> =
            self.positions.read().values().cloned().collect();
        for handle in handles {
            let mut position = handle.lock().await;
            if position.status != PositionStatus::Open
                && position.status != PositionStatus::Liquidating
            {
                continue;
            }
            let Some(mark) = agg.mark(&position.symbol) else {
                continue;
            };
            if mark == position.mark_price {
                continue;
            }
            let prev_risk = position.risk_level;
            self.revalue(&mut position, mark);
            if let Err(e) = self.persist(&position) {
                warn!(position_id = %position.position_id, error = %e, "mark persist failed");
                continue;
            }
            if prev_risk != position.risk_level {
                info!(
                    position_id = %position.position_id,
                    risk = position.risk_level.as_str(),
                    ratio = %position.margin_ratio,
                    "position risk level changed"
                );
            }
            self.broadcast(&position);
        }
        Ok(())
    }

    // ------------------------------------------------------------------

    fn persist(&self, position: &Position) -> EngineResult<()> {
        self.store
            .upsert_position(position)
            .map_err(|e| EngineError::internal(format!("position persist: {e}")))
    }

    fn forget(&self, position: &Position) {
        self.positions.write().remove(&position.position_id);
        self.by_user_symbol
            .write()
            .remove(&(position.user_id.clone(), position.symbol.clone()));
    }

    fn broadcast(&self, position: &Position) {
        let _ = self
            .events
            .send(WsServerEvent::PositionUpdate(position.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ids::IdGen;
    use rust_decimal_macros::dec;

    fn btc_info() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            tick_size: dec!(0.01),
            step_size: dec!(0.00001),
            min_notional: dec!(10),
            enabled_sources: vec!["binance".into()],
            rank: 1,
            enabled: true,
        }
    }

    async fn manager_with_funds(user: &str, amount: Decimal) -> (Arc<PositionManager>, Arc<WalletLedger>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let wallets = Arc::new(WalletLedger::new(store.clone(), Decimal::ZERO));
        wallets.credit(user, "USDT", amount).await.unwrap();
        let (events, _) = broadcast::channel(256);
        let manager = PositionManager::new(
            store,
            wallets.clone(),
            events,
            Arc::new(IdGen::new()),
            dec!(0.005),
        );
        (manager, wallets)
    }

    /// Reserve margin the way the order controller does before a fill.
    async fn reserve_margin(wallets: &WalletLedger, user: &str, notional: Decimal, leverage: u32) {
        wallets
            .reserve(user, "USDT", notional / Decimal::from(leverage))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_long_position() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(1000), 10).await;

        let p = manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        assert_eq!(p.side, PositionSide::Long);
        assert_eq!(p.quantity, dec!(10));
        assert_eq!(p.entry_price, dec!(100));
        assert_eq!(p.margin, dec!(100));
        assert_eq!(p.bankruptcy_price, dec!(90));
        assert!(p.liquidation_price > p.bankruptcy_price);
        assert_eq!(p.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_increase_averages_entry() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(3000), 10).await;

        manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        let p = manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(110), 10, MarginMode::Cross)
            .await
            .unwrap();
        assert_eq!(p.quantity, dec!(20));
        assert_eq!(p.entry_price, dec!(105));
        // margin accrues per fill notional
        assert_eq!(p.margin, dec!(100) + dec!(110));
    }

    #[tokio::test]
    async fn test_reduce_realises_pnl_and_releases_margin() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(1000), 10).await;

        manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        let available_before = wallets.available("u1", "USDT").await;

        // close half at 110: pnl = +50, margin release = 50
        let p = manager
            .apply_fill("u1", &btc_info(), Side::Sell, dec!(5), dec!(110), 10, MarginMode::Cross)
            .await
            .unwrap();
        assert_eq!(p.quantity, dec!(5));
        assert_eq!(p.realised_pnl, dec!(50));
        assert_eq!(p.margin, dec!(50));
        let available_after = wallets.available("u1", "USDT").await;
        assert_eq!(available_after - available_before, dec!(100)); // 50 margin + 50 pnl
    }

    #[tokio::test]
    async fn test_full_close_records_history() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(1000), 10).await;

        manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        let p = manager
            .apply_fill("u1", &btc_info(), Side::Sell, dec!(10), dec!(90), 10, MarginMode::Cross)
            .await
            .unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.realised_pnl, dec!(-100));
        assert!(manager.find_for("u1", "BTCUSDT").is_none());
        // closed positions leave the open set
        assert!(manager.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_flip_opens_opposite_position() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(2500), 10).await;

        manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        let p = manager
            .apply_fill("u1", &btc_info(), Side::Sell, dec!(15), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.quantity, dec!(5));
    }

    #[tokio::test]
    async fn test_leverage_cap_by_tier() {
        let (manager, wallets) = manager_with_funds("u1", dec!(100000000)).await;
        reserve_margin(&wallets, "u1", dec!(6000000), 10).await;
        // 6M notional lands in tier 5 (max 10x); 50x must be rejected
        let err = manager
            .apply_fill(
                "u1",
                &btc_info(),
                Side::Buy,
                dec!(60),
                dec!(100000),
                50,
                MarginMode::Cross,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_add_remove_margin_isolated_only() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(1000), 10).await;

        let p = manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        let err = manager.add_margin(&p.position_id, dec!(50)).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let p = manager
            .switch_mode(&p.position_id, MarginMode::Isolated)
            .await
            .unwrap();
        let p = manager.add_margin(&p.position_id, dec!(50)).await.unwrap();
        assert_eq!(p.margin, dec!(150));
        assert_eq!(p.isolated_margin, Some(dec!(150)));

        // cannot drop below initial-margin floor (1000/10 = 100)
        let err = manager
            .remove_margin(&p.position_id, dec!(60))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let p = manager.remove_margin(&p.position_id, dec!(50)).await.unwrap();
        assert_eq!(p.margin, dec!(100));
    }

    #[tokio::test]
    async fn test_adjust_leverage_moves_margin() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(1000), 10).await;

        let p = manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        assert_eq!(p.margin, dec!(100));

        // deleverage to 5x doubles the margin requirement
        let p = manager.adjust_leverage(&p.position_id, 5).await.unwrap();
        assert_eq!(p.margin, dec!(200));
        assert_eq!(p.leverage, 5);
        assert_eq!(p.bankruptcy_price, dec!(80));

        // releverage to 20x releases margin
        let p = manager.adjust_leverage(&p.position_id, 20).await.unwrap();
        assert_eq!(p.margin, dec!(50));
    }

    #[tokio::test]
    async fn test_liquidation_reduce_skips_wallet() {
        let (manager, wallets) = manager_with_funds("u1", dec!(10000)).await;
        reserve_margin(&wallets, "u1", dec!(1000), 10).await;

        let p = manager
            .apply_fill("u1", &btc_info(), Side::Buy, dec!(10), dec!(100), 10, MarginMode::Cross)
            .await
            .unwrap();
        let available_before = wallets.available("u1", "USDT").await;

        let outcome = manager
            .liquidation_reduce(&p.position_id, dec!(5), dec!(92))
            .await
            .unwrap();
        assert_eq!(outcome.closed_qty, dec!(5));
        assert_eq!(outcome.realised_pnl, dec!(-40));
        assert_eq!(outcome.margin_released, dec!(50));
        assert!(!outcome.fully_closed);
        // wallet untouched by the liquidation path
        assert_eq!(wallets.available("u1", "USDT").await, available_before);
    }
}
