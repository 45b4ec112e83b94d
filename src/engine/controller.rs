//! Order controller.
//!
//! Single entry point for user order intent. Each placement is one logical
//! unit of work: validate, allocate an id, reserve balance, persist, route,
//! settle fills, commit. Any failure unwinds the reservation and leaves no
//! trace beyond the rejection event.
//!
//! Settlement model: spot orders move base/quote between wallets with fees
//! taken from the received asset. Leveraged orders are margin orders: the
//! reservation is quote margin (`notional / leverage`), fills flow into the
//! position manager, and fees are charged in quote.

use crate::engine::ids::IdGen;
use crate::engine::matching::{MatchOutcome, MakerFill};
use crate::engine::triggers::TriggerMonitor;
use crate::engine::worker::MatchingRouter;
use crate::error::{EngineError, EngineResult};
use crate::feeds::aggregator::PriceAggregator;
use crate::margin::position::PositionManager;
use crate::markets::registry::SymbolRegistry;
use crate::models::{
    Fill, MarginMode, Order, OrderFlags, OrderStatus, OrderType, Price, Qty, Side, SymbolInfo,
    TimeInForce, Trade, TrailingState, WsServerEvent,
};
use crate::storage::db::Store;
use crate::storage::wallet::WalletLedger;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const TRADE_RING_CAPACITY: usize = 1_000;

/// Interface for the (out-of-scope) candle aggregation job: it observes
/// every trade the engine prints.
pub trait CandleSink: Send + Sync {
    fn on_trade(&self, trade: &Trade);
}

/// User order intent, before validation.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub stop_price: Option<Price>,
    pub quantity: Qty,
    pub time_in_force: TimeInForce,
    pub flags: OrderFlags,
    pub leverage: Option<u32>,
    pub margin_mode: Option<MarginMode>,
    /// Trailing parameters, required for trailing stops.
    pub callback_rate: Option<Decimal>,
    pub abs_offset: Option<Decimal>,
    pub activation_price: Option<Price>,
}

impl PlaceOrder {
    pub fn limit(user_id: &str, symbol: &str, side: Side, price: Price, qty: Qty) -> Self {
        Self {
            user_id: user_id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            stop_price: None,
            quantity: qty,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::default(),
            leverage: None,
            margin_mode: None,
            callback_rate: None,
            abs_offset: None,
            activation_price: None,
        }
    }

    pub fn market(user_id: &str, symbol: &str, side: Side, qty: Qty) -> Self {
        Self {
            order_type: OrderType::Market,
            price: None,
            ..Self::limit(user_id, symbol, side, Decimal::ZERO, qty)
        }
    }

    pub fn with_leverage(mut self, leverage: u32, mode: MarginMode) -> Self {
        self.leverage = Some(leverage);
        self.margin_mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    asset: String,
    remaining: Decimal,
}

pub struct OrderController {
    registry: Arc<SymbolRegistry>,
    router: Arc<MatchingRouter>,
    wallets: Arc<WalletLedger>,
    positions: Arc<PositionManager>,
    triggers: Arc<TriggerMonitor>,
    agg: Arc<PriceAggregator>,
    store: Arc<Store>,
    events: broadcast::Sender<WsServerEvent>,
    ids: Arc<IdGen>,
    maker_rate: Decimal,
    taker_rate: Decimal,
    orders: RwLock<HashMap<String, Order>>,
    reservations: RwLock<HashMap<String, Reservation>>,
    recent_trades: RwLock<HashMap<String, VecDeque<Trade>>>,
    candle_sinks: RwLock<Vec<Arc<dyn CandleSink>>>,
    maintenance: AtomicBool,
}

impl OrderController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SymbolRegistry>,
        router: Arc<MatchingRouter>,
        wallets: Arc<WalletLedger>,
        positions: Arc<PositionManager>,
        triggers: Arc<TriggerMonitor>,
        agg: Arc<PriceAggregator>,
        store: Arc<Store>,
        events: broadcast::Sender<WsServerEvent>,
        ids: Arc<IdGen>,
        maker_rate: Decimal,
        taker_rate: Decimal,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            router,
            wallets,
            positions,
            triggers,
            agg,
            store,
            events,
            ids,
            maker_rate,
            taker_rate,
            orders: RwLock::new(HashMap::new()),
            reservations: RwLock::new(HashMap::new()),
            recent_trades: RwLock::new(HashMap::new()),
            candle_sinks: RwLock::new(Vec::new()),
            maintenance: AtomicBool::new(false),
        })
    }

    /// Rehydrate open orders from the store at boot: resting limits go back
    /// onto their books, triggerables re-arm, and reservations are rebuilt
    /// from remaining quantities (the wallet's locked balances survived the
    /// restart on their own).
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        let open = self
            .store
            .load_open_orders()
            .map_err(|e| anyhow::anyhow!("load open orders: {e}"))?;
        let mut restored = 0usize;
        for order in open {
            let Some(info) = self.registry.get(&order.symbol) else {
                warn!(order_id = %order.order_id, symbol = %order.symbol, "orphan order: market unknown");
                continue;
            };

            if !order.flags.reduce_only {
                let (asset, amount) = if let Some(leverage) = order.leverage {
                    let reference = order.price.or(order.stop_price).unwrap_or(Decimal::ZERO);
                    (
                        info.quote.clone(),
                        order.remaining * reference / Decimal::from(leverage),
                    )
                } else if order.side == Side::Buy {
                    let reference = order.price.or(order.stop_price).unwrap_or(Decimal::ZERO);
                    (
                        info.quote.clone(),
                        order.remaining * reference * (Decimal::ONE + self.taker_rate),
                    )
                } else {
                    (info.base.clone(), order.remaining)
                };
                if amount > Decimal::ZERO {
                    self.reservations.write().insert(
                        order.order_id.clone(),
                        Reservation {
                            asset,
                            remaining: amount,
                        },
                    );
                }
            }

            self.orders
                .write()
                .insert(order.order_id.clone(), order.clone());

            if order.order_type.is_triggerable() && order.triggered_at.is_none() {
                if let Err(e) = self.triggers.arm(&order) {
                    warn!(order_id = %order.order_id, error = %e, "re-arm failed");
                    continue;
                }
            } else if order.order_type == OrderType::Limit && order.remaining > Decimal::ZERO {
                let handle = self.router.get(&order.symbol)?;
                let outcome = handle.submit(order.clone()).await?;
                self.apply_outcome(outcome, &info).await.ok();
            }
            restored += 1;
        }
        info!(restored, "open orders rehydrated");
        Ok(restored)
    }

    pub fn register_candle_sink(&self, sink: Arc<dyn CandleSink>) {
        self.candle_sinks.write().push(sink);
    }

    pub fn set_maintenance(&self, enabled: bool) {
        self.maintenance.store(enabled, Ordering::SeqCst);
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    /// Visible depth as `(price, quantity)` rows, best first.
    pub async fn depth(
        &self,
        symbol: &str,
        levels: usize,
    ) -> EngineResult<(Vec<(Price, Qty)>, Vec<(Price, Qty)>)> {
        let handle = self.router.get(symbol)?;
        let (bids, asks) = handle.depth(levels).await?;
        let flatten = |rows: Vec<crate::book::DepthLevel>| {
            rows.into_iter().map(|l| (l.price, l.quantity)).collect()
        };
        Ok((flatten(bids), flatten(asks)))
    }

    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Vec<Trade> {
        self.recent_trades
            .read()
            .get(symbol)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    // ==================================================================
    // Placement
    // ==================================================================

    pub async fn place(&self, req: PlaceOrder) -> EngineResult<Order> {
        if self.in_maintenance() {
            return Err(self.reject_event(&req, EngineError::MarketHalted("maintenance".into())));
        }

        let info = match self.validate(&req).await {
            Ok(info) => info,
            Err(e) => return Err(self.reject_event(&req, e)),
        };

        let order = self.build_order(&req);

        match self.place_inner(order.clone(), &req, &info).await {
            Ok(order) => Ok(order),
            Err(e) => {
                // abort: release the reservation, drop the order, emit the
                // rejection
                self.release_reservation(&order.order_id).await;
                self.orders.write().remove(&order.order_id);
                if let Err(db) = self.store.delete_order(&order.order_id) {
                    warn!(order_id = %order.order_id, error = %db, "order delete failed");
                }
                Err(self.reject_event(&req, e))
            }
        }
    }

    async fn place_inner(
        &self,
        mut order: Order,
        req: &PlaceOrder,
        info: &SymbolInfo,
    ) -> EngineResult<Order> {
        // the in-memory record goes in first so the undo path can always
        // find the order to release its reservation
        self.orders
            .write()
            .insert(order.order_id.clone(), order.clone());
        self.reserve_for(&order, info).await?;
        self.persist(&order)?;

        if order.order_type.is_triggerable() {
            self.triggers.arm(&order)?;
            self.emit_order(&order);
            metrics::counter!("orders_armed_total", 1);
            return Ok(order);
        }

        let handle = self.router.get(&info.symbol)?;
        let outcome = handle.submit(order.clone()).await?;
        order = self.apply_outcome(outcome, info).await?;
        metrics::counter!("orders_placed_total", 1);
        Ok(order)
    }

    /// Place two linked legs; fill or cancellation of either cancels the
    /// other. Legs are validated before either is placed so a bad pair
    /// never half-executes.
    pub async fn place_oco(&self, first: PlaceOrder, second: PlaceOrder) -> EngineResult<(Order, Order)> {
        if self.in_maintenance() {
            return Err(EngineError::MarketHalted("maintenance".into()));
        }
        if first.user_id != second.user_id || first.symbol != second.symbol {
            return Err(EngineError::validation("OCO legs must share user and symbol"));
        }
        self.validate(&first).await?;
        self.validate(&second).await?;

        let mut leg_a = self.build_order(&first);
        let mut leg_b = self.build_order(&second);
        leg_a.oco_linked_id = Some(leg_b.order_id.clone());
        leg_b.oco_linked_id = Some(leg_a.order_id.clone());

        let info = self
            .registry
            .get(&first.symbol)
            .ok_or_else(|| EngineError::not_found("market", &first.symbol))?;

        let placed_a = self.place_inner(leg_a, &first, &info).await?;
        match self.place_inner(leg_b, &second, &info).await {
            Ok(placed_b) => Ok((placed_a, placed_b)),
            Err(e) => {
                // unwind the first leg so the pair is atomic
                let _ = self
                    .cancel(&placed_a.order_id, &first.user_id, "oco sibling failed")
                    .await;
                Err(e)
            }
        }
    }

    async fn validate(&self, req: &PlaceOrder) -> EngineResult<SymbolInfo> {
        let info = self
            .registry
            .get(&req.symbol)
            .ok_or_else(|| EngineError::not_found("market", &req.symbol))?;
        if !info.enabled {
            return Err(EngineError::MarketHalted(req.symbol.clone()));
        }

        if req.quantity <= Decimal::ZERO {
            return Err(EngineError::validation("quantity must be positive"));
        }
        if info.step_size > Decimal::ZERO && req.quantity % info.step_size != Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "quantity {} not aligned to step size {}",
                req.quantity, info.step_size
            )));
        }

        if let Some(price) = req.price {
            if price <= Decimal::ZERO {
                return Err(EngineError::validation("price must be positive"));
            }
            if info.tick_size > Decimal::ZERO && price % info.tick_size != Decimal::ZERO {
                return Err(EngineError::validation(format!(
                    "price {} not aligned to tick size {}",
                    price, info.tick_size
                )));
            }
        }

        match req.order_type {
            OrderType::Limit | OrderType::StopLimit => {
                if req.price.is_none() {
                    return Err(EngineError::validation("limit order requires a price"));
                }
            }
            OrderType::Stop | OrderType::TakeProfit => {
                if req.stop_price.is_none() {
                    return Err(EngineError::validation("stop order requires a stop price"));
                }
            }
            OrderType::TrailingStop => {
                if req.callback_rate.is_none() && req.abs_offset.is_none() {
                    return Err(EngineError::validation(
                        "trailing stop requires a callback rate or offset",
                    ));
                }
            }
            OrderType::Market => {}
        }

        let reference = self.reference_price(req, &info).await;
        if let Some(price) = reference {
            let notional = price * req.quantity;
            if notional < info.min_notional {
                return Err(EngineError::validation(format!(
                    "notional {} below minimum {}",
                    notional, info.min_notional
                )));
            }
            if let Some(leverage) = req.leverage {
                let cap = self.positions.max_leverage(&req.symbol, notional);
                if leverage == 0 || leverage > cap {
                    return Err(EngineError::validation(format!(
                        "leverage {leverage}x outside 1..={cap}x for notional {notional}"
                    )));
                }
            }
        }

        Ok(info)
    }

    /// Price basis for notional/reservation checks: limit price when given,
    /// otherwise the touch, otherwise the mark.
    async fn reference_price(&self, req: &PlaceOrder, info: &SymbolInfo) -> Option<Price> {
        if let Some(price) = req.price {
            return Some(price);
        }
        if let Some(stop) = req.stop_price {
            return Some(stop);
        }
        if let Ok(handle) = self.router.get(&info.symbol) {
            if let Ok((bid, ask)) = handle.best_quote().await {
                let touch = match req.side {
                    Side::Buy => ask,
                    Side::Sell => bid,
                };
                if let Some(touch) = touch {
                    return Some(touch);
                }
            }
        }
        self.agg.mark(&info.symbol)
    }

    fn build_order(&self, req: &PlaceOrder) -> Order {
        let now = Utc::now();
        Order {
            order_id: self.ids.next("ORD"),
            user_id: req.user_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            price: req.price,
            stop_price: req.stop_price,
            quantity: req.quantity,
            filled: Decimal::ZERO,
            remaining: req.quantity,
            average_fill_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: OrderStatus::Pending,
            time_in_force: req.time_in_force,
            flags: req.flags,
            oco_linked_id: None,
            trailing: req
                .callback_rate
                .or(req.abs_offset)
                .is_some()
                .then(|| TrailingState {
                    activation_price: req.activation_price,
                    callback_rate: req.callback_rate,
                    abs_offset: req.abs_offset,
                    high_water_mark: Decimal::ZERO,
                    armed: req.activation_price.is_none(),
                }),
            leverage: req.leverage,
            margin_mode: req.margin_mode,
            created_at: now,
            updated_at: now,
            triggered_at: None,
        }
    }

    // ==================================================================
    // Reservation
    // ==================================================================

    async fn reserve_for(&self, order: &Order, info: &SymbolInfo) -> EngineResult<()> {
        if order.flags.reduce_only {
            return Ok(());
        }

        let reference = self
            .reference_price(
                &PlaceOrder {
                    user_id: order.user_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    order_type: order.order_type,
                    price: order.price,
                    stop_price: order.stop_price,
                    quantity: order.quantity,
                    time_in_force: order.time_in_force,
                    flags: order.flags,
                    leverage: order.leverage,
                    margin_mode: order.margin_mode,
                    callback_rate: None,
                    abs_offset: None,
                    activation_price: None,
                },
                info,
            )
            .await
            .ok_or_else(|| EngineError::validation("no reference price for reservation"))?;

        let (asset, amount) = if let Some(leverage) = order.leverage {
            // initial margin, quote-denominated, both sides
            (
                info.quote.clone(),
                order.quantity * reference / Decimal::from(leverage),
            )
        } else if order.side == Side::Buy {
            (
                info.quote.clone(),
                order.quantity * reference * (Decimal::ONE + self.taker_rate),
            )
        } else {
            (info.base.clone(), order.quantity)
        };

        self.wallet_event(
            &order.user_id,
            self.wallets.reserve(&order.user_id, &asset, amount).await?,
        );
        self.reservations.write().insert(
            order.order_id.clone(),
            Reservation {
                asset,
                remaining: amount,
            },
        );
        Ok(())
    }

    /// Consume part of an order's reservation without releasing it (the
    /// funds move on: spent on a fill or attributed to position margin).
    fn consume_reservation(&self, order_id: &str, amount: Decimal) -> Decimal {
        let mut reservations = self.reservations.write();
        match reservations.get_mut(order_id) {
            Some(r) => {
                let take = amount.min(r.remaining);
                r.remaining -= take;
                take
            }
            None => Decimal::ZERO,
        }
    }

    async fn release_reservation(&self, order_id: &str) {
        let reservation = self.reservations.write().remove(order_id);
        if let Some(r) = reservation {
            if r.remaining > Decimal::ZERO {
                if let Some(order) = self.get_order(order_id) {
                    match self.wallets.release(&order.user_id, &r.asset, r.remaining).await {
                        Ok(snapshot) => self.wallet_event(&order.user_id, snapshot),
                        Err(e) => warn!(order_id, error = %e, "reservation release failed"),
                    }
                }
            }
        }
    }

    /// Release the proportional share of a reservation after a partial
    /// cancel. Linear in the remaining quantity.
    async fn release_reservation_share(&self, order: &Order, cancelled_qty: Qty) {
        let share = {
            let mut reservations = self.reservations.write();
            match reservations.get_mut(&order.order_id) {
                Some(r) if order.quantity > Decimal::ZERO => {
                    let share = r.remaining * cancelled_qty
                        / (order.remaining + cancelled_qty).max(cancelled_qty);
                    r.remaining -= share;
                    Some((r.asset.clone(), share))
                }
                _ => None,
            }
        };
        if let Some((asset, amount)) = share {
            if amount > Decimal::ZERO {
                match self.wallets.release(&order.user_id, &asset, amount).await {
                    Ok(snapshot) => self.wallet_event(&order.user_id, snapshot),
                    Err(e) => warn!(order_id = %order.order_id, error = %e, "partial release failed"),
                }
            }
        }
    }

    // ==================================================================
    // Settlement
    // ==================================================================

    async fn apply_outcome(
        &self,
        outcome: MatchOutcome,
        info: &SymbolInfo,
    ) -> EngineResult<Order> {
        let mut taker = outcome.taker.clone();

        // settle STP-cancelled resting orders first so their funds free up
        // even when the incoming order itself ends up rejected
        for entry in &outcome.stp_cancelled {
            if let Some(mut resting) = self.get_order(&entry.order_id) {
                resting.status = OrderStatus::Cancelled;
                resting.remaining = entry.remaining_qty;
                resting.updated_at = Utc::now();
                self.release_reservation(&resting.order_id).await;
                self.persist(&resting)?;
                self.orders
                    .write()
                    .insert(resting.order_id.clone(), resting.clone());
                self.emit_order(&resting);
            }
        }

        if let Some(reason) = outcome.reject_reason {
            return Err(match reason {
                "rejected_no_liquidity" => EngineError::conflict(reason),
                other => EngineError::validation(other),
            });
        }

        // taker-side fills
        for fill in outcome.fills.iter().filter(|f| !f.is_maker) {
            self.settle_side(&mut taker, fill, info, self.taker_rate)
                .await?;
        }

        // maker-side fills
        for maker_fill in &outcome.maker_fills {
            self.settle_maker(maker_fill, &outcome.fills, info).await?;
        }

        for fill in &outcome.fills {
            self.persist_fill(fill);
        }

        // trades: persist, ring, candle sinks, fanout
        for trade in &outcome.trades {
            if let Err(e) = self.store.insert_trade(trade) {
                warn!(trade_id = %trade.trade_id, error = %e, "trade persist failed");
            }
            {
                let mut rings = self.recent_trades.write();
                let ring = rings.entry(trade.symbol.clone()).or_default();
                if ring.len() == TRADE_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(trade.clone());
            }
            for sink in self.candle_sinks.read().iter() {
                sink.on_trade(trade);
            }
            let _ = self.events.send(WsServerEvent::Trade(trade.clone()));
        }

        // order complete (filled / cancelled remainder): release leftovers
        if !taker.status.is_active() {
            self.release_reservation(&taker.order_id).await;
        }

        self.persist(&taker)?;
        self.orders
            .write()
            .insert(taker.order_id.clone(), taker.clone());
        self.emit_order(&taker);

        // OCO: any fill on one leg cancels the sibling
        if taker.filled > Decimal::ZERO {
            if let Some(sibling) = taker.oco_linked_id.clone() {
                let _ = self
                    .cancel(&sibling, &taker.user_id, "oco sibling filled")
                    .await;
            }
        }

        Ok(taker)
    }

    /// Wallet + position effects of one fill for the order on our side of
    /// the trade. `taker` here is the order object being settled (either
    /// side of the match); the engine already folded the fill into it when
    /// it is the aggressor, makers are folded here.
    async fn settle_side(
        &self,
        order: &mut Order,
        fill: &Fill,
        info: &SymbolInfo,
        fee_rate: Decimal,
    ) -> EngineResult<()> {
        let notional = fill.price * fill.quantity;

        if let Some(leverage) = order.leverage {
            // margin order: fee in quote, fills flow into the position
            let fee = notional * fee_rate;
            let reduces = match self.positions.find_for(&order.user_id, &info.symbol) {
                Some(handle) => {
                    let p = handle.lock().await;
                    order.side != p.side.entry_order_side() && p.quantity > Decimal::ZERO
                }
                None => false,
            };
            let margin_used = notional / Decimal::from(leverage);
            if reduces || order.flags.reduce_only {
                // margin was reserved but the fill reduces instead; hand the
                // surplus reservation back
                self.release_reservation_share(order, fill.quantity).await;
            } else {
                self.consume_reservation(&order.order_id, margin_used);
            }
            self.wallet_event(
                &order.user_id,
                self.wallets
                    .debit_available(&order.user_id, &info.quote, fee)
                    .await?,
            );
            self.positions
                .apply_fill(
                    &order.user_id,
                    info,
                    order.side,
                    fill.quantity,
                    fill.price,
                    order.leverage.unwrap_or(1),
                    order.margin_mode.unwrap_or(MarginMode::Cross),
                )
                .await?;
            return Ok(());
        }

        // spot settlement; fee comes out of the received asset
        match order.side {
            Side::Buy => {
                self.consume_reservation(&order.order_id, notional);
                self.wallets
                    .spend_locked(&order.user_id, &info.quote, notional)
                    .await?;
                let fee = fill.quantity * fee_rate;
                let snapshot = self
                    .wallets
                    .credit(&order.user_id, &info.base, fill.quantity - fee)
                    .await?;
                self.wallet_event(&order.user_id, snapshot);
            }
            Side::Sell => {
                self.consume_reservation(&order.order_id, fill.quantity);
                self.wallets
                    .spend_locked(&order.user_id, &info.base, fill.quantity)
                    .await?;
                let fee = notional * fee_rate;
                let snapshot = self
                    .wallets
                    .credit(&order.user_id, &info.quote, notional - fee)
                    .await?;
                self.wallet_event(&order.user_id, snapshot);
            }
        }
        Ok(())
    }

    async fn settle_maker(
        &self,
        maker_fill: &MakerFill,
        fills: &[Fill],
        info: &SymbolInfo,
    ) -> EngineResult<()> {
        let Some(mut maker) = self.get_order(&maker_fill.order_id) else {
            // liquidation counterparties and rehydrated books can have
            // entries without an in-memory order; settle blind is unsafe, so
            // log and skip
            warn!(order_id = %maker_fill.order_id, "maker fill without in-memory order");
            return Ok(());
        };

        maker.apply_fill(maker_fill.price, maker_fill.quantity, maker_fill.fee);

        let fill = fills
            .iter()
            .find(|f| f.is_maker && f.order_id == maker_fill.order_id && f.price == maker_fill.price)
            .cloned()
            .unwrap_or_else(|| Fill {
                fill_id: self.ids.next("FIL"),
                order_id: maker_fill.order_id.clone(),
                counter_order_id: String::new(),
                price: maker_fill.price,
                quantity: maker_fill.quantity,
                fee: maker_fill.fee,
                fee_asset: maker_fill.fee_asset.clone(),
                is_maker: true,
                ts: Utc::now(),
            });

        self.settle_side(&mut maker, &fill, info, self.maker_rate)
            .await?;

        if !maker.status.is_active() {
            self.release_reservation(&maker.order_id).await;
        }
        self.persist(&maker)?;
        self.orders
            .write()
            .insert(maker.order_id.clone(), maker.clone());
        self.emit_order(&maker);

        if maker.filled > Decimal::ZERO {
            if let Some(sibling) = maker.oco_linked_id.clone() {
                let _ = self
                    .cancel(&sibling, &maker.user_id, "oco sibling filled")
                    .await;
            }
        }
        Ok(())
    }

    // ==================================================================
    // Cancel / modify
    // ==================================================================

    pub async fn cancel(&self, order_id: &str, user_id: &str, reason: &str) -> EngineResult<Order> {
        let Some(mut order) = self.get_order(order_id) else {
            return Err(EngineError::not_found("order", order_id));
        };
        if order.user_id != user_id {
            return Err(EngineError::not_found("order", order_id));
        }
        if !order.status.is_active() {
            return Err(EngineError::conflict(format!(
                "order already {}",
                order.status.as_str()
            )));
        }

        if order.order_type.is_triggerable() && order.triggered_at.is_none() {
            self.triggers.disarm(order_id);
        } else if let Ok(handle) = self.router.get(&order.symbol) {
            // resting remainder comes off the book; a racing fill may have
            // emptied it already, which is fine
            let _ = handle.cancel(order_id).await?;
        }

        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        self.release_reservation(order_id).await;
        self.persist(&order)?;
        self.orders
            .write()
            .insert(order.order_id.clone(), order.clone());
        self.emit_order(&order);
        info!(order_id, user_id, reason, "order cancelled");

        // cascade to the OCO sibling
        if let Some(sibling) = order.oco_linked_id.clone() {
            if let Some(sib) = self.get_order(&sibling) {
                if sib.status.is_active() {
                    Box::pin(self.cancel(&sibling, user_id, "oco cascade")).await?;
                }
            }
        }

        Ok(order)
    }

    /// Modify price/quantity/stop of an open or pending order. Queue
    /// priority is forfeited on a book update.
    pub async fn modify(
        &self,
        order_id: &str,
        user_id: &str,
        price: Option<Price>,
        quantity: Option<Qty>,
        stop_price: Option<Price>,
    ) -> EngineResult<Order> {
        let Some(order) = self.get_order(order_id) else {
            return Err(EngineError::not_found("order", order_id));
        };
        if order.user_id != user_id {
            return Err(EngineError::not_found("order", order_id));
        }
        if !matches!(order.status, OrderStatus::Open | OrderStatus::Pending) {
            return Err(EngineError::conflict(format!(
                "cannot modify order in status {}",
                order.status.as_str()
            )));
        }
        if let Some(qty) = quantity {
            if qty < order.filled {
                return Err(EngineError::validation(
                    "cannot reduce quantity below filled amount",
                ));
            }
        }

        // modify = cancel + replace, keeping the same user intent
        let cancelled = self.cancel(order_id, user_id, "modify").await?;
        let req = PlaceOrder {
            user_id: cancelled.user_id.clone(),
            symbol: cancelled.symbol.clone(),
            side: cancelled.side,
            order_type: cancelled.order_type,
            price: price.or(cancelled.price),
            stop_price: stop_price.or(cancelled.stop_price),
            quantity: quantity.unwrap_or(cancelled.quantity) - cancelled.filled,
            time_in_force: cancelled.time_in_force,
            flags: cancelled.flags,
            leverage: cancelled.leverage,
            margin_mode: cancelled.margin_mode,
            callback_rate: cancelled.trailing.as_ref().and_then(|t| t.callback_rate),
            abs_offset: cancelled.trailing.as_ref().and_then(|t| t.abs_offset),
            activation_price: cancelled.trailing.as_ref().and_then(|t| t.activation_price),
        };
        self.place(req).await
    }

    /// Cancel every matching active order. Conflicts (already done orders)
    /// are counted as successes, per bulk-operation semantics.
    pub async fn cancel_all(&self, symbol: Option<&str>, user_id: Option<&str>) -> usize {
        let targets: Vec<Order> = {
            let orders = self.orders.read();
            orders
                .values()
                .filter(|o| o.status.is_active())
                .filter(|o| symbol.map_or(true, |s| o.symbol == s))
                .filter(|o| user_id.map_or(true, |u| o.user_id == u))
                .cloned()
                .collect()
        };
        let mut count = 0;
        for order in targets {
            match self.cancel(&order.order_id, &order.user_id, "cancel-all").await {
                Ok(_) => count += 1,
                Err(EngineError::Conflict(_)) => count += 1,
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "cancel-all entry failed");
                }
            }
        }
        count
    }

    // ==================================================================
    // Trigger firing
    // ==================================================================

    /// Convert a fired trigger into an executable order and run it through
    /// the matching path. Called by the trigger loop.
    pub async fn execute_triggered(&self, order_id: &str) -> EngineResult<Order> {
        let Some(mut order) = self.get_order(order_id) else {
            return Err(EngineError::not_found("order", order_id));
        };
        if !order.status.is_active() {
            return Err(EngineError::conflict("triggered order no longer active"));
        }

        order.order_type = match order.order_type {
            OrderType::StopLimit => OrderType::Limit,
            // stop / take-profit / trailing all fire as market orders
            _ => OrderType::Market,
        };
        if order.order_type == OrderType::Market {
            order.price = None;
        }
        order.triggered_at = Some(Utc::now());
        order.updated_at = Utc::now();

        // the sibling dies the moment this side fires
        if let Some(sibling) = order.oco_linked_id.clone() {
            if let Some(sib) = self.get_order(&sibling) {
                if sib.status.is_active() {
                    let _ = self.cancel(&sibling, &order.user_id, "oco sibling fired").await;
                }
            }
        }

        let info = self
            .registry
            .get(&order.symbol)
            .ok_or_else(|| EngineError::not_found("market", &order.symbol))?;
        self.orders
            .write()
            .insert(order.order_id.clone(), order.clone());

        let handle = self.router.get(&order.symbol)?;
        let outcome = handle.submit(order).await?;
        let order = self.apply_outcome(outcome, &info).await?;
        metrics::counter!("triggers_fired_total", 1);
        Ok(order)
    }

    // ==================================================================
    // Liquidation path
    // ==================================================================

    /// Submit a reducing market order for the liquidation engine. Bypasses
    /// validation and balance reservation; makers settle normally. Returns
    /// `(average exec price, filled quantity)`.
    pub async fn execute_liquidation_order(
        &self,
        user_id: &str,
        symbol: &str,
        side: Side,
        qty: Qty,
    ) -> EngineResult<(Price, Qty)> {
        let info = self
            .registry
            .get(symbol)
            .ok_or_else(|| EngineError::not_found("market", symbol))?;
        let handle = self.router.get(symbol)?;

        let now = Utc::now();
        let order = Order {
            order_id: self.ids.next("LIQ"),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            price: None,
            stop_price: None,
            quantity: qty,
            filled: Decimal::ZERO,
            remaining: qty,
            average_fill_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: OrderStatus::Pending,
            time_in_force: TimeInForce::Ioc,
            flags: OrderFlags {
                reduce_only: true,
                ..Default::default()
            },
            oco_linked_id: None,
            trailing: None,
            leverage: None,
            margin_mode: None,
            created_at: now,
            updated_at: now,
            triggered_at: None,
        };

        let outcome = handle.submit(order).await?;

        // the liquidated user's own resting orders may have been crossed
        for entry in &outcome.stp_cancelled {
            if let Some(mut resting) = self.get_order(&entry.order_id) {
                resting.status = OrderStatus::Cancelled;
                resting.remaining = entry.remaining_qty;
                resting.updated_at = Utc::now();
                self.release_reservation(&resting.order_id).await;
                self.persist(&resting)?;
                self.orders
                    .write()
                    .insert(resting.order_id.clone(), resting.clone());
                self.emit_order(&resting);
            }
        }

        if let Some(reason) = outcome.reject_reason {
            return Err(EngineError::conflict(reason));
        }

        let taker = outcome.taker.clone();
        for maker_fill in &outcome.maker_fills {
            self.settle_maker(maker_fill, &outcome.fills, &info).await?;
        }
        for fill in &outcome.fills {
            self.persist_fill(fill);
        }
        for trade in &outcome.trades {
            if let Err(e) = self.store.insert_trade(trade) {
                warn!(trade_id = %trade.trade_id, error = %e, "liquidation trade persist failed");
            }
            let _ = self.events.send(WsServerEvent::Trade(trade.clone()));
        }
        self.persist(&taker)?;

        debug!(
            user_id,
            symbol,
            qty = %taker.filled,
            avg = %taker.average_fill_price,
            "liquidation order executed"
        );
        Ok((taker.average_fill_price, taker.filled))
    }

    // ==================================================================

    fn persist(&self, order: &Order) -> EngineResult<()> {
        debug_assert!(order.check_invariants(), "order invariants violated");
        self.store
            .upsert_order(order)
            .map_err(|e| EngineError::internal(format!("order persist: {e}")))
    }

    pub fn persist_fill(&self, fill: &Fill) {
        if let Err(e) = self.store.insert_fill(fill) {
            warn!(fill_id = %fill.fill_id, error = %e, "fill persist failed");
        }
    }

    fn emit_order(&self, order: &Order) {
        let _ = self.events.send(WsServerEvent::OrderUpdate(order.clone()));
    }

    fn wallet_event(&self, user_id: &str, balances: Vec<crate::models::Balance>) {
        let _ = self.events.send(WsServerEvent::WalletUpdate {
            user_id: user_id.to_string(),
            balances,
        });
    }

    fn reject_event(&self, req: &PlaceOrder, e: EngineError) -> EngineError {
        let mut context = HashMap::new();
        context.insert("user_id".to_string(), req.user_id.clone());
        context.insert("symbol".to_string(), req.symbol.clone());
        context.insert("side".to_string(), req.side.as_str().to_string());
        let _ = self.events.send(WsServerEvent::OrderRejected {
            kind: e.kind().to_string(),
            message: e.to_string(),
            context,
        });
        metrics::counter!("orders_rejected_total", 1);
        e
    }
}
