//! Per-symbol matching engine.
//!
//! Price-time priority against the symbol's book: the resting side is always
//! the maker, fills for one incoming order are produced contiguously, and
//! self-trades cancel the resting order without a fill. All entry points run
//! inside the symbol's owning worker task.

use crate::book::{BookEntry, OrderBook};
use crate::engine::ids::IdGen;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Fill, Order, OrderStatus, OrderType, Price, Qty, Side, SymbolInfo, TimeInForce, Trade,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

/// Flat per-market fee rates. Maker/taker, fee charged in the received
/// asset.
#[derive(Debug, Clone, Copy)]
pub struct FeeConfig {
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct MatchingStats {
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub orders_cancelled: u64,
    pub fills: u64,
    pub total_volume: Qty,
    pub self_trades_prevented: u64,
    pub post_only_rejections: u64,
}

/// A maker order's share of a match, for the controller to settle.
#[derive(Debug, Clone)]
pub struct MakerFill {
    pub order_id: String,
    pub user_id: String,
    pub price: Price,
    pub quantity: Qty,
    pub fee: Decimal,
    pub fee_asset: String,
}

/// Everything one `submit` produced. The taker order is returned with its
/// final state; the controller applies wallet/position effects and persists.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub taker: Order,
    pub fills: Vec<Fill>,
    pub trades: Vec<Trade>,
    pub maker_fills: Vec<MakerFill>,
    /// Resting orders cancelled by self-trade prevention.
    pub stp_cancelled: Vec<BookEntry>,
    /// Set when the order was rejected outright (no fills, no rest).
    pub reject_reason: Option<&'static str>,
}

impl MatchOutcome {
    fn rejected(mut taker: Order, reason: &'static str) -> Self {
        taker.status = OrderStatus::Rejected;
        taker.updated_at = Utc::now();
        Self {
            taker,
            fills: Vec::new(),
            trades: Vec::new(),
            maker_fills: Vec::new(),
            stp_cancelled: Vec::new(),
            reject_reason: Some(reason),
        }
    }
}

pub struct SymbolEngine {
    pub info: SymbolInfo,
    book: OrderBook,
    fees: FeeConfig,
    ids: Arc<IdGen>,
    paused: bool,
    pub stats: MatchingStats,
}

impl SymbolEngine {
    pub fn new(info: SymbolInfo, fees: FeeConfig, ids: Arc<IdGen>) -> Self {
        let book = OrderBook::new(info.symbol.clone());
        Self {
            info,
            book,
            fees,
            ids,
            paused: false,
            stats: MatchingStats::default(),
        }
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Admit an order. Market and limit only; triggerable types are
    /// converted by the trigger monitor before they reach the engine.
    pub fn submit(&mut self, mut taker: Order) -> EngineResult<MatchOutcome> {
        if self.paused {
            return Err(EngineError::MarketHalted(self.info.symbol.clone()));
        }
        self.stats.orders_submitted += 1;

        let limit = match taker.order_type {
            OrderType::Market => None,
            OrderType::Limit => {
                let Some(price) = taker.price else {
                    self.stats.orders_rejected += 1;
                    return Ok(MatchOutcome::rejected(taker, "limit_requires_price"));
                };
                Some(price)
            }
            other => {
                return Err(EngineError::internal(format!(
                    "engine received untriggered {} order",
                    other.as_str()
                )))
            }
        };

        // Post-only rejects instead of taking.
        let post_only = taker.flags.post_only || taker.time_in_force == TimeInForce::PostOnly;
        if post_only {
            match limit {
                Some(price) if self.book.would_cross(taker.side, price) => {
                    self.stats.orders_rejected += 1;
                    self.stats.post_only_rejections += 1;
                    return Ok(MatchOutcome::rejected(taker, "post_only_would_cross"));
                }
                None => {
                    self.stats.orders_rejected += 1;
                    return Ok(MatchOutcome::rejected(taker, "post_only_requires_limit"));
                }
                _ => {}
            }
        }

        // FOK is all-or-nothing at admit time.
        if taker.time_in_force == TimeInForce::Fok
            && self.book.matchable_quantity(taker.side, limit) < taker.remaining
        {
            self.stats.orders_rejected += 1;
            return Ok(MatchOutcome::rejected(taker, "fok_unfillable"));
        }

        let mut outcome = MatchOutcome {
            taker: taker.clone(),
            fills: Vec::new(),
            trades: Vec::new(),
            maker_fills: Vec::new(),
            stp_cancelled: Vec::new(),
            reject_reason: None,
        };

        self.cross(&mut taker, limit, &mut outcome);

        // Dispose of any remainder.
        if taker.remaining > Decimal::ZERO {
            match taker.order_type {
                OrderType::Market => {
                    if taker.filled == Decimal::ZERO {
                        // keep any STP cancellations the cross performed
                        self.stats.orders_rejected += 1;
                        taker.status = OrderStatus::Rejected;
                        taker.updated_at = Utc::now();
                        outcome.reject_reason = Some("rejected_no_liquidity");
                        outcome.taker = taker;
                        return Ok(outcome);
                    }
                    // partial market: remainder dies, never rests
                    taker.status = OrderStatus::Cancelled;
                    taker.updated_at = Utc::now();
                }
                OrderType::Limit => match taker.time_in_force {
                    TimeInForce::Gtc | TimeInForce::PostOnly => {
                        taker.status = if taker.filled > Decimal::ZERO {
                            OrderStatus::PartiallyFilled
                        } else {
                            OrderStatus::Open
                        };
                        taker.updated_at = Utc::now();
                        self.book.add(
                            taker.side,
                            taker.price.expect("limit order has price"),
                            BookEntry {
                                order_id: taker.order_id.clone(),
                                user_id: taker.user_id.clone(),
                                remaining_qty: taker.remaining,
                                added_at: Utc::now().timestamp_millis(),
                                hidden: taker.flags.hidden,
                            },
                        );
                    }
                    TimeInForce::Ioc => {
                        taker.status = OrderStatus::Cancelled;
                        taker.updated_at = Utc::now();
                    }
                    TimeInForce::Fok => {
                        // guarded above; reaching here is an engine bug
                        return Err(EngineError::internal("FOK left a remainder"));
                    }
                },
                _ => unreachable!("guarded at admit"),
            }
        }

        debug_assert!(self.book.check_level_invariant());
        outcome.taker = taker;
        Ok(outcome)
    }

    fn cross(&mut self, taker: &mut Order, limit: Option<Price>, outcome: &mut MatchOutcome) {
        while taker.remaining > Decimal::ZERO {
            let Some((entry, level_price)) = self.book.best_counter_entry(taker.side) else {
                break;
            };
            if let Some(limit) = limit {
                let crosses = match taker.side {
                    Side::Buy => level_price <= limit,
                    Side::Sell => level_price >= limit,
                };
                if !crosses {
                    break;
                }
            }

            // Self-trade prevention: cancel-resting, no fill, keep matching.
            if entry.user_id == taker.user_id {
                if let Some((_, cancelled)) = self.book.pop_best_counter(taker.side) {
                    debug!(
                        symbol = %self.info.symbol,
                        order_id = %cancelled.order_id,
                        "self-trade prevented; resting order cancelled"
                    );
                    self.stats.self_trades_prevented += 1;
                    outcome.stp_cancelled.push(cancelled);
                }
                continue;
            }

            let maker_id = entry.order_id.clone();
            let maker_user = entry.user_id.clone();
            let Some((price, taken)) = self.book.consume_best(taker.side, taker.remaining) else {
                break;
            };
            if taken == Decimal::ZERO {
                break;
            }

            self.record_match(taker, &maker_id, &maker_user, price, taken, outcome);
        }
    }

    fn record_match(
        &mut self,
        taker: &mut Order,
        maker_id: &str,
        maker_user: &str,
        price: Price,
        qty: Qty,
        outcome: &mut MatchOutcome,
    ) {
        let now = Utc::now();
        let (buy_order_id, sell_order_id) = match taker.side {
            Side::Buy => (taker.order_id.clone(), maker_id.to_string()),
            Side::Sell => (maker_id.to_string(), taker.order_id.clone()),
        };

        // Fees come out of the received asset: the buyer's in base units,
        // the seller's in quote units.
        let (taker_fee, taker_fee_asset, maker_fee, maker_fee_asset) = match taker.side {
            Side::Buy => (
                qty * self.fees.taker_rate,
                self.info.base.clone(),
                price * qty * self.fees.maker_rate,
                self.info.quote.clone(),
            ),
            Side::Sell => (
                price * qty * self.fees.taker_rate,
                self.info.quote.clone(),
                qty * self.fees.maker_rate,
                self.info.base.clone(),
            ),
        };

        taker.apply_fill(price, qty, taker_fee);

        outcome.fills.push(Fill {
            fill_id: self.ids.next("FIL"),
            order_id: taker.order_id.clone(),
            counter_order_id: maker_id.to_string(),
            price,
            quantity: qty,
            fee: taker_fee,
            fee_asset: taker_fee_asset,
            is_maker: false,
            ts: now,
        });
        outcome.fills.push(Fill {
            fill_id: self.ids.next("FIL"),
            order_id: maker_id.to_string(),
            counter_order_id: taker.order_id.clone(),
            price,
            quantity: qty,
            fee: maker_fee,
            fee_asset: maker_fee_asset.clone(),
            is_maker: true,
            ts: now,
        });
        outcome.trades.push(Trade {
            trade_id: self.ids.next("TRD"),
            symbol: self.info.symbol.clone(),
            price,
            quantity: qty,
            buy_order_id,
            sell_order_id,
            is_buyer_maker: taker.side == Side::Sell,
            ts: now,
        });
        outcome.maker_fills.push(MakerFill {
            order_id: maker_id.to_string(),
            user_id: maker_user.to_string(),
            price,
            quantity: qty,
            fee: maker_fee,
            fee_asset: maker_fee_asset,
        });

        self.stats.fills += 2;
        self.stats.total_volume += qty;
    }

    /// Remove a resting order. Returns its entry, or `None` when it is not
    /// on the book (idempotent cancel).
    pub fn cancel(&mut self, order_id: &str) -> Option<BookEntry> {
        let entry = self.book.remove(order_id);
        if entry.is_some() {
            self.stats.orders_cancelled += 1;
        }
        entry
    }

    /// Remove every resting order, optionally for one user only.
    pub fn cancel_all(&mut self, user_id: Option<&str>) -> Vec<BookEntry> {
        let ids = self.book.order_ids(user_id);
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.book.remove(&id) {
                self.stats.orders_cancelled += 1;
                removed.push(entry);
            }
        }
        removed
    }
}
