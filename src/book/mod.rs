//! Per-symbol limit order book.
//!
//! Two `BTreeMap`s of price levels (bids iterated descending, asks
//! ascending), a FIFO queue per level, and an `order_id -> (side, price)`
//! index for O(log P) cancel. All mutation happens inside the symbol's
//! owning engine task, so the book itself carries no locks.

use crate::models::{Price, Qty, Side};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// A resting order's footprint in the book. The order controller owns the
/// full order; the book keeps only what matching needs.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub order_id: String,
    pub user_id: String,
    pub remaining_qty: Qty,
    /// UTC milliseconds; earlier entries match first within a level.
    pub added_at: i64,
    /// Hidden entries are excluded from public depth.
    pub hidden: bool,
}

/// A single price level with FIFO queue.
#[derive(Debug, Clone, Default)]
pub struct BookLevel {
    pub total_quantity: Qty,
    queue: VecDeque<BookEntry>,
}

impl BookLevel {
    fn push(&mut self, entry: BookEntry) {
        self.total_quantity += entry.remaining_qty;
        self.queue.push_back(entry);
    }

    fn remove(&mut self, order_id: &str) -> Option<BookEntry> {
        let pos = self.queue.iter().position(|e| e.order_id == order_id)?;
        let entry = self.queue.remove(pos)?;
        self.total_quantity -= entry.remaining_qty;
        Some(entry)
    }

    pub fn front(&self) -> Option<&BookEntry> {
        self.queue.front()
    }

    /// Reduce the front entry by up to `qty`; pops it when exhausted.
    /// Returns the quantity actually taken.
    fn consume_front(&mut self, qty: Qty) -> Qty {
        let Some(front) = self.queue.front_mut() else {
            return Decimal::ZERO;
        };
        let taken = qty.min(front.remaining_qty);
        front.remaining_qty -= taken;
        self.total_quantity -= taken;
        if front.remaining_qty == Decimal::ZERO {
            self.queue.pop_front();
        }
        taken
    }

    fn pop_front(&mut self) -> Option<BookEntry> {
        let entry = self.queue.pop_front()?;
        self.total_quantity -= entry.remaining_qty;
        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn order_count(&self) -> usize {
        self.queue.len()
    }

    pub fn visible_quantity(&self) -> Qty {
        self.queue
            .iter()
            .filter(|e| !e.hidden)
            .map(|e| e.remaining_qty)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BookEntry> {
        self.queue.iter()
    }
}

#[derive(Debug, Clone, Copy)]
struct OrderLocation {
    side: Side,
    price: Price,
}

/// Public depth row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DepthLevel {
    pub price: Price,
    pub quantity: Qty,
    pub orders: usize,
}

/// Result of a market-impact walk.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MarketImpact {
    pub avg_price: Price,
    pub worst_price: Price,
    pub filled: Qty,
    pub consumed_levels: usize,
}

/// Spread/imbalance/count snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BookStatistics {
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub spread: Option<Price>,
    pub imbalance: Decimal,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub order_count: usize,
}

#[derive(Debug, Default)]
pub struct OrderBook {
    pub symbol: String,
    bids: BTreeMap<Price, BookLevel>,
    asks: BTreeMap<Price, BookLevel>,
    index: HashMap<String, OrderLocation>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    fn side_book(&mut self, side: Side) -> &mut BTreeMap<Price, BookLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Rest a limit order. The caller guarantees the order is open or
    /// partially filled and the price is tick-aligned.
    pub fn add(&mut self, side: Side, price: Price, entry: BookEntry) {
        let order_id = entry.order_id.clone();
        self.side_book(side).entry(price).or_default().push(entry);
        self.index.insert(order_id, OrderLocation { side, price });
    }

    /// Remove an order wherever it rests. Returns its entry, or `None` if
    /// the order is not on the book.
    pub fn remove(&mut self, order_id: &str) -> Option<BookEntry> {
        let loc = self.index.remove(order_id)?;
        let book = self.side_book(loc.side);
        let level = book.get_mut(&loc.price)?;
        let entry = level.remove(order_id);
        if level.is_empty() {
            book.remove(&loc.price);
        }
        entry
    }

    /// Modify = remove + add; queue priority is forfeited.
    pub fn modify(&mut self, side: Side, price: Price, entry: BookEntry) -> Option<BookEntry> {
        let old = self.remove(&entry.order_id);
        self.add(side, price, entry);
        old
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn best_bid(&self) -> Option<(Price, &BookLevel)> {
        self.bids.iter().next_back().map(|(p, l)| (*p, l))
    }

    pub fn best_ask(&self) -> Option<(Price, &BookLevel)> {
        self.asks.iter().next().map(|(p, l)| (*p, l))
    }

    pub fn best_bid_price(&self) -> Option<Price> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask_price(&self) -> Option<Price> {
        self.asks.keys().next().copied()
    }

    /// Front entry of the best opposing level for an incoming order.
    pub fn best_counter_entry(&self, incoming: Side) -> Option<(&BookEntry, Price)> {
        match incoming {
            Side::Buy => self
                .asks
                .iter()
                .next()
                .and_then(|(p, l)| l.front().map(|e| (e, *p))),
            Side::Sell => self
                .bids
                .iter()
                .next_back()
                .and_then(|(p, l)| l.front().map(|e| (e, *p))),
        }
    }

    /// Take up to `qty` off the front of the best opposing level.
    /// Returns `(price, taken)`; `taken` is zero when the side is empty.
    pub fn consume_best(&mut self, incoming: Side, qty: Qty) -> Option<(Price, Qty)> {
        let (price, level) = match incoming {
            Side::Buy => self.asks.iter_mut().next()?,
            Side::Sell => self.bids.iter_mut().next_back()?,
        };
        let price = *price;
        let front_id = level.front().map(|e| e.order_id.clone());
        let taken = level.consume_front(qty);
        if let Some(id) = front_id {
            // Keep the index honest when the front entry is exhausted.
            if !level.iter().any(|e| e.order_id == id) {
                self.index.remove(&id);
            }
        }
        let empty = level.is_empty();
        if empty {
            match incoming {
                Side::Buy => {
                    self.asks.remove(&price);
                }
                Side::Sell => {
                    self.bids.remove(&price);
                }
            }
        }
        Some((price, taken))
    }

    /// Pop the entire front entry of the best opposing level (self-trade
    /// prevention path).
    pub fn pop_best_counter(&mut self, incoming: Side) -> Option<(Price, BookEntry)> {
        let (price, level) = match incoming {
            Side::Buy => self.asks.iter_mut().next()?,
            Side::Sell => self.bids.iter_mut().next_back()?,
        };
        let price = *price;
        let entry = level.pop_front()?;
        self.index.remove(&entry.order_id);
        if level.is_empty() {
            match incoming {
                Side::Buy => {
                    self.asks.remove(&price);
                }
                Side::Sell => {
                    self.bids.remove(&price);
                }
            }
        }
        Some((price, entry))
    }

    /// Public depth, hidden entries excluded. Levels whose visible quantity
    /// is zero are skipped entirely.
    pub fn depth(&self, levels: usize) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let visible = |(price, level): (&Price, &BookLevel)| {
            let quantity = level.visible_quantity();
            (quantity > Decimal::ZERO).then(|| DepthLevel {
                price: *price,
                quantity,
                orders: level.iter().filter(|e| !e.hidden).count(),
            })
        };
        let bids = self
            .bids
            .iter()
            .rev()
            .filter_map(visible)
            .take(levels)
            .collect();
        let asks = self.asks.iter().filter_map(visible).take(levels).collect();
        (bids, asks)
    }

    /// Walk the opposing side as a market order of `qty` would, without
    /// mutating anything.
    pub fn simulate_market_impact(&self, side: Side, qty: Qty) -> MarketImpact {
        let mut remaining = qty;
        let mut notional = Decimal::ZERO;
        let mut filled = Decimal::ZERO;
        let mut worst = Decimal::ZERO;
        let mut consumed = 0usize;

        let mut walk = |price: Price, level: &BookLevel| {
            if remaining <= Decimal::ZERO {
                return false;
            }
            let take = remaining.min(level.total_quantity);
            notional += take * price;
            filled += take;
            remaining -= take;
            worst = price;
            consumed += 1;
            true
        };

        match side {
            Side::Buy => {
                for (p, l) in self.asks.iter() {
                    if !walk(*p, l) {
                        break;
                    }
                }
            }
            Side::Sell => {
                for (p, l) in self.bids.iter().rev() {
                    if !walk(*p, l) {
                        break;
                    }
                }
            }
        }

        MarketImpact {
            avg_price: if filled > Decimal::ZERO {
                notional / filled
            } else {
                Decimal::ZERO
            },
            worst_price: worst,
            filled,
            consumed_levels: consumed,
        }
    }

    /// Total opposing quantity at prices matchable by a limit at `price`.
    pub fn matchable_quantity(&self, side: Side, price: Option<Price>) -> Qty {
        match side {
            Side::Buy => self
                .asks
                .iter()
                .take_while(|(p, _)| price.map_or(true, |limit| **p <= limit))
                .map(|(_, l)| l.total_quantity)
                .sum(),
            Side::Sell => self
                .bids
                .iter()
                .rev()
                .take_while(|(p, _)| price.map_or(true, |limit| **p >= limit))
                .map(|(_, l)| l.total_quantity)
                .sum(),
        }
    }

    /// Whether a limit at `price` would cross the opposing side.
    pub fn would_cross(&self, side: Side, price: Price) -> bool {
        match side {
            Side::Buy => self.best_ask_price().map_or(false, |ask| price >= ask),
            Side::Sell => self.best_bid_price().map_or(false, |bid| price <= bid),
        }
    }

    pub fn clear(&mut self) -> Vec<BookEntry> {
        let mut drained = Vec::with_capacity(self.index.len());
        for (_, mut level) in std::mem::take(&mut self.bids) {
            while let Some(e) = level.pop_front() {
                drained.push(e);
            }
        }
        for (_, mut level) in std::mem::take(&mut self.asks) {
            while let Some(e) = level.pop_front() {
                drained.push(e);
            }
        }
        self.index.clear();
        drained
    }

    pub fn statistics(&self) -> BookStatistics {
        let best_bid = self.best_bid_price();
        let best_ask = self.best_ask_price();
        let bid_depth: Qty = self.bids.values().map(|l| l.total_quantity).sum();
        let ask_depth: Qty = self.asks.values().map(|l| l.total_quantity).sum();
        let total = bid_depth + ask_depth;
        BookStatistics {
            best_bid,
            best_ask,
            spread: match (best_bid, best_ask) {
                (Some(b), Some(a)) => Some(a - b),
                _ => None,
            },
            imbalance: if total > Decimal::ZERO {
                (bid_depth - ask_depth) / total
            } else {
                Decimal::ZERO
            },
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
            order_count: self.index.len(),
        }
    }

    /// Open order ids, optionally filtered by user.
    pub fn order_ids(&self, user_id: Option<&str>) -> Vec<String> {
        let matches = |e: &BookEntry| user_id.map_or(true, |u| e.user_id == u);
        self.bids
            .values()
            .chain(self.asks.values())
            .flat_map(|l| l.iter())
            .filter(|e| matches(e))
            .map(|e| e.order_id.clone())
            .collect()
    }

    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Per-level quantity must equal the sum of its entries. Used by tests
    /// and debug assertions.
    pub fn check_level_invariant(&self) -> bool {
        self.bids
            .values()
            .chain(self.asks.values())
            .all(|l| l.total_quantity == l.iter().map(|e| e.remaining_qty).sum::<Qty>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(id: &str, user: &str, qty: Decimal, at: i64) -> BookEntry {
        BookEntry {
            order_id: id.into(),
            user_id: user.into(),
            remaining_qty: qty,
            added_at: at,
            hidden: false,
        }
    }

    fn sample_book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT");
        book.add(Side::Buy, dec!(100), entry("b1", "u1", dec!(2), 1));
        book.add(Side::Buy, dec!(99), entry("b2", "u2", dec!(3), 2));
        book.add(Side::Sell, dec!(101), entry("a1", "u3", dec!(1), 3));
        book.add(Side::Sell, dec!(102), entry("a2", "u4", dec!(4), 4));
        book
    }

    #[test]
    fn test_best_prices_and_ordering() {
        let book = sample_book();
        assert_eq!(book.best_bid_price(), Some(dec!(100)));
        assert_eq!(book.best_ask_price(), Some(dec!(101)));
        let stats = book.statistics();
        assert_eq!(stats.spread, Some(dec!(1)));
        assert_eq!(stats.order_count, 4);
        assert!(book.check_level_invariant());
    }

    #[test]
    fn test_fifo_within_level() {
        let mut book = OrderBook::new("BTCUSDT");
        book.add(Side::Sell, dec!(101), entry("first", "u1", dec!(1), 1));
        book.add(Side::Sell, dec!(101), entry("second", "u2", dec!(1), 2));
        let (e, price) = book.best_counter_entry(Side::Buy).unwrap();
        assert_eq!(price, dec!(101));
        assert_eq!(e.order_id, "first");
    }

    #[test]
    fn test_remove_deletes_empty_level() {
        let mut book = sample_book();
        let removed = book.remove("a1").unwrap();
        assert_eq!(removed.remaining_qty, dec!(1));
        assert_eq!(book.best_ask_price(), Some(dec!(102)));
        assert!(!book.contains("a1"));
        // second removal is a no-op
        assert!(book.remove("a1").is_none());
        assert!(book.check_level_invariant());
    }

    #[test]
    fn test_consume_best_partial_and_exhaust() {
        let mut book = sample_book();
        let (price, taken) = book.consume_best(Side::Buy, dec!(0.5)).unwrap();
        assert_eq!((price, taken), (dec!(101), dec!(0.5)));
        assert!(book.contains("a1"));

        let (price, taken) = book.consume_best(Side::Buy, dec!(10)).unwrap();
        assert_eq!((price, taken), (dec!(101), dec!(0.5)));
        assert!(!book.contains("a1"));
        assert_eq!(book.best_ask_price(), Some(dec!(102)));
        assert!(book.check_level_invariant());
    }

    #[test]
    fn test_depth_hides_hidden_entries() {
        let mut book = sample_book();
        book.add(
            Side::Sell,
            dec!(101),
            BookEntry {
                order_id: "iceberg".into(),
                user_id: "u9".into(),
                remaining_qty: dec!(50),
                added_at: 9,
                hidden: true,
            },
        );
        let (_, asks) = book.depth(10);
        let top = &asks[0];
        assert_eq!(top.price, dec!(101));
        assert_eq!(top.quantity, dec!(1)); // hidden 50 excluded
        assert_eq!(top.orders, 1);
    }

    #[test]
    fn test_market_impact_walks_levels() {
        let book = sample_book();
        let impact = book.simulate_market_impact(Side::Buy, dec!(3));
        assert_eq!(impact.filled, dec!(3));
        assert_eq!(impact.worst_price, dec!(102));
        assert_eq!(impact.consumed_levels, 2);
        // 1 @ 101 + 2 @ 102 = 305 / 3
        assert_eq!(impact.avg_price, dec!(305) / dec!(3));
    }

    #[test]
    fn test_matchable_quantity_respects_limit() {
        let book = sample_book();
        assert_eq!(book.matchable_quantity(Side::Buy, Some(dec!(101))), dec!(1));
        assert_eq!(book.matchable_quantity(Side::Buy, Some(dec!(102))), dec!(5));
        assert_eq!(book.matchable_quantity(Side::Buy, None), dec!(5));
        assert_eq!(book.matchable_quantity(Side::Sell, Some(dec!(100))), dec!(2));
    }

    #[test]
    fn test_would_cross() {
        let book = sample_book();
        assert!(book.would_cross(Side::Buy, dec!(101)));
        assert!(!book.would_cross(Side::Buy, dec!(100.5)));
        assert!(book.would_cross(Side::Sell, dec!(100)));
        assert!(!book.would_cross(Side::Sell, dec!(100.5)));
    }

    #[test]
    fn test_clear_drains_everything() {
        let mut book = sample_book();
        let drained = book.clear();
        assert_eq!(drained.len(), 4);
        assert!(book.is_empty());
        assert_eq!(book.best_bid_price(), None);
    }
}
