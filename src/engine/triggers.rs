//! Trigger monitor.
//!
//! Holds armed stop / stop-limit / take-profit specs and trailing-stop
//! state, scans mark prices on a fixed cadence, and hands fired order ids
//! to the execution loop over a channel. Triggers fire in the order the
//! scan observed them; two triggers satisfied by the same tick fire in
//! insertion order.

use crate::error::{EngineError, EngineResult};
use crate::feeds::aggregator::PriceAggregator;
use crate::models::{Order, OrderType, Price, Side};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCmp {
    /// Fire when mark >= reference.
    GreaterEq,
    /// Fire when mark <= reference.
    LessEq,
}

#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub symbol: String,
    pub cmp: TriggerCmp,
    pub ref_price: Price,
}

impl TriggerSpec {
    fn satisfied(&self, mark: Price) -> bool {
        match self.cmp {
            TriggerCmp::GreaterEq => mark >= self.ref_price,
            TriggerCmp::LessEq => mark <= self.ref_price,
        }
    }
}

#[derive(Debug, Clone)]
struct TrailingEntry {
    symbol: String,
    side: Side,
    activation_price: Option<Price>,
    callback_rate: Option<Decimal>,
    abs_offset: Option<Decimal>,
    high_water_mark: Price,
    armed: bool,
}

impl TrailingEntry {
    /// Advance the high-water mark in the favourable direction and report
    /// whether the adverse move through the effective trigger has happened.
    fn observe(&mut self, mark: Price) -> bool {
        if !self.armed {
            let activated = match (self.activation_price, self.side) {
                (Some(activation), Side::Sell) => mark >= activation,
                (Some(activation), Side::Buy) => mark <= activation,
                (None, _) => true,
            };
            if !activated {
                return false;
            }
            self.armed = true;
            self.high_water_mark = mark;
            return false;
        }

        match self.side {
            // trailing sell protects a long: ratchet up, fire on the way down
            Side::Sell => {
                if mark > self.high_water_mark {
                    self.high_water_mark = mark;
                    return false;
                }
                mark <= self.effective_trigger()
            }
            // trailing buy protects a short: ratchet down, fire on the way up
            Side::Buy => {
                if mark < self.high_water_mark {
                    self.high_water_mark = mark;
                    return false;
                }
                mark >= self.effective_trigger()
            }
        }
    }

    fn effective_trigger(&self) -> Price {
        match self.side {
            Side::Sell => {
                if let Some(rate) = self.callback_rate {
                    self.high_water_mark * (Decimal::ONE - rate)
                } else {
                    self.high_water_mark - self.abs_offset.unwrap_or(Decimal::ZERO)
                }
            }
            Side::Buy => {
                if let Some(rate) = self.callback_rate {
                    self.high_water_mark * (Decimal::ONE + rate)
                } else {
                    self.high_water_mark + self.abs_offset.unwrap_or(Decimal::ZERO)
                }
            }
        }
    }
}

pub struct TriggerMonitor {
    /// Insertion-ordered; scan fires in this order.
    triggers: Mutex<Vec<(String, TriggerSpec)>>,
    trailing: Mutex<Vec<(String, TrailingEntry)>>,
    fired_tx: mpsc::Sender<String>,
}

impl TriggerMonitor {
    pub fn new(fired_tx: mpsc::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            triggers: Mutex::new(Vec::new()),
            trailing: Mutex::new(Vec::new()),
            fired_tx,
        })
    }

    /// Arm a triggerable order. Stop and take-profit derive their firing
    /// direction from the order side.
    pub fn arm(&self, order: &Order) -> EngineResult<()> {
        match order.order_type {
            OrderType::Stop | OrderType::StopLimit => {
                let stop = order
                    .stop_price
                    .ok_or_else(|| EngineError::validation("stop order without stop price"))?;
                let cmp = match order.side {
                    // a sell stop protects a long: fires on the way down
                    Side::Sell => TriggerCmp::LessEq,
                    Side::Buy => TriggerCmp::GreaterEq,
                };
                self.triggers.lock().push((
                    order.order_id.clone(),
                    TriggerSpec {
                        symbol: order.symbol.clone(),
                        cmp,
                        ref_price: stop,
                    },
                ));
            }
            OrderType::TakeProfit => {
                let stop = order
                    .stop_price
                    .ok_or_else(|| EngineError::validation("take profit without trigger price"))?;
                let cmp = match order.side {
                    // a sell take-profit banks a long: fires on the way up
                    Side::Sell => TriggerCmp::GreaterEq,
                    Side::Buy => TriggerCmp::LessEq,
                };
                self.triggers.lock().push((
                    order.order_id.clone(),
                    TriggerSpec {
                        symbol: order.symbol.clone(),
                        cmp,
                        ref_price: stop,
                    },
                ));
            }
            OrderType::TrailingStop => {
                let trailing = order
                    .trailing
                    .as_ref()
                    .ok_or_else(|| EngineError::validation("trailing stop without parameters"))?;
                self.trailing.lock().push((
                    order.order_id.clone(),
                    TrailingEntry {
                        symbol: order.symbol.clone(),
                        side: order.side,
                        activation_price: trailing.activation_price,
                        callback_rate: trailing.callback_rate,
                        abs_offset: trailing.abs_offset,
                        high_water_mark: Decimal::ZERO,
                        armed: false,
                    },
                ));
            }
            other => {
                return Err(EngineError::internal(format!(
                    "cannot arm non-triggerable order type {}",
                    other.as_str()
                )))
            }
        }
        debug!(order_id = %order.order_id, "trigger armed");
        Ok(())
    }

    pub fn disarm(&self, order_id: &str) -> bool {
        let mut removed = false;
        {
            let mut triggers = self.triggers.lock();
            let before = triggers.len();
            triggers.retain(|(id, _)| id != order_id);
            removed |= triggers.len() != before;
        }
        {
            let mut trailing = self.trailing.lock();
            let before = trailing.len();
            trailing.retain(|(id, _)| id != order_id);
            removed |= trailing.len() != before;
        }
        removed
    }

    pub fn armed_count(&self) -> usize {
        self.triggers.lock().len() + self.trailing.lock().len()
    }

    pub fn is_armed(&self, order_id: &str) -> bool {
        self.triggers.lock().iter().any(|(id, _)| id == order_id)
            || self.trailing.lock().iter().any(|(id, _)| id == order_id)
    }

    /// One scan pass: returns fired order ids in firing order and removes
    /// them from the armed sets.
    pub fn scan(&self, agg: &PriceAggregator) -> Vec<String> {
        let mut fired = Vec::new();

        {
            let mut triggers = self.triggers.lock();
            triggers.retain(|(order_id, spec)| {
                let Some(mark) = agg.mark(&spec.symbol) else {
                    return true;
                };
                if spec.satisfied(mark) {
                    fired.push(order_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        {
            let mut trailing = self.trailing.lock();
            trailing.retain_mut(|(order_id, entry)| {
                let Some(mark) = agg.mark(&entry.symbol) else {
                    return true;
                };
                if entry.observe(mark) {
                    fired.push(order_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        fired
    }

    /// Periodic scan loop; fired ids go to the execution channel in order.
    pub fn spawn(self: &Arc<Self>, agg: Arc<PriceAggregator>, cadence: Duration) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cadence);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                for order_id in monitor.scan(&agg) {
                    info!(order_id = %order_id, "trigger fired");
                    if monitor.fired_tx.send(order_id).await.is_err() {
                        warn!("trigger execution channel closed; monitor stopping");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        MarginMode, MarkPriceRule, OrderFlags, OrderStatus, PriceTick, TimeInForce, TrailingState,
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast;

    fn agg_with_mark(symbol: &str, mark: Decimal) -> Arc<PriceAggregator> {
        let (events, _) = broadcast::channel(64);
        let agg = PriceAggregator::new(
            vec!["binance".into()],
            MarkPriceRule::Last,
            dec!(10), // effectively no outlier gate for tests
            Duration::from_secs(60),
            50,
            events,
        );
        set_mark(&agg, symbol, mark);
        agg
    }

    fn set_mark(agg: &PriceAggregator, symbol: &str, mark: Decimal) {
        agg.apply_tick(PriceTick {
            symbol: symbol.into(),
            last: mark,
            bid: mark - dec!(0.01),
            ask: mark + dec!(0.01),
            bid_size: dec!(1),
            ask_size: dec!(1),
            volume_24h: dec!(1),
            quote_volume_24h: mark,
            timestamp: Utc::now().timestamp_millis(),
            source: "binance".into(),
            sequence: 1,
        });
    }

    fn stop_order(id: &str, side: Side, order_type: OrderType, stop: Decimal) -> Order {
        let now = Utc::now();
        Order {
            order_id: id.into(),
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            side,
            order_type,
            price: None,
            stop_price: Some(stop),
            quantity: dec!(1),
            filled: Decimal::ZERO,
            remaining: dec!(1),
            average_fill_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: OrderStatus::Pending,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::default(),
            oco_linked_id: None,
            trailing: None,
            leverage: None,
            margin_mode: None::<MarginMode>,
            created_at: now,
            updated_at: now,
            triggered_at: None,
        }
    }

    fn monitor() -> (Arc<TriggerMonitor>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (TriggerMonitor::new(tx), rx)
    }

    #[test]
    fn test_sell_stop_fires_on_drop() {
        let (monitor, _rx) = monitor();
        monitor
            .arm(&stop_order("s1", Side::Sell, OrderType::Stop, dec!(90)))
            .unwrap();

        let agg = agg_with_mark("BTCUSDT", dec!(95));
        assert!(monitor.scan(&agg).is_empty());

        set_mark(&agg, "BTCUSDT", dec!(90));
        let fired = monitor.scan(&agg);
        assert_eq!(fired, vec!["s1".to_string()]);
        assert_eq!(monitor.armed_count(), 0);
    }

    #[test]
    fn test_take_profit_fires_on_rise() {
        let (monitor, _rx) = monitor();
        monitor
            .arm(&stop_order("tp", Side::Sell, OrderType::TakeProfit, dec!(110)))
            .unwrap();

        let agg = agg_with_mark("BTCUSDT", dec!(105));
        assert!(monitor.scan(&agg).is_empty());
        set_mark(&agg, "BTCUSDT", dec!(110));
        assert_eq!(monitor.scan(&agg), vec!["tp".to_string()]);
    }

    #[test]
    fn test_same_tick_fires_in_insertion_order() {
        let (monitor, _rx) = monitor();
        monitor
            .arm(&stop_order("first", Side::Sell, OrderType::Stop, dec!(95)))
            .unwrap();
        monitor
            .arm(&stop_order("second", Side::Sell, OrderType::Stop, dec!(98)))
            .unwrap();

        let agg = agg_with_mark("BTCUSDT", dec!(90));
        let fired = monitor.scan(&agg);
        assert_eq!(fired, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_disarm_removes_trigger() {
        let (monitor, _rx) = monitor();
        monitor
            .arm(&stop_order("s1", Side::Sell, OrderType::Stop, dec!(90)))
            .unwrap();
        assert!(monitor.is_armed("s1"));
        assert!(monitor.disarm("s1"));
        assert!(!monitor.disarm("s1"));

        let agg = agg_with_mark("BTCUSDT", dec!(50));
        assert!(monitor.scan(&agg).is_empty());
    }

    #[test]
    fn test_trailing_sell_ratchets_and_fires() {
        let (monitor, _rx) = monitor();
        let mut order = stop_order("tr", Side::Sell, OrderType::TrailingStop, dec!(0));
        order.stop_price = None;
        order.trailing = Some(TrailingState {
            activation_price: None,
            callback_rate: Some(dec!(0.05)),
            abs_offset: None,
            high_water_mark: Decimal::ZERO,
            armed: false,
        });
        monitor.arm(&order).unwrap();

        let agg = agg_with_mark("BTCUSDT", dec!(100));
        // first observation arms at 100
        assert!(monitor.scan(&agg).is_empty());
        // ratchet up to 120; trigger now 114
        set_mark(&agg, "BTCUSDT", dec!(120));
        assert!(monitor.scan(&agg).is_empty());
        // pullback to 115 stays above 114
        set_mark(&agg, "BTCUSDT", dec!(115));
        assert!(monitor.scan(&agg).is_empty());
        // drop through 114 fires
        set_mark(&agg, "BTCUSDT", dec!(113));
        assert_eq!(monitor.scan(&agg), vec!["tr".to_string()]);
    }

    #[test]
    fn test_trailing_activation_price_gates_arming() {
        let (monitor, _rx) = monitor();
        let mut order = stop_order("tr", Side::Sell, OrderType::TrailingStop, dec!(0));
        order.stop_price = None;
        order.trailing = Some(TrailingState {
            activation_price: Some(dec!(110)),
            callback_rate: None,
            abs_offset: Some(dec!(2)),
            high_water_mark: Decimal::ZERO,
            armed: false,
        });
        monitor.arm(&order).unwrap();

        let agg = agg_with_mark("BTCUSDT", dec!(100));
        // below activation: a big drop must NOT fire
        set_mark(&agg, "BTCUSDT", dec!(95));
        assert!(monitor.scan(&agg).is_empty());

        // cross activation at 110, ratchet to 112, fire at 110 (offset 2)
        set_mark(&agg, "BTCUSDT", dec!(110));
        assert!(monitor.scan(&agg).is_empty());
        set_mark(&agg, "BTCUSDT", dec!(112));
        assert!(monitor.scan(&agg).is_empty());
        set_mark(&agg, "BTCUSDT", dec!(110));
        assert_eq!(monitor.scan(&agg), vec!["tr".to_string()]);
    }
}
