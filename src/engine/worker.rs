//! Symbol workers.
//!
//! One long-lived task owns each symbol's book and matching state; it is the
//! only code that touches them. Callers enqueue a request and await the
//! reply on a oneshot, with a bounded timeout so a wedged worker cannot hang
//! a user placement.

use crate::book::{BookEntry, BookStatistics, DepthLevel, MarketImpact};
use crate::engine::ids::IdGen;
use crate::engine::matching::{FeeConfig, MatchOutcome, SymbolEngine};
use crate::error::{EngineError, EngineResult};
use crate::models::{Order, Price, Qty, Side, SymbolInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const REQUEST_QUEUE_DEPTH: usize = 512;
/// Budget for read-only queries; placements use the configured order timeout.
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

pub enum EngineRequest {
    Submit {
        order: Order,
        reply: oneshot::Sender<EngineResult<MatchOutcome>>,
    },
    Cancel {
        order_id: String,
        reply: oneshot::Sender<Option<BookEntry>>,
    },
    CancelAll {
        user_id: Option<String>,
        reply: oneshot::Sender<Vec<BookEntry>>,
    },
    Depth {
        levels: usize,
        reply: oneshot::Sender<(Vec<DepthLevel>, Vec<DepthLevel>)>,
    },
    Impact {
        side: Side,
        qty: Qty,
        reply: oneshot::Sender<MarketImpact>,
    },
    Statistics {
        reply: oneshot::Sender<BookStatistics>,
    },
    BestQuote {
        reply: oneshot::Sender<(Option<Price>, Option<Price>)>,
    },
    SetPaused {
        paused: bool,
        reply: oneshot::Sender<()>,
    },
    IsPaused {
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
pub struct EngineHandle {
    pub symbol: String,
    tx: mpsc::Sender<EngineRequest>,
    order_timeout: Duration,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        req: EngineRequest,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> EngineResult<T> {
        self.tx
            .send(req)
            .await
            .map_err(|_| EngineError::internal(format!("engine worker gone: {}", self.symbol)))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(_)) => Err(EngineError::internal(format!(
                "engine worker dropped reply: {}",
                self.symbol
            ))),
            Err(_) => Err(EngineError::internal(format!(
                "engine request timed out: {}",
                self.symbol
            ))),
        }
    }

    pub async fn submit(&self, order: Order) -> EngineResult<MatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Submit { order, reply }, rx, self.order_timeout)
            .await?
    }

    pub async fn cancel(&self, order_id: &str) -> EngineResult<Option<BookEntry>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            EngineRequest::Cancel {
                order_id: order_id.to_string(),
                reply,
            },
            rx,
            self.order_timeout,
        )
        .await
    }

    pub async fn cancel_all(&self, user_id: Option<String>) -> EngineResult<Vec<BookEntry>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            EngineRequest::CancelAll { user_id, reply },
            rx,
            self.order_timeout,
        )
        .await
    }

    pub async fn depth(&self, levels: usize) -> EngineResult<(Vec<DepthLevel>, Vec<DepthLevel>)> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Depth { levels, reply }, rx, QUERY_TIMEOUT)
            .await
    }

    pub async fn impact(&self, side: Side, qty: Qty) -> EngineResult<MarketImpact> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Impact { side, qty, reply }, rx, QUERY_TIMEOUT)
            .await
    }

    pub async fn statistics(&self) -> EngineResult<BookStatistics> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Statistics { reply }, rx, QUERY_TIMEOUT)
            .await
    }

    pub async fn best_quote(&self) -> EngineResult<(Option<Price>, Option<Price>)> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::BestQuote { reply }, rx, QUERY_TIMEOUT)
            .await
    }

    pub async fn set_paused(&self, paused: bool) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            EngineRequest::SetPaused { paused, reply },
            rx,
            QUERY_TIMEOUT,
        )
        .await
    }

    pub async fn is_paused(&self) -> EngineResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::IsPaused { reply }, rx, QUERY_TIMEOUT)
            .await
    }
}

fn run_worker(mut engine: SymbolEngine, mut rx: mpsc::Receiver<EngineRequest>) {
    tokio::spawn(async move {
        let symbol = engine.info.symbol.clone();
        info!(symbol = %symbol, "symbol worker started");
        while let Some(req) = rx.recv().await {
            match req {
                EngineRequest::Submit { order, reply } => {
                    let outcome = engine.submit(order);
                    if let Ok(ref out) = outcome {
                        metrics::counter!("engine_trades_total", out.trades.len() as u64);
                    }
                    let _ = reply.send(outcome);
                }
                EngineRequest::Cancel { order_id, reply } => {
                    let _ = reply.send(engine.cancel(&order_id));
                }
                EngineRequest::CancelAll { user_id, reply } => {
                    let _ = reply.send(engine.cancel_all(user_id.as_deref()));
                }
                EngineRequest::Depth { levels, reply } => {
                    let _ = reply.send(engine.book().depth(levels));
                }
                EngineRequest::Impact { side, qty, reply } => {
                    let _ = reply.send(engine.book().simulate_market_impact(side, qty));
                }
                EngineRequest::Statistics { reply } => {
                    let _ = reply.send(engine.book().statistics());
                }
                EngineRequest::BestQuote { reply } => {
                    let _ = reply.send((
                        engine.book().best_bid_price(),
                        engine.book().best_ask_price(),
                    ));
                }
                EngineRequest::SetPaused { paused, reply } => {
                    if paused {
                        engine.pause();
                    } else {
                        engine.resume();
                    }
                    let _ = reply.send(());
                }
                EngineRequest::IsPaused { reply } => {
                    let _ = reply.send(engine.is_paused());
                }
            }
        }
        info!(symbol = %symbol, "symbol worker stopped");
    });
}

/// Routes requests to the owning worker per symbol, spawning workers on
/// first use.
pub struct MatchingRouter {
    handles: RwLock<HashMap<String, EngineHandle>>,
    fees: FeeConfig,
    ids: Arc<IdGen>,
    order_timeout: Duration,
}

impl MatchingRouter {
    pub fn new(fees: FeeConfig, ids: Arc<IdGen>, order_timeout: Duration) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            fees,
            ids,
            order_timeout,
        }
    }

    /// Spawn (or fetch) the worker for a symbol.
    pub fn ensure(&self, info: &SymbolInfo) -> EngineHandle {
        if let Some(handle) = self.handles.read().get(&info.symbol) {
            return handle.clone();
        }
        let mut handles = self.handles.write();
        handles
            .entry(info.symbol.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
                let engine = SymbolEngine::new(info.clone(), self.fees, self.ids.clone());
                run_worker(engine, rx);
                EngineHandle {
                    symbol: info.symbol.clone(),
                    tx,
                    order_timeout: self.order_timeout,
                }
            })
            .clone()
    }

    pub fn get(&self, symbol: &str) -> EngineResult<EngineHandle> {
        self.handles
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::not_found("market", symbol))
    }

    pub fn symbols(&self) -> Vec<String> {
        self.handles.read().keys().cloned().collect()
    }

    pub async fn set_all_paused(&self, paused: bool) {
        let handles: Vec<EngineHandle> = self.handles.read().values().cloned().collect();
        for handle in handles {
            if let Err(e) = handle.set_paused(paused).await {
                warn!(symbol = %handle.symbol, error = %e, "pause toggle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderFlags, OrderStatus, OrderType, TimeInForce};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn router() -> MatchingRouter {
        MatchingRouter::new(
            FeeConfig {
                maker_rate: dec!(0.0002),
                taker_rate: dec!(0.001),
            },
            Arc::new(IdGen::new()),
            Duration::from_secs(2),
        )
    }

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

    fn limit(id: &str, user: &str, side: Side, price: Decimal, qty: Decimal) -> Order {
        let now = Utc::now();
        Order {
            order_id: id.into(),
            user_id: user.into(),
            symbol: "BTCUSDT".into(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            stop_price: None,
            quantity: qty,
            filled: Decimal::ZERO,
            remaining: qty,
            average_fill_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: OrderStatus::Pending,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::default(),
            oco_linked_id: None,
            trailing: None,
            leverage: None,
            margin_mode: None,
            created_at: now,
            updated_at: now,
            triggered_at: None,
        }
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let router = router();
        let handle = router.ensure(&btc_info());

        let outcome = handle
            .submit(limit("s1", "u1", Side::Sell, dec!(100), dec!(1)))
            .await
            .unwrap();
        assert_eq!(outcome.taker.status, OrderStatus::Open);

        let (bid, ask) = handle.best_quote().await.unwrap();
        assert_eq!((bid, ask), (None, Some(dec!(100))));

        let outcome = handle
            .submit(limit("b1", "u2", Side::Buy, dec!(100), dec!(1)))
            .await
            .unwrap();
        assert_eq!(outcome.trades.len(), 1);
    }

    #[tokio::test]
    async fn test_router_get_unknown_symbol() {
        let router = router();
        assert!(matches!(
            router.get("NOPEUSDT"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_requests_serialise_in_arrival_order() {
        let router = router();
        let handle = router.ensure(&btc_info());

        // queue a rest then a cross; the cross must see the rest
        handle
            .submit(limit("s1", "u1", Side::Sell, dec!(100), dec!(2)))
            .await
            .unwrap();
        let outcome = handle
            .submit(limit("b1", "u2", Side::Buy, dec!(100), dec!(2)))
            .await
            .unwrap();
        assert_eq!(outcome.taker.status, OrderStatus::Filled);

        let stats = handle.statistics().await.unwrap();
        assert_eq!(stats.order_count, 0);
    }

    #[tokio::test]
    async fn test_pause_via_handle() {
        let router = router();
        let handle = router.ensure(&btc_info());
        handle.set_paused(true).await.unwrap();
        assert!(handle.is_paused().await.unwrap());
        let err = handle
            .submit(limit("b1", "u1", Side::Buy, dec!(100), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MarketHalted(_)));
    }
}
