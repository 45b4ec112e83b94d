//! End-to-end scenarios through the assembled engine: spot matching,
//! partial fills, stop and OCO triggers, the liquidation ladder, and feed
//! failover. Everything runs against an in-memory store with manually
//! driven ticks so the tests are deterministic.

use fluxtrade_backend::engine::controller::{OrderController, PlaceOrder};
use fluxtrade_backend::engine::ids::IdGen;
use fluxtrade_backend::engine::matching::FeeConfig;
use fluxtrade_backend::engine::triggers::TriggerMonitor;
use fluxtrade_backend::engine::worker::MatchingRouter;
use fluxtrade_backend::feeds::adapter::AdapterCore;
use fluxtrade_backend::feeds::aggregator::PriceAggregator;
use fluxtrade_backend::liquidation::{InsuranceFund, LiquidationConfig, LiquidationEngine};
use fluxtrade_backend::margin::PositionManager;
use fluxtrade_backend::markets::{StaticCatalogue, SymbolRegistry};
use fluxtrade_backend::models::{
    MarginMode, MarkPriceRule, OrderStatus, OrderType, PositionStatus, PriceTick, Side,
    WsServerEvent,
};
use fluxtrade_backend::storage::{Store, WalletLedger};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct Stack {
    store: Arc<Store>,
    wallets: Arc<WalletLedger>,
    agg: Arc<PriceAggregator>,
    triggers: Arc<TriggerMonitor>,
    positions: Arc<PositionManager>,
    controller: Arc<OrderController>,
    fund: Arc<InsuranceFund>,
    liquidation: Arc<LiquidationEngine>,
    events_rx: broadcast::Receiver<WsServerEvent>,
    _fired_rx: mpsc::Receiver<String>,
}

async fn stack() -> Stack {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let wallets = Arc::new(WalletLedger::new(store.clone(), Decimal::ZERO));
    let (events, events_rx) = broadcast::channel(4096);

    let registry = Arc::new(SymbolRegistry::new(
        store.clone(),
        vec![Box::new(StaticCatalogue::new(vec!["binance".into()]))],
    ));
    registry.refresh().await;

    let agg = PriceAggregator::new(
        vec!["binance".into()],
        MarkPriceRule::Last,
        dec!(0.5),
        Duration::from_secs(5),
        50,
        events.clone(),
    );

    let ids = Arc::new(IdGen::new());
    let router = Arc::new(MatchingRouter::new(
        FeeConfig {
            maker_rate: dec!(0.0002),
            taker_rate: dec!(0.001),
        },
        ids.clone(),
        Duration::from_secs(2),
    ));
    for info in registry.list(true) {
        router.ensure(&info);
    }

    let positions = PositionManager::new(
        store.clone(),
        wallets.clone(),
        events.clone(),
        ids.clone(),
        dec!(0.005),
    );

    let (fired_tx, _fired_rx) = mpsc::channel(256);
    let triggers = TriggerMonitor::new(fired_tx);

    let controller = OrderController::new(
        registry.clone(),
        router.clone(),
        wallets.clone(),
        positions.clone(),
        triggers.clone(),
        agg.clone(),
        store.clone(),
        events.clone(),
        ids,
        dec!(0.0002),
        dec!(0.001),
    );

    let fund = Arc::new(InsuranceFund::new(store.clone(), dec!(10000), dec!(50000)));
    let liquidation = LiquidationEngine::new(
        positions.clone(),
        controller.clone(),
        wallets.clone(),
        fund.clone(),
        store.clone(),
        events.clone(),
        LiquidationConfig {
            margin_call_ratio: dec!(0.70),
            liquidation_ratio: dec!(0.95),
            adl_ratio: dec!(0.98),
            fee_rate: dec!(0.005),
            concurrency: 10,
        },
    );

    Stack {
        store,
        wallets,
        agg,
        triggers,
        positions,
        controller,
        fund,
        liquidation,
        events_rx,
        _fired_rx,
    }
}

fn tick(symbol: &str, last: Decimal) -> PriceTick {
    PriceTick {
        symbol: symbol.into(),
        last,
        bid: last - dec!(0.01),
        ask: last + dec!(0.01),
        bid_size: dec!(1),
        ask_size: dec!(1),
        volume_24h: dec!(100),
        quote_volume_24h: dec!(100) * last,
        timestamp: chrono::Utc::now().timestamp_millis(),
        source: "binance".into(),
        sequence: 1,
    }
}

/// Fire due triggers synchronously through the controller.
async fn run_triggers(stack: &Stack) {
    for order_id in stack.triggers.scan(&stack.agg) {
        stack
            .controller
            .execute_triggered(&order_id)
            .await
            .expect("trigger execution");
    }
}

// ---------------------------------------------------------------------------
// S1: resting limit matched by an opposing limit at the same price
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_limit_match_settles_both_sides() {
    let stack = stack().await;
    stack.wallets.credit("u1", "BTC", dec!(1)).await.unwrap();
    stack
        .wallets
        .credit("u2", "USDT", dec!(60000))
        .await
        .unwrap();

    let sell = stack
        .controller
        .place(PlaceOrder::limit("u1", "BTCUSDT", Side::Sell, dec!(50000), dec!(1)))
        .await
        .unwrap();
    assert_eq!(sell.status, OrderStatus::Open);

    let buy = stack
        .controller
        .place(PlaceOrder::limit("u2", "BTCUSDT", Side::Buy, dec!(50000), dec!(1)))
        .await
        .unwrap();
    assert_eq!(buy.status, OrderStatus::Filled);
    assert_eq!(buy.average_fill_price, dec!(50000));

    let sell = stack.controller.get_order(&sell.order_id).unwrap();
    assert_eq!(sell.status, OrderStatus::Filled);
    assert!(sell.check_invariants());
    assert!(buy.check_invariants());

    // trades: one print at 50000 for 1.0, seller was maker
    let trades = stack.controller.recent_trades("BTCUSDT", 10);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, dec!(50000));
    assert_eq!(trades[0].quantity, dec!(1));
    assert_eq!(trades[0].sell_order_id, sell.order_id);
    assert!(!trades[0].is_buyer_maker);

    // seller receives quote minus the maker fee
    assert_eq!(
        stack.wallets.available("u1", "USDT").await,
        dec!(50000) * (Decimal::ONE - dec!(0.0002))
    );
    assert_eq!(stack.wallets.available("u1", "BTC").await, Decimal::ZERO);
    assert_eq!(stack.wallets.locked("u1", "BTC").await, Decimal::ZERO);

    // buyer receives base minus the taker fee, buffer reservation released
    assert_eq!(stack.wallets.available("u2", "BTC").await, dec!(0.999));
    assert_eq!(
        stack.wallets.available("u2", "USDT").await,
        dec!(60000) - dec!(50000)
    );
    assert_eq!(stack.wallets.locked("u2", "USDT").await, Decimal::ZERO);
}

// ---------------------------------------------------------------------------
// S2: partial market fill, then maker cancels the remainder
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_partial_fill_then_cancel_releases_remainder() {
    let stack = stack().await;
    stack.wallets.credit("u1", "BTC", dec!(2)).await.unwrap();
    stack
        .wallets
        .credit("u2", "USDT", dec!(1000))
        .await
        .unwrap();

    let sell = stack
        .controller
        .place(PlaceOrder::limit("u1", "BTCUSDT", Side::Sell, dec!(100), dec!(2)))
        .await
        .unwrap();

    let buy = stack
        .controller
        .place(PlaceOrder::market("u2", "BTCUSDT", Side::Buy, dec!(0.5)))
        .await
        .unwrap();
    assert_eq!(buy.status, OrderStatus::Filled);
    assert_eq!(buy.filled, dec!(0.5));
    assert_eq!(buy.average_fill_price, dec!(100));

    let sell_mid = stack.controller.get_order(&sell.order_id).unwrap();
    assert_eq!(sell_mid.status, OrderStatus::PartiallyFilled);
    assert_eq!(sell_mid.remaining, dec!(1.5));

    // cancel releases exactly the unfilled base
    let cancelled = stack
        .controller
        .cancel(&sell.order_id, "u1", "user request")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(stack.wallets.available("u1", "BTC").await, dec!(1.5));
    assert_eq!(stack.wallets.locked("u1", "BTC").await, Decimal::ZERO);
    // proceeds of the filled half, minus maker fee
    assert_eq!(
        stack.wallets.available("u1", "USDT").await,
        dec!(50) * (Decimal::ONE - dec!(0.0002))
    );

    // second cancel is a conflict, not a double release
    let err = stack
        .controller
        .cancel(&sell.order_id, "u1", "again")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        fluxtrade_backend::error::EngineError::Conflict(_)
    ));
    assert_eq!(stack.wallets.available("u1", "BTC").await, dec!(1.5));
}

// ---------------------------------------------------------------------------
// S3: armed stop fires on a mark drop and closes the position
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_stop_trigger_closes_leveraged_position() {
    let stack = stack().await;
    stack
        .wallets
        .credit("u1", "USDT", dec!(1000))
        .await
        .unwrap();
    stack.wallets.credit("u2", "BTC", dec!(1)).await.unwrap();
    stack
        .wallets
        .credit("u3", "USDT", dec!(1000))
        .await
        .unwrap();

    stack.agg.apply_tick(tick("BTCUSDT", dec!(100)));

    // u2 provides ask-side liquidity; u1 opens a 10x long at 100
    stack
        .controller
        .place(PlaceOrder::limit("u2", "BTCUSDT", Side::Sell, dec!(100), dec!(1)))
        .await
        .unwrap();
    let entry = stack
        .controller
        .place(PlaceOrder::market("u1", "BTCUSDT", Side::Buy, dec!(1)).with_leverage(10, MarginMode::Cross))
        .await
        .unwrap();
    assert_eq!(entry.status, OrderStatus::Filled);

    let position = stack.positions.find_for("u1", "BTCUSDT").unwrap();
    {
        let p = position.lock().await;
        assert_eq!(p.entry_price, dec!(100));
        assert_eq!(p.margin, dec!(10));
    }

    // arm the protective stop
    let mut stop = PlaceOrder::limit("u1", "BTCUSDT", Side::Sell, dec!(90), dec!(1));
    stop.order_type = OrderType::Stop;
    stop.price = None;
    stop.stop_price = Some(dec!(90));
    stop.leverage = Some(10);
    stop.margin_mode = Some(MarginMode::Cross);
    stop.flags.reduce_only = true;
    let stop = stack.controller.place(stop).await.unwrap();
    assert!(stack.triggers.is_armed(&stop.order_id));

    // u3 provides the bid the stop will hit
    stack
        .controller
        .place(PlaceOrder::limit("u3", "BTCUSDT", Side::Buy, dec!(90), dec!(1)))
        .await
        .unwrap();

    // mark drops through the stop
    stack.agg.apply_tick(tick("BTCUSDT", dec!(90)));
    run_triggers(&stack).await;

    assert!(!stack.triggers.is_armed(&stop.order_id));
    let stop = stack.controller.get_order(&stop.order_id).unwrap();
    assert_eq!(stop.status, OrderStatus::Filled);
    assert!(stop.triggered_at.is_some());

    // position closed with realised pnl of -10
    assert!(stack.positions.find_for("u1", "BTCUSDT").is_none());
    let open = stack.positions.open_positions().await;
    assert!(open.is_empty());

    // margin released net of the loss: 10 margin - 10 loss = 0 back,
    // minus the taker fee on the close
    let fee = dec!(90) * dec!(1) * dec!(0.001);
    assert_eq!(
        stack.wallets.available("u1", "USDT").await,
        dec!(1000) - dec!(10) /* entry margin */ + dec!(10) /* released */
            - dec!(10) /* loss */
            - dec!(0.1) /* entry fee 100*0.001 */
            - fee
    );
}

// ---------------------------------------------------------------------------
// S4: OCO pair; the take-profit fires first and the stop dies with it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_oco_take_profit_cancels_stop() {
    let stack = stack().await;
    stack
        .wallets
        .credit("u1", "USDT", dec!(1000))
        .await
        .unwrap();
    stack.wallets.credit("u2", "BTC", dec!(2)).await.unwrap();
    stack
        .wallets
        .credit("u3", "USDT", dec!(1000))
        .await
        .unwrap();

    stack.agg.apply_tick(tick("BTCUSDT", dec!(100)));
    stack
        .controller
        .place(PlaceOrder::limit("u2", "BTCUSDT", Side::Sell, dec!(100), dec!(1)))
        .await
        .unwrap();
    stack
        .controller
        .place(PlaceOrder::market("u1", "BTCUSDT", Side::Buy, dec!(1)).with_leverage(10, MarginMode::Cross))
        .await
        .unwrap();

    let mut tp = PlaceOrder::limit("u1", "BTCUSDT", Side::Sell, dec!(110), dec!(1));
    tp.order_type = OrderType::TakeProfit;
    tp.price = None;
    tp.stop_price = Some(dec!(110));
    tp.leverage = Some(10);
    tp.margin_mode = Some(MarginMode::Cross);
    tp.flags.reduce_only = true;

    let mut stop = tp.clone();
    stop.order_type = OrderType::Stop;
    stop.stop_price = Some(dec!(90));

    let (tp, stop) = stack.controller.place_oco(tp, stop).await.unwrap();
    assert_eq!(tp.oco_linked_id.as_deref(), Some(stop.order_id.as_str()));
    assert!(stack.triggers.is_armed(&tp.order_id));
    assert!(stack.triggers.is_armed(&stop.order_id));

    // bid for the take-profit to hit
    stack
        .controller
        .place(PlaceOrder::limit("u3", "BTCUSDT", Side::Buy, dec!(110), dec!(1)))
        .await
        .unwrap();

    stack.agg.apply_tick(tick("BTCUSDT", dec!(110)));
    run_triggers(&stack).await;

    let tp = stack.controller.get_order(&tp.order_id).unwrap();
    assert_eq!(tp.status, OrderStatus::Filled);
    let stop = stack.controller.get_order(&stop.order_id).unwrap();
    assert_eq!(stop.status, OrderStatus::Cancelled);
    assert!(!stack.triggers.is_armed(&stop.order_id));

    // a later drop through the old stop price fires nothing
    stack.agg.apply_tick(tick("BTCUSDT", dec!(90)));
    assert!(stack.triggers.scan(&stack.agg).is_empty());

    // position closed at a profit
    assert!(stack.positions.find_for("u1", "BTCUSDT").is_none());
}

// ---------------------------------------------------------------------------
// S5: liquidation ladder
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn s5_liquidation_partial_then_full() {
    let stack = stack().await;
    stack
        .wallets
        .credit("u1", "USDT", dec!(100))
        .await
        .unwrap();
    stack.wallets.credit("mm", "BTC", dec!(20)).await.unwrap();
    stack
        .wallets
        .credit("mm2", "USDT", dec!(10000))
        .await
        .unwrap();

    stack.agg.apply_tick(tick("BTCUSDT", dec!(100)));

    // maker provides the entry ask; u1 opens 10 BTC long at 100x
    stack
        .controller
        .place(PlaceOrder::limit("mm", "BTCUSDT", Side::Sell, dec!(100), dec!(10)))
        .await
        .unwrap();
    let entry = stack
        .controller
        .place(
            PlaceOrder::market("u1", "BTCUSDT", Side::Buy, dec!(10))
                .with_leverage(100, MarginMode::Cross),
        )
        .await
        .unwrap();
    assert_eq!(entry.status, OrderStatus::Filled);

    let position_id = {
        let handle = stack.positions.find_for("u1", "BTCUSDT").unwrap();
        let p = handle.lock().await;
        assert_eq!(p.margin, dec!(10));
        p.position_id.clone()
    };

    // mark slips; revalue and check the monitor classifies it
    stack.agg.apply_tick(tick("BTCUSDT", dec!(99.3)));
    stack.positions.refresh_marks(&stack.agg).await.unwrap();
    {
        let handle = stack.positions.handle(&position_id).unwrap();
        let p = handle.lock().await;
        // upnl = -7, equity = 3, maintenance = 0.004 * 993 = 3.972
        assert!(p.margin_ratio >= dec!(0.95));
    }

    // bid-side liquidity for the forced reduction
    stack
        .controller
        .place(PlaceOrder::limit("mm2", "BTCUSDT", Side::Buy, dec!(99), dec!(20)))
        .await
        .unwrap();

    let fund_before = stack.fund.balance();
    stack.liquidation.monitor_pass().await;
    assert_eq!(stack.liquidation.queue_len(), 1);
    stack.liquidation.processor_pass().await;
    // processing happens on a spawned task
    tokio::time::sleep(Duration::from_millis(200)).await;

    // ratio >= 0.90 rung: full reduction, position liquidated
    assert!(stack.positions.handle(&position_id).is_none());
    assert_eq!(stack.store.liquidation_count().unwrap(), 1);

    // the position was insolvent at exec 99: loss 10 = margin, so the fee
    // came out of the fund
    assert!(stack.fund.balance() < fund_before);
    assert!(stack.fund.check_invariant());

    // a second pass has nothing to do
    stack.liquidation.monitor_pass().await;
    assert_eq!(stack.liquidation.queue_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn s5b_forced_liquidation_uses_partial_rung() {
    let stack = stack().await;
    stack
        .wallets
        .credit("u1", "USDT", dec!(100))
        .await
        .unwrap();
    stack.wallets.credit("mm", "BTC", dec!(20)).await.unwrap();
    stack
        .wallets
        .credit("mm2", "USDT", dec!(10000))
        .await
        .unwrap();

    stack.agg.apply_tick(tick("BTCUSDT", dec!(100)));
    stack
        .controller
        .place(PlaceOrder::limit("mm", "BTCUSDT", Side::Sell, dec!(100), dec!(10)))
        .await
        .unwrap();
    stack
        .controller
        .place(
            PlaceOrder::market("u1", "BTCUSDT", Side::Buy, dec!(10))
                .with_leverage(100, MarginMode::Cross),
        )
        .await
        .unwrap();

    let position_id = {
        let handle = stack.positions.find_for("u1", "BTCUSDT").unwrap();
        let guard = handle.lock().await;
        guard.position_id.clone()
    };

    // drift to a ratio inside the 25% rung: at mark 99.49 the equity is
    // 4.9, maintenance 3.9796, ratio ~0.812
    stack.agg.apply_tick(tick("BTCUSDT", dec!(99.49)));
    stack.positions.refresh_marks(&stack.agg).await.unwrap();
    let ratio = {
        let handle = stack.positions.handle(&position_id).unwrap();
        let guard = handle.lock().await;
        guard.margin_ratio
    };
    assert!(ratio >= dec!(0.80) && ratio < dec!(0.85), "ratio {ratio}");

    stack
        .controller
        .place(PlaceOrder::limit("mm2", "BTCUSDT", Side::Buy, dec!(99), dec!(20)))
        .await
        .unwrap();

    assert!(stack.liquidation.force_enqueue(&position_id));
    stack.liquidation.processor_pass().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // 25% rung: quantity 10 -> 7.5, still open
    let handle = stack.positions.handle(&position_id).unwrap();
    let p = handle.lock().await;
    assert_eq!(p.quantity, dec!(7.5));
    assert_eq!(p.status, PositionStatus::Open);
    assert_eq!(stack.store.liquidation_count().unwrap(), 1);
}

// ---------------------------------------------------------------------------
// S6: feed failover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_failover_to_secondary_source() {
    let (events, mut rx) = broadcast::channel(256);
    let agg = PriceAggregator::new(
        vec!["binance".into(), "coinbase".into()],
        MarkPriceRule::Last,
        dec!(0.5),
        Duration::from_secs(30),
        50,
        events,
    );

    let (feed_tx, _feed_rx) = mpsc::channel(64);
    let binance = AdapterCore::new("binance", dec!(0.5), feed_tx.clone());
    let coinbase = AdapterCore::new("coinbase", dec!(0.5), feed_tx);
    agg.register_adapter(binance);
    agg.register_adapter(coinbase.clone());

    // binance ticked 12 s ago and its adapter is silent; coinbase is live
    let mut stale = tick("BTCUSDT", dec!(50000));
    stale.timestamp -= 12_000;
    agg.apply_tick(stale);
    let mut live = tick("BTCUSDT", dec!(50100));
    live.source = "coinbase".into();
    agg.apply_tick(live.clone());
    coinbase.record_tick(live);

    assert_eq!(
        agg.state("BTCUSDT").unwrap().primary_source.as_deref(),
        Some("binance")
    );

    agg.health_check();

    let state = agg.state("BTCUSDT").unwrap();
    assert_eq!(state.primary_source.as_deref(), Some("coinbase"));
    assert_eq!(agg.mark("BTCUSDT"), Some(dec!(50100)));

    let mut saw_failover = false;
    while let Ok(event) = rx.try_recv() {
        if let WsServerEvent::System { event, .. } = event {
            if event == "failover" {
                saw_failover = true;
            }
        }
    }
    assert!(saw_failover);
}

// ---------------------------------------------------------------------------
// Cross-cutting invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wallet_conservation_through_place_and_cancel() {
    let stack = stack().await;
    stack
        .wallets
        .credit("u1", "USDT", dec!(1000))
        .await
        .unwrap();

    let order = stack
        .controller
        .place(PlaceOrder::limit("u1", "BTCUSDT", Side::Buy, dec!(100), dec!(1)))
        .await
        .unwrap();
    // reservation: 100 * (1 + taker)
    assert_eq!(stack.wallets.locked("u1", "USDT").await, dec!(100.1));
    assert_eq!(stack.wallets.available("u1", "USDT").await, dec!(899.9));

    stack
        .controller
        .cancel(&order.order_id, "u1", "roundtrip")
        .await
        .unwrap();
    // net zero: book holds no trace, balance fully restored
    assert_eq!(stack.wallets.available("u1", "USDT").await, dec!(1000));
    assert_eq!(stack.wallets.locked("u1", "USDT").await, Decimal::ZERO);

    let balances = stack.wallets.balances("u1").await;
    for b in &balances {
        assert_eq!(b.total(), b.available + b.locked);
    }
}

#[tokio::test]
async fn self_trade_prevention_cancels_resting_order() {
    let stack = stack().await;
    stack.wallets.credit("u1", "BTC", dec!(1)).await.unwrap();
    stack
        .wallets
        .credit("u1", "USDT", dec!(1000))
        .await
        .unwrap();

    let sell = stack
        .controller
        .place(PlaceOrder::limit("u1", "BTCUSDT", Side::Sell, dec!(100), dec!(1)))
        .await
        .unwrap();

    // crossing own order: resting side cancelled, no trade printed
    let buy = stack
        .controller
        .place(PlaceOrder::limit("u1", "BTCUSDT", Side::Buy, dec!(100), dec!(1)))
        .await
        .unwrap();
    assert_eq!(buy.filled, Decimal::ZERO);
    assert_eq!(buy.status, OrderStatus::Open);

    let sell = stack.controller.get_order(&sell.order_id).unwrap();
    assert_eq!(sell.status, OrderStatus::Cancelled);
    assert!(stack.controller.recent_trades("BTCUSDT", 10).is_empty());
    // the cancelled sell's base came back
    assert_eq!(stack.wallets.available("u1", "BTC").await, dec!(1));
}

#[tokio::test]
async fn open_orders_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fluxtrade.db");

    let order_id = {
        let store = Arc::new(Store::open(&path).unwrap());
        let wallets = Arc::new(WalletLedger::new(store.clone(), Decimal::ZERO));
        wallets.credit("u1", "USDT", dec!(1000)).await.unwrap();
        wallets.reserve("u1", "USDT", dec!(100.1)).await.unwrap();

        let order = fluxtrade_backend::models::Order {
            order_id: "ORD-7-cafe".into(),
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(100)),
            stop_price: None,
            quantity: dec!(1),
            filled: Decimal::ZERO,
            remaining: dec!(1),
            average_fill_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: OrderStatus::Open,
            time_in_force: fluxtrade_backend::models::TimeInForce::Gtc,
            flags: Default::default(),
            oco_linked_id: None,
            trailing: None,
            leverage: None,
            margin_mode: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            triggered_at: None,
        };
        store.upsert_order(&order).unwrap();
        order.order_id.clone()
    };

    // reopen: the order and the wallet's locked reservation are still there
    let store = Arc::new(Store::open(&path).unwrap());
    let open = store.load_open_orders().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].order_id, order_id);
    assert_eq!(open[0].price, Some(dec!(100)));

    let wallets = Arc::new(WalletLedger::new(store, Decimal::ZERO));
    wallets.load().unwrap();
    assert_eq!(wallets.locked("u1", "USDT").await, dec!(100.1));
    assert_eq!(wallets.available("u1", "USDT").await, dec!(899.9));
}

#[tokio::test]
async fn maintenance_mode_rejects_placements() {
    let mut stack = stack().await;
    stack
        .wallets
        .credit("u1", "USDT", dec!(1000))
        .await
        .unwrap();

    stack.controller.set_maintenance(true);
    let err = stack
        .controller
        .place(PlaceOrder::limit("u1", "BTCUSDT", Side::Buy, dec!(100), dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        fluxtrade_backend::error::EngineError::MarketHalted(_)
    ));

    // the rejection produced an order_rejected event
    let mut saw_rejection = false;
    while let Ok(event) = stack.events_rx.try_recv() {
        if let WsServerEvent::OrderRejected { kind, .. } = event {
            assert_eq!(kind, "market_halted");
            saw_rejection = true;
        }
    }
    assert!(saw_rejection);

    stack.controller.set_maintenance(false);
    assert!(stack
        .controller
        .place(PlaceOrder::limit("u1", "BTCUSDT", Side::Buy, dec!(100), dec!(1)))
        .await
        .is_ok());
}
