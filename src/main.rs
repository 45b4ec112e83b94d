//! FluxTrade market engine binary.
//!
//! Composition root: wires the store, wallet ledger, symbol registry, feed
//! adapters, aggregator, matching workers, order controller, trigger
//! monitor, position manager, liquidation engine, risk monitor, and the
//! WebSocket fanout server, then runs until interrupted.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use fluxtrade_backend::{
    admin::AdminControl,
    auth::JwtHandler,
    config::Config,
    engine::{
        controller::OrderController,
        ids::IdGen,
        matching::FeeConfig,
        triggers::TriggerMonitor,
        worker::MatchingRouter,
    },
    feeds::{
        adapter::{self, AdapterCore},
        aggregator::PriceAggregator,
        binance::BinanceFeed,
        coinbase::CoinbaseFeed,
        kraken::KrakenFeed,
    },
    liquidation::{InsuranceFund, LiquidationConfig, LiquidationEngine},
    margin::PositionManager,
    markets::{BinanceCatalogue, StaticCatalogue, SymbolRegistry},
    models::WsServerEvent,
    risk::{RiskMonitor, RiskThresholds},
    storage::{Store, WalletLedger},
    ws::{ws_handler, FanoutConfig, FanoutState},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fluxtrade", about = "FluxTrade real-time market engine")]
struct Args {
    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path (overrides DATABASE_PATH).
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut cfg = Config::from_env()?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(database) = args.database {
        cfg.database_path = database;
    }

    info!("🚀 FluxTrade market engine starting");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;

    // --- durable state ---------------------------------------------------
    let store = Arc::new(Store::open(&cfg.database_path)?);
    let wallets = Arc::new(WalletLedger::new(store.clone(), cfg.demo_credit));
    wallets.load()?;

    // --- events ----------------------------------------------------------
    let (events, _keepalive) = broadcast::channel::<WsServerEvent>(4096);

    // --- symbol registry -------------------------------------------------
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build http client")?;
    let registry = Arc::new(SymbolRegistry::new(
        store.clone(),
        vec![
            Box::new(BinanceCatalogue::new(http_client.clone())),
            Box::new(StaticCatalogue::new(cfg.feed_priority.clone())),
        ],
    ));
    let loaded = registry.load()?;
    info!(loaded, "symbol registry loaded from store");
    registry.refresh().await;
    spawn_registry_refresh(registry.clone());

    // --- price feeds -----------------------------------------------------
    let (feed_tx, feed_rx) = mpsc::channel(8192);
    let agg = PriceAggregator::new(
        cfg.feed_priority.clone(),
        cfg.mark_price_rule,
        cfg.outlier_threshold,
        cfg.stale_after,
        cfg.failover_quality_floor,
        events.clone(),
    );

    for source in &cfg.feed_priority {
        let core = AdapterCore::new(source, cfg.outlier_threshold, feed_tx.clone());
        agg.register_adapter(core.clone());
        match source.as_str() {
            "binance" => adapter::spawn_push_adapter(
                Arc::new(BinanceFeed),
                core,
                registry.clone(),
                cfg.push_symbol_cap,
                cfg.max_reconnect_attempts,
            ),
            "coinbase" => adapter::spawn_push_adapter(
                Arc::new(CoinbaseFeed),
                core,
                registry.clone(),
                cfg.push_symbol_cap,
                cfg.max_reconnect_attempts,
            ),
            "kraken" => adapter::spawn_poll_adapter(
                Arc::new(KrakenFeed::new(http_client.clone())),
                core,
                registry.clone(),
                cfg.poll_symbol_cap,
                cfg.max_reconnect_attempts,
            ),
            other => warn!(source = other, "unknown feed source in FEED_PRIORITY; skipped"),
        }
    }
    agg.spawn(feed_rx, cfg.price_flush_interval, cfg.health_check_interval);

    // --- order path ------------------------------------------------------
    let ids = Arc::new(IdGen::new());
    let router = Arc::new(MatchingRouter::new(
        FeeConfig {
            maker_rate: cfg.maker_fee_rate,
            taker_rate: cfg.taker_fee_rate,
        },
        ids.clone(),
        cfg.order_timeout,
    ));
    for info in registry.list(true) {
        router.ensure(&info);
    }

    let positions = PositionManager::new(
        store.clone(),
        wallets.clone(),
        events.clone(),
        ids.clone(),
        cfg.liquidation_fee_rate,
    );
    let rehydrated_positions = positions.load()?;
    info!(rehydrated_positions, "open positions rehydrated");
    positions.spawn_mark_refresh(agg.clone(), cfg.position_refresh_interval);

    let (fired_tx, mut fired_rx) = mpsc::channel::<String>(1024);
    let triggers = TriggerMonitor::new(fired_tx);
    triggers.spawn(agg.clone(), cfg.trigger_interval);

    let controller = OrderController::new(
        registry.clone(),
        router.clone(),
        wallets.clone(),
        positions.clone(),
        triggers.clone(),
        agg.clone(),
        store.clone(),
        events.clone(),
        ids.clone(),
        cfg.maker_fee_rate,
        cfg.taker_fee_rate,
    );
    if let Err(e) = controller.rehydrate().await {
        warn!(error = %e, "order rehydration incomplete");
    }

    // fired triggers execute through the controller, in firing order
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            while let Some(order_id) = fired_rx.recv().await {
                if let Err(e) = controller.execute_triggered(&order_id).await {
                    warn!(order_id = %order_id, error = %e, "trigger execution failed");
                }
            }
        });
    }

    // --- liquidation & risk ----------------------------------------------
    let fund = Arc::new(InsuranceFund::new(
        store.clone(),
        cfg.insurance_fund_initial,
        cfg.insurance_fund_target,
    ));
    let liquidation = LiquidationEngine::new(
        positions.clone(),
        controller.clone(),
        wallets.clone(),
        fund.clone(),
        store.clone(),
        events.clone(),
        LiquidationConfig {
            margin_call_ratio: cfg.margin_call_ratio,
            liquidation_ratio: cfg.liquidation_ratio,
            adl_ratio: cfg.adl_ratio,
            fee_rate: cfg.liquidation_fee_rate,
            concurrency: cfg.liquidation_concurrency,
        },
    );
    liquidation.spawn(
        cfg.liquidation_monitor_interval,
        cfg.liquidation_processor_interval,
    );

    let risk = RiskMonitor::new(
        positions.clone(),
        store.clone(),
        events.clone(),
        ids.clone(),
        RiskThresholds {
            exposure_warning: cfg.risk_exposure_warning,
            exposure_critical: cfg.risk_exposure_critical,
            ..Default::default()
        },
    );
    risk.spawn(cfg.risk_scan_interval);

    // --- fanout server ---------------------------------------------------
    let admin = AdminControl::new(
        controller.clone(),
        router.clone(),
        registry.clone(),
        positions.clone(),
        liquidation.clone(),
        agg.clone(),
        events.clone(),
    );
    let fanout = Arc::new(FanoutState {
        cfg: FanoutConfig {
            max_symbols: cfg.max_symbols_per_session,
            max_channels: cfg.max_channels_per_session,
            max_inbound_per_sec: cfg.max_inbound_per_sec,
            send_queue_cap: cfg.session_send_queue_cap,
            price_throttle: cfg.price_throttle,
            idle_timeout: cfg.session_idle_timeout,
        },
        jwt: Arc::new(JwtHandler::new(cfg.jwt_secret.clone())),
        events: events.clone(),
        agg: agg.clone(),
        controller: controller.clone(),
        admin,
        active_sessions: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .layer(CorsLayer::permissive())
        .with_state(fanout);

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "📡 fanout server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(events.clone()))
        .await
        .context("serve")?;

    info!("shutdown complete");
    Ok(())
}

/// SIGINT drains sessions: broadcast maintenance, give in-flight work a
/// moment, then let the listener close.
async fn shutdown_signal(events: broadcast::Sender<WsServerEvent>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "shutdown signal listener failed");
        return;
    }
    warn!("interrupt received; stopping");
    let _ = events.send(WsServerEvent::System {
        event: "maintenance".into(),
        detail: "shutting down".into(),
        ts: chrono::Utc::now().timestamp_millis(),
    });
    tokio::time::sleep(Duration::from_secs(2)).await;
}

fn spawn_registry_refresh(registry: Arc<SymbolRegistry>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // immediate tick already consumed by boot refresh
        loop {
            tick.tick().await;
            registry.refresh().await;
        }
    });
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluxtrade_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
