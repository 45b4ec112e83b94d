//! Application configuration.
//!
//! Everything is an environment variable with a sane default so the engine
//! boots cold on a laptop. `.env` files are honoured via dotenv.

use crate::models::MarkPriceRule;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub jwt_secret: String,

    /// Feed source names in priority order (highest first).
    pub feed_priority: Vec<String>,
    /// Reject ticks deviating from the previous/mark price by more than this
    /// fraction (default 0.5 = 50%).
    pub outlier_threshold: Decimal,
    /// A source tick older than this is stale for primary selection.
    pub stale_after: Duration,
    pub mark_price_rule: MarkPriceRule,
    /// Throttled `price_update` flush cadence.
    pub price_flush_interval: Duration,
    /// Aggregator health check / failover cadence.
    pub health_check_interval: Duration,
    /// Failover when primary quality drops below this.
    pub failover_quality_floor: u8,
    /// Max symbols per push-stream adapter connection.
    pub push_symbol_cap: usize,
    /// Max symbols per poll adapter.
    pub poll_symbol_cap: usize,
    /// Abandon reconnecting after this many consecutive failures.
    pub max_reconnect_attempts: u32,

    /// Flat per-market fee rates.
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,

    /// Trigger monitor scan cadence.
    pub trigger_interval: Duration,
    /// Position mark refresh cadence.
    pub position_refresh_interval: Duration,
    /// Liquidation monitor / processor cadences.
    pub liquidation_monitor_interval: Duration,
    pub liquidation_processor_interval: Duration,
    pub liquidation_concurrency: usize,
    pub liquidation_fee_rate: Decimal,
    pub margin_call_ratio: Decimal,
    pub liquidation_ratio: Decimal,
    pub adl_ratio: Decimal,
    pub insurance_fund_initial: Decimal,
    pub insurance_fund_target: Decimal,

    /// Risk monitor cadence and thresholds.
    pub risk_scan_interval: Duration,
    pub risk_exposure_warning: Decimal,
    pub risk_exposure_critical: Decimal,

    /// Session fanout limits.
    pub max_symbols_per_session: usize,
    pub max_channels_per_session: usize,
    pub max_inbound_per_sec: u32,
    pub session_send_queue_cap: usize,
    pub price_throttle: Duration,
    pub session_idle_timeout: Duration,

    /// Order placement round-trip budget before the controller aborts.
    pub order_timeout: Duration,

    /// Credit new users this much quote currency (demo environments only;
    /// zero disables).
    pub demo_credit: Decimal,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).expect("default decimal"))
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let feed_priority = env::var("FEED_PRIORITY")
            .unwrap_or_else(|_| "binance,coinbase,kraken".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mark_price_rule = env::var("MARK_PRICE_RULE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(MarkPriceRule::Mid);

        Ok(Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./fluxtrade.db".to_string()),
            port: env_parse("PORT", 8080),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "fluxtrade-dev-secret".to_string()),

            feed_priority,
            outlier_threshold: env_decimal("OUTLIER_THRESHOLD", "0.5"),
            stale_after: env_millis("STALE_AFTER_MS", 5_000),
            mark_price_rule,
            price_flush_interval: env_millis("PRICE_FLUSH_MS", 1_000),
            health_check_interval: env_millis("HEALTH_CHECK_MS", 30_000),
            failover_quality_floor: env_parse("FAILOVER_QUALITY_FLOOR", 50),
            push_symbol_cap: env_parse("PUSH_SYMBOL_CAP", 100),
            poll_symbol_cap: env_parse("POLL_SYMBOL_CAP", 500),
            max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", 10),

            maker_fee_rate: env_decimal("MAKER_FEE_RATE", "0.0002"),
            taker_fee_rate: env_decimal("TAKER_FEE_RATE", "0.001"),

            trigger_interval: env_millis("TRIGGER_INTERVAL_MS", 500),
            position_refresh_interval: env_millis("POSITION_REFRESH_MS", 1_000),
            liquidation_monitor_interval: env_millis("LIQ_MONITOR_MS", 1_000),
            liquidation_processor_interval: env_millis("LIQ_PROCESSOR_MS", 500),
            liquidation_concurrency: env_parse("LIQ_CONCURRENCY", 10),
            liquidation_fee_rate: env_decimal("LIQ_FEE_RATE", "0.005"),
            margin_call_ratio: env_decimal("MARGIN_CALL_RATIO", "0.70"),
            liquidation_ratio: env_decimal("LIQUIDATION_RATIO", "0.95"),
            adl_ratio: env_decimal("ADL_RATIO", "0.98"),
            insurance_fund_initial: env_decimal("INSURANCE_FUND_INITIAL", "1000000"),
            insurance_fund_target: env_decimal("INSURANCE_FUND_TARGET", "5000000"),

            risk_scan_interval: env_millis("RISK_SCAN_MS", 5_000),
            risk_exposure_warning: env_decimal("RISK_EXPOSURE_WARNING", "50000000"),
            risk_exposure_critical: env_decimal("RISK_EXPOSURE_CRITICAL", "200000000"),

            max_symbols_per_session: env_parse("MAX_SYMBOLS_PER_SESSION", 50),
            max_channels_per_session: env_parse("MAX_CHANNELS_PER_SESSION", 100),
            max_inbound_per_sec: env_parse("MAX_INBOUND_PER_SEC", 100),
            session_send_queue_cap: env_parse("SESSION_SEND_QUEUE_CAP", 1_000),
            price_throttle: env_millis("PRICE_THROTTLE_MS", 100),
            session_idle_timeout: env_millis("SESSION_IDLE_TIMEOUT_MS", 300_000),

            order_timeout: env_millis("ORDER_TIMEOUT_MS", 2_000),

            demo_credit: env_decimal("DEMO_CREDIT", "0"),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env().expect("default config")
    }
}
