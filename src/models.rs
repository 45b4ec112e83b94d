//! Core domain types shared across the engine.
//!
//! All monetary quantities are `rust_decimal::Decimal`; the engine never uses
//! binary floating point for persisted values. Tick timestamps are UTC
//! milliseconds, wall-clock fields are `chrono::DateTime<Utc>`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Price = Decimal;
pub type Qty = Decimal;

/// Upstream source identifier ("binance", "coinbase", "kraken", ...).
pub type SourceId = String;

// ============================================================================
// Symbols
// ============================================================================

/// A tradable pair and its exchange constraints. Owned by the symbol
/// registry; immutable except `enabled` and `rank`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    /// Sources that list this symbol, in priority order.
    pub enabled_sources: Vec<SourceId>,
    pub rank: u32,
    pub enabled: bool,
}

impl SymbolInfo {
    /// Upstream identifier for a source, if the symbol is listed there.
    pub fn source_symbol(&self, source: &str) -> Option<String> {
        if !self.enabled_sources.iter().any(|s| s == source) {
            return None;
        }
        // Coinbase uses dash-separated product ids; everyone else takes the
        // canonical concatenated form.
        Some(match source {
            "coinbase" => format!("{}-{}", self.base, self.quote),
            _ => self.symbol.clone(),
        })
    }
}

// ============================================================================
// Price feed
// ============================================================================

/// One normalised tick from an upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub last: Price,
    pub bid: Price,
    pub ask: Price,
    pub bid_size: Qty,
    pub ask_size: Qty,
    pub volume_24h: Qty,
    pub quote_volume_24h: Decimal,
    /// UTC milliseconds.
    pub timestamp: i64,
    pub source: SourceId,
    pub sequence: u64,
}

impl PriceTick {
    /// Structural invariants every tick must satisfy before it is accepted.
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO
            && self.ask > Decimal::ZERO
            && self.bid < self.ask
            && self.last > Decimal::ZERO
    }

    pub fn mid(&self) -> Price {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// How the aggregator derives the mark price from the primary source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkPriceRule {
    /// Primary source's last trade price.
    Last,
    /// Midpoint of primary bid/ask.
    Mid,
    /// Volume-weighted across all fresh sources.
    Vwap,
}

impl std::str::FromStr for MarkPriceRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "last" => Ok(Self::Last),
            "mid" => Ok(Self::Mid),
            "vwap" => Ok(Self::Vwap),
            other => Err(format!("unknown mark price rule: {other}")),
        }
    }
}

/// Connection lifecycle of a feed adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Error,
}

/// Health snapshot reported by every feed adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: SourceId,
    pub status: ConnectionStatus,
    pub connected: bool,
    pub last_heartbeat: Option<i64>,
    pub last_data_ts: Option<i64>,
    pub msgs_per_sec: f64,
    pub errors: u64,
    pub reconnects: u64,
    pub uptime_secs: u64,
    /// 0-100, decays with staleness and error rate.
    pub quality: u8,
}

// ============================================================================
// Orders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TakeProfit,
    TrailingStop,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TakeProfit => "take_profit",
            OrderType::TrailingStop => "trailing_stop",
        }
    }

    /// Orders parked with the trigger monitor rather than routed straight to
    /// the matching engine.
    pub fn is_triggerable(self) -> bool {
        matches!(
            self,
            OrderType::Stop | OrderType::StopLimit | OrderType::TakeProfit | OrderType::TrailingStop
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    /// Whether the order can still trade or be cancelled.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
    #[serde(rename = "PostOnly")]
    PostOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFlags {
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
        }
    }
}

/// Trailing stop runtime state, owned by the trigger monitor while armed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingState {
    /// Trailing only starts once the mark trades through this price.
    pub activation_price: Option<Price>,
    /// Fractional callback, e.g. 0.01 for 1%.
    pub callback_rate: Option<Decimal>,
    /// Absolute offset alternative to `callback_rate`.
    pub abs_offset: Option<Decimal>,
    /// Best favourable mark observed since arming.
    pub high_water_mark: Price,
    pub armed: bool,
}

/// A user order. Owned by the order controller; mutated only through
/// matching or cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub stop_price: Option<Price>,
    pub quantity: Qty,
    pub filled: Qty,
    pub remaining: Qty,
    pub average_fill_price: Price,
    pub fees: Decimal,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub flags: OrderFlags,
    /// Sibling order id when this order is one leg of an OCO pair.
    pub oco_linked_id: Option<String>,
    pub trailing: Option<TrailingState>,
    pub leverage: Option<u32>,
    pub margin_mode: Option<MarginMode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl Order {
    /// `filled + remaining = quantity`, and the fill-average/status couplings.
    pub fn check_invariants(&self) -> bool {
        self.filled + self.remaining == self.quantity
            && (self.filled > Decimal::ZERO || self.average_fill_price == Decimal::ZERO)
            && ((self.status == OrderStatus::Filled) == (self.remaining == Decimal::ZERO))
    }

    /// Fold one fill into the running average and quantities.
    pub fn apply_fill(&mut self, price: Price, qty: Qty, fee: Decimal) {
        let prev_notional = self.average_fill_price * self.filled;
        self.filled += qty;
        self.remaining -= qty;
        if self.filled > Decimal::ZERO {
            self.average_fill_price = (prev_notional + price * qty) / self.filled;
        }
        self.fees += fee;
        self.status = if self.remaining == Decimal::ZERO {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = Utc::now();
    }
}

/// One side of a match, append-only per order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub counter_order_id: String,
    pub price: Price,
    pub quantity: Qty,
    pub fee: Decimal,
    pub fee_asset: String,
    pub is_maker: bool,
    pub ts: DateTime<Utc>,
}

/// A public trade produced by one match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub symbol: String,
    pub price: Price,
    pub quantity: Qty,
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub is_buyer_maker: bool,
    pub ts: DateTime<Utc>,
}

// ============================================================================
// Positions & margin
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// The order side that increases a position on this side.
    pub fn entry_order_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Liquidating,
    Liquidated,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
            PositionStatus::Liquidating => "liquidating",
            PositionStatus::Liquidated => "liquidated",
        }
    }
}

/// Margin-ratio bands used for alerts and the liquidation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Warning,
    Danger,
    Critical,
    Liquidation,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Warning => "warning",
            RiskLevel::Danger => "danger",
            RiskLevel::Critical => "critical",
            RiskLevel::Liquidation => "liquidation",
        }
    }
}

/// A leveraged position. Owned by the position manager; the liquidation
/// engine mutates it only through the reducing-order path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub margin_mode: MarginMode,
    pub quantity: Qty,
    pub entry_price: Price,
    pub mark_price: Price,
    pub liquidation_price: Price,
    pub bankruptcy_price: Price,
    pub leverage: u32,
    pub margin: Decimal,
    pub maintenance_margin: Decimal,
    pub margin_ratio: Decimal,
    pub isolated_margin: Option<Decimal>,
    pub unrealised_pnl: Decimal,
    pub realised_pnl: Decimal,
    pub risk_level: RiskLevel,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.mark_price
    }

    pub fn equity(&self) -> Decimal {
        self.margin + self.unrealised_pnl
    }
}

/// One rung of the partial-liquidation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationLevel {
    /// Cancel the user's open orders on the symbol only.
    CancelOrders,
    /// Reduce 25% via market order.
    Reduce25,
    /// Reduce 50% via market order.
    Reduce50,
    /// Reduce the full remaining quantity.
    Full,
}

impl LiquidationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LiquidationLevel::CancelOrders => "cancel_orders",
            LiquidationLevel::Reduce25 => "reduce_25",
            LiquidationLevel::Reduce50 => "reduce_50",
            LiquidationLevel::Full => "full",
        }
    }
}

/// Append-only record of one liquidation reduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub position_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Qty,
    pub exec_price: Price,
    pub mark_price: Price,
    pub loss: Decimal,
    pub fee: Decimal,
    pub insurance_fund_delta: Decimal,
    pub ts: DateTime<Utc>,
    pub level: LiquidationLevel,
    pub partial: bool,
}

// ============================================================================
// Wallets
// ============================================================================

/// Per-asset balance. Invariant: `total = available + locked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn zero(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

// ============================================================================
// Risk monitor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub alert_id: String,
    pub severity: AlertSeverity,
    pub code: String,
    pub message: String,
    pub context: HashMap<String, String>,
    pub ts: DateTime<Utc>,
}

/// System-wide exposure aggregates computed by the risk monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub total_exposure: Decimal,
    pub total_margin: Decimal,
    pub total_unrealised_pnl: Decimal,
    pub open_positions: usize,
    pub positions_near_liquidation: usize,
    pub exposure_per_symbol: HashMap<String, Decimal>,
    pub exposure_per_user: HashMap<String, Decimal>,
    pub ts: i64,
}

/// Stress-test scenario: shift marks, scale volumes, count the fallout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressScenario {
    /// symbol -> fractional shift, e.g. -0.2 for a 20% drop.
    pub price_shifts: HashMap<String, Decimal>,
    pub duration_min: u32,
    pub volume_mul: Decimal,
    pub volatility_mul: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StressReport {
    pub positions_evaluated: usize,
    pub liquidations: usize,
    pub total_loss: Decimal,
    pub worst_symbol: Option<String>,
    pub per_symbol_loss: HashMap<String, Decimal>,
}

// ============================================================================
// Fanout protocol
// ============================================================================

/// Channels a session can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "channel", content = "symbol")]
pub enum Channel {
    PriceTicker(String),
    PriceDepth(String),
    PriceTrades(String),
    UserOrders,
    UserPositions,
    UserWallet,
    UserAlerts,
}

impl Channel {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Channel::PriceTicker(s) | Channel::PriceDepth(s) | Channel::PriceTrades(s) => Some(s),
            _ => None,
        }
    }

    /// User-scoped channels require an authenticated session.
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            Channel::UserOrders | Channel::UserPositions | Channel::UserWallet | Channel::UserAlerts
        )
    }
}

/// Compact price record pushed to price subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub mark: Price,
    pub bid: Price,
    pub ask: Price,
    pub last: Price,
    pub volume_24h: Qty,
    pub source: SourceId,
    pub ts: i64,
}

/// Inbound session messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WsClientMessage {
    Subscribe {
        #[serde(default)]
        symbols: Vec<String>,
        #[serde(default)]
        channels: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        symbols: Vec<String>,
        #[serde(default)]
        channels: Vec<String>,
    },
    Ping {
        #[serde(default)]
        timestamp: i64,
    },
    AdminCommand {
        command: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// Outbound events, serialised as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerEvent {
    Welcome {
        session_id: String,
        authenticated: bool,
        max_symbols: usize,
        max_channels: usize,
    },
    Subscribed {
        channels: Vec<Channel>,
    },
    Unsubscribed {
        channels: Vec<Channel>,
    },
    PriceUpdate(Vec<PriceUpdate>),
    PriceSnapshot {
        symbol: String,
        update: Option<PriceUpdate>,
        /// Visible book, best first, as `(price, quantity)` rows.
        bids: Vec<(Price, Qty)>,
        asks: Vec<(Price, Qty)>,
        trades: Vec<Trade>,
    },
    Trade(Trade),
    OrderUpdate(Order),
    OrderRejected {
        kind: String,
        message: String,
        context: HashMap<String, String>,
    },
    PositionUpdate(Position),
    WalletUpdate {
        user_id: String,
        balances: Vec<Balance>,
    },
    MarginCall {
        position_id: String,
        user_id: String,
        symbol: String,
        margin_ratio: Decimal,
    },
    RiskAlert(RiskAlert),
    System {
        event: String,
        detail: String,
        ts: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl WsServerEvent {
    /// User the event is scoped to, if any. Public events return `None`.
    pub fn user_scope(&self) -> Option<&str> {
        match self {
            WsServerEvent::OrderUpdate(o) => Some(&o.user_id),
            WsServerEvent::OrderRejected { context, .. } => {
                context.get("user_id").map(|s| s.as_str())
            }
            WsServerEvent::PositionUpdate(p) => Some(&p.user_id),
            WsServerEvent::WalletUpdate { user_id, .. } => Some(user_id),
            WsServerEvent::MarginCall { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}
