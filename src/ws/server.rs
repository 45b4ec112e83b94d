//! Session fanout.
//!
//! One WebSocket route; every connection becomes a session with its own
//! subscription set, inbound rate budget, and per-symbol price throttle
//! with last-writer-wins coalescing. Events arrive on the engine's
//! broadcast channel; each session task filters them against its
//! subscriptions. System events bypass subscriptions entirely.

use crate::admin::AdminControl;
use crate::auth::jwt::{JwtHandler, UserRole};
use crate::engine::controller::OrderController;
use crate::feeds::aggregator::PriceAggregator;
use crate::models::{Channel, PriceUpdate, WsClientMessage, WsServerEvent};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::Response,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub max_symbols: usize,
    pub max_channels: usize,
    pub max_inbound_per_sec: u32,
    pub send_queue_cap: usize,
    pub price_throttle: Duration,
    pub idle_timeout: Duration,
}

pub struct FanoutState {
    pub cfg: FanoutConfig,
    pub jwt: Arc<JwtHandler>,
    pub events: broadcast::Sender<WsServerEvent>,
    pub agg: Arc<PriceAggregator>,
    pub controller: Arc<OrderController>,
    pub admin: Arc<AdminControl>,
    pub active_sessions: AtomicUsize,
}

#[derive(Deserialize)]
pub struct WsQuery {
    /// Optional bearer token; anonymous sessions get public streams only.
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<FanoutState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

/// Per-connection state, separated from the socket so routing and limits
/// are testable without I/O.
pub struct Session {
    pub session_id: String,
    pub user_id: Option<String>,
    pub is_admin: bool,
    cfg: FanoutConfig,
    subscriptions: HashSet<Channel>,
    pub last_activity: Instant,
    pub messages_sent: u64,
    /// symbol -> when a price message last went out.
    last_sent: HashMap<String, Instant>,
    /// symbol -> coalesced update awaiting the throttle window.
    pending_prices: HashMap<String, PriceUpdate>,
    /// inbound messages in the current one-second window.
    inbound_window: (Instant, u32),
}

impl Session {
    pub fn new(cfg: FanoutConfig, user_id: Option<String>, is_admin: bool) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id,
            is_admin,
            cfg,
            subscriptions: HashSet::new(),
            last_activity: Instant::now(),
            messages_sent: 0,
            last_sent: HashMap::new(),
            pending_prices: HashMap::new(),
            inbound_window: (Instant::now(), 0),
        }
    }

    pub fn authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// Count one inbound message against the rate budget. Returns false
    /// when the session must be disconnected.
    pub fn allow_inbound(&mut self, now: Instant) -> bool {
        self.last_activity = now;
        let (window_start, count) = &mut self.inbound_window;
        if now.duration_since(*window_start) >= Duration::from_secs(1) {
            *window_start = now;
            *count = 0;
        }
        *count += 1;
        *count <= self.cfg.max_inbound_per_sec
    }

    pub fn idle_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > self.cfg.idle_timeout
    }

    /// Apply a subscribe request. Returns the accepted channels or an error
    /// string when a limit or permission blocks the whole request.
    pub fn subscribe(&mut self, channels: Vec<Channel>) -> Result<Vec<Channel>, String> {
        for ch in &channels {
            if ch.is_user_scoped() && !self.authenticated() {
                return Err("authentication required for user streams".into());
            }
        }

        let mut next = self.subscriptions.clone();
        next.extend(channels.iter().cloned());

        let symbols: HashSet<&str> = next.iter().filter_map(|c| c.symbol()).collect();
        if symbols.len() > self.cfg.max_symbols {
            return Err(format!(
                "symbol limit exceeded ({} max)",
                self.cfg.max_symbols
            ));
        }
        if next.len() > self.cfg.max_channels {
            return Err(format!(
                "channel limit exceeded ({} max)",
                self.cfg.max_channels
            ));
        }

        let added: Vec<Channel> = channels
            .into_iter()
            .filter(|c| self.subscriptions.insert(c.clone()))
            .collect();
        Ok(added)
    }

    pub fn unsubscribe(&mut self, channels: Vec<Channel>) -> Vec<Channel> {
        channels
            .into_iter()
            .filter(|c| self.subscriptions.remove(c))
            .collect()
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.subscriptions.contains(channel)
    }

    /// Route one broadcast event through this session's subscriptions and
    /// throttles. Returns the messages to send now.
    pub fn route_event(&mut self, event: WsServerEvent, now: Instant) -> Vec<WsServerEvent> {
        match event {
            WsServerEvent::PriceUpdate(batch) => {
                let mut due = Vec::new();
                for update in batch {
                    let ticker = Channel::PriceTicker(update.symbol.clone());
                    if !self.subscriptions.contains(&ticker) {
                        continue;
                    }
                    let throttled = self
                        .last_sent
                        .get(&update.symbol)
                        .is_some_and(|t| now.duration_since(*t) < self.cfg.price_throttle);
                    if throttled {
                        // last writer wins until the window reopens
                        self.pending_prices.insert(update.symbol.clone(), update);
                    } else {
                        self.last_sent.insert(update.symbol.clone(), now);
                        due.push(update);
                    }
                }
                if due.is_empty() {
                    Vec::new()
                } else {
                    self.messages_sent += 1;
                    vec![WsServerEvent::PriceUpdate(due)]
                }
            }
            WsServerEvent::Trade(trade) => {
                let channel = Channel::PriceTrades(trade.symbol.clone());
                if self.subscriptions.contains(&channel) {
                    self.messages_sent += 1;
                    vec![WsServerEvent::Trade(trade)]
                } else {
                    Vec::new()
                }
            }
            WsServerEvent::System { .. } => {
                // system events reach every session regardless of
                // subscriptions
                self.messages_sent += 1;
                vec![event]
            }
            WsServerEvent::RiskAlert(_) => {
                if self.is_admin {
                    self.messages_sent += 1;
                    vec![event]
                } else {
                    Vec::new()
                }
            }
            other => {
                let Some(scope) = other.user_scope() else {
                    return Vec::new();
                };
                if self.user_id.as_deref() != Some(scope) {
                    return Vec::new();
                }
                let wanted = match &other {
                    WsServerEvent::OrderUpdate(_) | WsServerEvent::OrderRejected { .. } => {
                        self.subscriptions.contains(&Channel::UserOrders)
                    }
                    WsServerEvent::PositionUpdate(_) => {
                        self.subscriptions.contains(&Channel::UserPositions)
                    }
                    WsServerEvent::WalletUpdate { .. } => {
                        self.subscriptions.contains(&Channel::UserWallet)
                    }
                    WsServerEvent::MarginCall { .. } => {
                        self.subscriptions.contains(&Channel::UserAlerts)
                    }
                    _ => false,
                };
                if wanted {
                    self.messages_sent += 1;
                    vec![other]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Drain coalesced price updates whose throttle window has reopened.
    pub fn flush_due_prices(&mut self, now: Instant) -> Option<WsServerEvent> {
        if self.pending_prices.is_empty() {
            return None;
        }
        let due_symbols: Vec<String> = self
            .pending_prices
            .keys()
            .filter(|symbol| {
                self.last_sent
                    .get(*symbol)
                    .map_or(true, |t| now.duration_since(*t) >= self.cfg.price_throttle)
            })
            .cloned()
            .collect();
        if due_symbols.is_empty() {
            return None;
        }
        let mut batch = Vec::with_capacity(due_symbols.len());
        for symbol in due_symbols {
            if let Some(update) = self.pending_prices.remove(&symbol) {
                self.last_sent.insert(symbol, now);
                batch.push(update);
            }
        }
        self.messages_sent += 1;
        Some(WsServerEvent::PriceUpdate(batch))
    }
}

/// Turn a subscribe/unsubscribe request into concrete channels. Price
/// channels pair with each listed symbol; bare symbols default to the
/// ticker stream.
pub fn parse_channels(symbols: &[String], channels: &[String]) -> Result<Vec<Channel>, String> {
    let mut out = Vec::new();
    let channel_names: Vec<&str> = if channels.is_empty() && !symbols.is_empty() {
        vec!["price_ticker"]
    } else {
        channels.iter().map(String::as_str).collect()
    };

    for name in channel_names {
        match name {
            "price_ticker" | "price_depth" | "price_trades" => {
                if symbols.is_empty() {
                    return Err(format!("channel {name} requires symbols"));
                }
                for symbol in symbols {
                    out.push(match name {
                        "price_ticker" => Channel::PriceTicker(symbol.clone()),
                        "price_depth" => Channel::PriceDepth(symbol.clone()),
                        _ => Channel::PriceTrades(symbol.clone()),
                    });
                }
            }
            "user_orders" => out.push(Channel::UserOrders),
            "user_positions" => out.push(Channel::UserPositions),
            "user_wallet" => out.push(Channel::UserWallet),
            "user_alerts" => out.push(Channel::UserAlerts),
            other => return Err(format!("unknown channel: {other}")),
        }
    }
    Ok(out)
}

async fn handle_socket(mut socket: WebSocket, state: Arc<FanoutState>, token: Option<String>) {
    let (user_id, is_admin) = match token.as_deref() {
        Some(token) => match state.jwt.validate_token(token) {
            Ok(claims) => (Some(claims.sub), claims.role == UserRole::Admin),
            Err(e) => {
                debug!(error = %e, "session token rejected; continuing anonymous");
                (None, false)
            }
        },
        None => (None, false),
    };

    let mut session = Session::new(state.cfg.clone(), user_id, is_admin);
    let mut rx = state.events.subscribe();
    state.active_sessions.fetch_add(1, Ordering::Relaxed);
    metrics::gauge!(
        "fanout_active_sessions",
        state.active_sessions.load(Ordering::Relaxed) as f64
    );
    info!(
        session_id = %session.session_id,
        authenticated = session.authenticated(),
        "session connected"
    );

    let welcome = WsServerEvent::Welcome {
        session_id: session.session_id.clone(),
        authenticated: session.authenticated(),
        max_symbols: state.cfg.max_symbols,
        max_channels: state.cfg.max_channels,
    };
    if send_event(&mut socket, &welcome).await.is_err() {
        finish_session(&state, &session);
        return;
    }

    let mut flush = tokio::time::interval(state.cfg.price_throttle.max(Duration::from_millis(10)));
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut idle_check = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        for out in session.route_event(event, Instant::now()) {
                            if send_event(&mut socket, &out).await.is_err() {
                                finish_session(&state, &session);
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if n as usize > state.cfg.send_queue_cap {
                            warn!(
                                session_id = %session.session_id,
                                lagged = n,
                                "session too slow; disconnecting"
                            );
                            let _ = send_event(&mut socket, &WsServerEvent::Error {
                                code: "slow_consumer".into(),
                                message: "send queue overflow".into(),
                            }).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = flush.tick() => {
                if let Some(batch) = session.flush_due_prices(Instant::now()) {
                    if send_event(&mut socket, &batch).await.is_err() {
                        break;
                    }
                }
            }
            _ = idle_check.tick() => {
                if session.idle_expired(Instant::now()) {
                    debug!(session_id = %session.session_id, "idle session dropped");
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        if !session.allow_inbound(Instant::now()) {
                            warn!(session_id = %session.session_id, "inbound rate exceeded");
                            let _ = send_event(&mut socket, &WsServerEvent::Error {
                                code: "rate_limited".into(),
                                message: "inbound message rate exceeded".into(),
                            }).await;
                            break;
                        }
                        if handle_client_message(&text, &mut session, &state, &mut socket).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    finish_session(&state, &session);
}

fn finish_session(state: &FanoutState, session: &Session) {
    state.active_sessions.fetch_sub(1, Ordering::Relaxed);
    info!(
        session_id = %session.session_id,
        sent = session.messages_sent,
        "session closed"
    );
}

async fn send_event(socket: &mut WebSocket, event: &WsServerEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!(error = %e, "event serialisation failed");
        "{}".to_string()
    });
    socket.send(Message::Text(text)).await
}

async fn handle_client_message(
    text: &str,
    session: &mut Session,
    state: &Arc<FanoutState>,
    socket: &mut WebSocket,
) -> Result<(), axum::Error> {
    let msg: WsClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return send_event(
                socket,
                &WsServerEvent::Error {
                    code: "bad_request".into(),
                    message: format!("unparseable message: {e}"),
                },
            )
            .await;
        }
    };

    match msg {
        WsClientMessage::Subscribe { symbols, channels } => {
            let parsed = match parse_channels(&symbols, &channels) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return send_event(
                        socket,
                        &WsServerEvent::Error {
                            code: "bad_subscription".into(),
                            message: e,
                        },
                    )
                    .await;
                }
            };
            match session.subscribe(parsed) {
                Ok(added) => {
                    // snapshot newly subscribed price symbols so the client
                    // never starts empty
                    let snapshot_symbols: Vec<String> = added
                        .iter()
                        .filter_map(|c| c.symbol().map(str::to_string))
                        .collect::<HashSet<_>>()
                        .into_iter()
                        .collect();
                    send_event(socket, &WsServerEvent::Subscribed { channels: added }).await?;
                    for symbol in snapshot_symbols {
                        let (bids, asks) = state
                            .controller
                            .depth(&symbol, 20)
                            .await
                            .unwrap_or_default();
                        let snapshot = WsServerEvent::PriceSnapshot {
                            update: state.agg.price_update_for(&symbol),
                            bids,
                            asks,
                            trades: state.controller.recent_trades(&symbol, 50),
                            symbol,
                        };
                        send_event(socket, &snapshot).await?;
                    }
                }
                Err(e) => {
                    send_event(
                        socket,
                        &WsServerEvent::Error {
                            code: "subscription_limit".into(),
                            message: e,
                        },
                    )
                    .await?;
                }
            }
        }
        WsClientMessage::Unsubscribe { symbols, channels } => {
            let parsed = parse_channels(&symbols, &channels).unwrap_or_default();
            let removed = session.unsubscribe(parsed);
            send_event(socket, &WsServerEvent::Unsubscribed { channels: removed }).await?;
        }
        WsClientMessage::Ping { timestamp } => {
            send_event(socket, &WsServerEvent::Pong { timestamp }).await?;
        }
        WsClientMessage::AdminCommand { command, params } => {
            if !session.is_admin {
                return send_event(
                    socket,
                    &WsServerEvent::Error {
                        code: "forbidden".into(),
                        message: "admin role required".into(),
                    },
                )
                .await;
            }
            match state.admin.handle_command(&command, params).await {
                Ok(detail) => {
                    send_event(
                        socket,
                        &WsServerEvent::System {
                            event: format!("admin.{command}"),
                            detail: detail.to_string(),
                            ts: chrono::Utc::now().timestamp_millis(),
                        },
                    )
                    .await?;
                }
                Err(e) => {
                    send_event(
                        socket,
                        &WsServerEvent::Error {
                            code: e.kind().to_string(),
                            message: e.to_string(),
                        },
                    )
                    .await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> FanoutConfig {
        FanoutConfig {
            max_symbols: 3,
            max_channels: 8,
            max_inbound_per_sec: 5,
            send_queue_cap: 1000,
            price_throttle: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(300),
        }
    }

    fn price(symbol: &str, last: rust_decimal::Decimal) -> PriceUpdate {
        PriceUpdate {
            symbol: symbol.into(),
            mark: last,
            bid: last - dec!(1),
            ask: last + dec!(1),
            last,
            volume_24h: dec!(10),
            source: "binance".into(),
            ts: 0,
        }
    }

    #[test]
    fn test_parse_channels_defaults_to_ticker() {
        let channels = parse_channels(&["BTCUSDT".into()], &[]).unwrap();
        assert_eq!(channels, vec![Channel::PriceTicker("BTCUSDT".into())]);

        let channels = parse_channels(
            &["BTCUSDT".into(), "ETHUSDT".into()],
            &["price_trades".into(), "user_orders".into()],
        )
        .unwrap();
        assert_eq!(channels.len(), 3);
        assert!(channels.contains(&Channel::UserOrders));

        assert!(parse_channels(&[], &["price_depth".into()]).is_err());
        assert!(parse_channels(&[], &["nope".into()]).is_err());
    }

    #[test]
    fn test_anonymous_cannot_subscribe_user_streams() {
        let mut session = Session::new(cfg(), None, false);
        let err = session.subscribe(vec![Channel::UserOrders]).unwrap_err();
        assert!(err.contains("authentication"));

        let mut authed = Session::new(cfg(), Some("u1".into()), false);
        assert!(authed.subscribe(vec![Channel::UserOrders]).is_ok());
    }

    #[test]
    fn test_symbol_and_channel_limits() {
        let mut session = Session::new(cfg(), None, false);
        let too_many: Vec<Channel> = (0..4)
            .map(|i| Channel::PriceTicker(format!("SYM{i}USDT")))
            .collect();
        assert!(session.subscribe(too_many).is_err());

        // exactly at the symbol cap is fine
        let ok: Vec<Channel> = (0..3)
            .map(|i| Channel::PriceTicker(format!("SYM{i}USDT")))
            .collect();
        assert_eq!(session.subscribe(ok).unwrap().len(), 3);
    }

    #[test]
    fn test_route_price_update_filters_and_throttles() {
        let mut session = Session::new(cfg(), None, false);
        session
            .subscribe(vec![Channel::PriceTicker("BTCUSDT".into())])
            .unwrap();

        let now = Instant::now();
        // subscribed symbol passes, unsubscribed is dropped
        let out = session.route_event(
            WsServerEvent::PriceUpdate(vec![price("BTCUSDT", dec!(100)), price("ETHUSDT", dec!(5))]),
            now,
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            WsServerEvent::PriceUpdate(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].symbol, "BTCUSDT");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // a second update inside the throttle window coalesces
        let out = session.route_event(
            WsServerEvent::PriceUpdate(vec![price("BTCUSDT", dec!(101))]),
            now + Duration::from_millis(10),
        );
        assert!(out.is_empty());
        let out = session.route_event(
            WsServerEvent::PriceUpdate(vec![price("BTCUSDT", dec!(102))]),
            now + Duration::from_millis(20),
        );
        assert!(out.is_empty());

        // nothing due before the window reopens
        assert!(session
            .flush_due_prices(now + Duration::from_millis(50))
            .is_none());

        // after the window: only the last write survives
        match session
            .flush_due_prices(now + Duration::from_millis(150))
            .unwrap()
        {
            WsServerEvent::PriceUpdate(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].last, dec!(102));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_user_scoped_events_require_matching_user() {
        let mut session = Session::new(cfg(), Some("u1".into()), false);
        session.subscribe(vec![Channel::UserWallet]).unwrap();

        let mine = WsServerEvent::WalletUpdate {
            user_id: "u1".into(),
            balances: vec![],
        };
        let theirs = WsServerEvent::WalletUpdate {
            user_id: "u2".into(),
            balances: vec![],
        };
        let now = Instant::now();
        assert_eq!(session.route_event(mine, now).len(), 1);
        assert!(session.route_event(theirs, now).is_empty());
    }

    #[test]
    fn test_system_events_bypass_subscriptions() {
        let mut session = Session::new(cfg(), None, false);
        let out = session.route_event(
            WsServerEvent::System {
                event: "maintenance".into(),
                detail: "on".into(),
                ts: 0,
            },
            Instant::now(),
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_inbound_rate_budget() {
        let mut session = Session::new(cfg(), None, false);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(session.allow_inbound(now));
        }
        // sixth message in the same second breaches the budget
        assert!(!session.allow_inbound(now));
        // a new window resets
        assert!(session.allow_inbound(now + Duration::from_secs(1)));
    }
}
