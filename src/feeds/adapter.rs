//! Feed adapter machinery.
//!
//! Every upstream source runs as one long-lived worker owning one session:
//! push sources hold a WebSocket, poll sources loop on REST. The shared
//! `AdapterCore` does everything that is source-independent: tick
//! validation, the outlier gate, the recent-tick ring buffer, connection
//! state, and health scoring. Reconnects back off exponentially to 60 s;
//! after too many consecutive failures the adapter parks until re-armed.

use crate::markets::registry::SymbolRegistry;
use crate::models::{ConnectionStatus, PriceTick, SourceHealth};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Ring buffer of recent ticks kept per adapter for debugging and warm
/// snapshots.
const TICK_RING_CAPACITY: usize = 1_000;
/// No inbound data for this long forces a reconnect.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What adapters push into the aggregator inbox.
#[derive(Debug, Clone)]
pub enum FeedUpdate {
    Tick(PriceTick),
    SourceUp { source: String },
    SourceDown { source: String, reason: String },
    /// Reconnect budget exhausted; adapter parked until re-armed.
    MaxReconnect { source: String },
}

#[derive(Debug)]
struct AdapterState {
    status: ConnectionStatus,
    connected_since: Option<Instant>,
    last_heartbeat: Option<i64>,
    last_data_ts: Option<i64>,
    last_data_at: Option<Instant>,
    errors: u64,
    recent_errors: VecDeque<Instant>,
    reconnects: u64,
    msg_times: VecDeque<Instant>,
}

impl AdapterState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connected_since: None,
            last_heartbeat: None,
            last_data_ts: None,
            last_data_at: None,
            errors: 0,
            recent_errors: VecDeque::new(),
            reconnects: 0,
            msg_times: VecDeque::new(),
        }
    }
}

/// Source-independent adapter state and the tick admission path.
pub struct AdapterCore {
    pub source: String,
    state: Mutex<AdapterState>,
    ring: RwLock<VecDeque<PriceTick>>,
    last_price: Mutex<HashMap<String, Decimal>>,
    outlier_threshold: Decimal,
    sequence: AtomicU64,
    started_at: Instant,
    tx: mpsc::Sender<FeedUpdate>,
    /// Signalled by operators to restart a parked adapter.
    pub re_arm: Notify,
}

impl AdapterCore {
    pub fn new(source: &str, outlier_threshold: Decimal, tx: mpsc::Sender<FeedUpdate>) -> Arc<Self> {
        Arc::new(Self {
            source: source.to_string(),
            state: Mutex::new(AdapterState::new()),
            ring: RwLock::new(VecDeque::with_capacity(TICK_RING_CAPACITY)),
            last_price: Mutex::new(HashMap::new()),
            outlier_threshold,
            sequence: AtomicU64::new(1),
            started_at: Instant::now(),
            tx,
            re_arm: Notify::new(),
        })
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut state = self.state.lock();
        if state.status != status {
            debug!(source = %self.source, ?status, "adapter state change");
        }
        match status {
            ConnectionStatus::Connected => {
                state.connected_since = Some(Instant::now());
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                state.connected_since = None;
            }
            _ => {}
        }
        state.status = status;
    }

    pub fn record_error(&self, reason: &str) {
        let mut state = self.state.lock();
        state.errors += 1;
        let now = Instant::now();
        state.recent_errors.push_back(now);
        while state
            .recent_errors
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(60))
        {
            state.recent_errors.pop_front();
        }
        debug!(source = %self.source, reason, "adapter error");
    }

    fn record_reconnect(&self) {
        self.state.lock().reconnects += 1;
    }

    pub fn record_heartbeat(&self) {
        self.state.lock().last_heartbeat = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Admit one parsed tick: invariant check, outlier gate against the
    /// previous tick of the same symbol, ring push, forward to the
    /// aggregator. Returns false when the tick was dropped.
    pub fn record_tick(&self, tick: PriceTick) -> bool {
        if !tick.is_valid() {
            self.record_error("tick failed invariants");
            return false;
        }

        {
            let mut last = self.last_price.lock();
            if let Some(prev) = last.get(&tick.symbol) {
                if *prev > Decimal::ZERO {
                    let change = ((tick.last - prev) / prev).abs();
                    if change > self.outlier_threshold {
                        drop(last);
                        self.record_error("tick outlier rejected");
                        warn!(
                            source = %self.source,
                            symbol = %tick.symbol,
                            change = %change,
                            "outlier tick dropped"
                        );
                        return false;
                    }
                }
            }
            last.insert(tick.symbol.clone(), tick.last);
        }

        {
            let mut state = self.state.lock();
            state.last_data_ts = Some(tick.timestamp);
            state.last_data_at = Some(Instant::now());
            let now = Instant::now();
            state.msg_times.push_back(now);
            while state
                .msg_times
                .front()
                .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(10))
            {
                state.msg_times.pop_front();
            }
        }

        {
            let mut ring = self.ring.write();
            if ring.len() == TICK_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(tick.clone());
        }

        metrics::counter!("feed_ticks_total", 1);
        if let Err(e) = self.tx.try_send(FeedUpdate::Tick(tick)) {
            self.record_error(&format!("aggregator inbox full: {e}"));
            return false;
        }
        true
    }

    pub fn recent_ticks(&self, limit: usize) -> Vec<PriceTick> {
        let ring = self.ring.read();
        ring.iter().rev().take(limit).cloned().collect()
    }

    /// Health snapshot; quality starts at 100 and decays with staleness and
    /// the last minute's error count.
    pub fn health(&self) -> SourceHealth {
        let state = self.state.lock();
        let staleness_penalty = match state.last_data_at {
            Some(at) => {
                let age = at.elapsed();
                if age > Duration::from_secs(30) {
                    50
                } else if age > Duration::from_secs(10) {
                    30
                } else if age > Duration::from_secs(5) {
                    20
                } else {
                    0
                }
            }
            None => 50,
        };
        let error_penalty = (state.recent_errors.len() as i64 * 2).min(40);
        let quality = (100_i64 - staleness_penalty - error_penalty).clamp(0, 100) as u8;

        SourceHealth {
            source: self.source.clone(),
            status: state.status,
            connected: state.status == ConnectionStatus::Connected
                || state.status == ConnectionStatus::Degraded,
            last_heartbeat: state.last_heartbeat,
            last_data_ts: state.last_data_ts,
            msgs_per_sec: state.msg_times.len() as f64 / 10.0,
            errors: state.errors,
            reconnects: state.reconnects,
            uptime_secs: state
                .connected_since
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            quality,
        }
    }

    async fn notify(&self, update: FeedUpdate) {
        if self.tx.send(update).await.is_err() {
            warn!(source = %self.source, "aggregator inbox closed");
        }
    }
}

/// A push-stream source: one WebSocket, server-initiated ticks.
#[async_trait]
pub trait PushSource: Send + Sync + 'static {
    fn source(&self) -> &str;
    /// Connection URL for the given upstream symbol ids.
    fn url(&self, upstream_symbols: &[String]) -> String;
    /// Post-connect subscription payload, if the protocol needs one.
    fn subscribe_payload(&self, upstream_symbols: &[String]) -> Option<String>;
    /// Outbound keep-alive (cadence, payload), if the protocol needs one.
    fn heartbeat(&self) -> Option<(Duration, String)>;
    /// Map one inbound frame to a tick. `symbols` maps upstream ids back to
    /// canonical ones.
    fn parse(
        &self,
        text: &str,
        symbols: &HashMap<String, String>,
        core: &AdapterCore,
    ) -> Option<PriceTick>;
}

/// A poll source: periodic REST snapshot of all subscribed symbols.
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    fn source(&self) -> &str;
    fn poll_interval(&self) -> Duration;
    async fn poll(
        &self,
        symbols: &HashMap<String, String>,
        core: &AdapterCore,
    ) -> anyhow::Result<Vec<PriceTick>>;
}

/// Build the upstream->canonical map a connection session works with.
fn subscription_map(
    registry: &SymbolRegistry,
    source: &str,
    cap: usize,
) -> HashMap<String, String> {
    registry
        .symbols_for_source(source, cap)
        .into_iter()
        .filter_map(|canonical| {
            registry
                .map(&canonical, source)
                .map(|upstream| (upstream, canonical))
        })
        .collect()
}

/// Run a push adapter forever. Owns exactly one upstream session at a time.
pub fn spawn_push_adapter(
    source: Arc<dyn PushSource>,
    core: Arc<AdapterCore>,
    registry: Arc<SymbolRegistry>,
    symbol_cap: usize,
    max_reconnect_attempts: u32,
) {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        let mut failures: u32 = 0;

        loop {
            let symbols = subscription_map(&registry, source.source(), symbol_cap);
            if symbols.is_empty() {
                debug!(source = source.source(), "no symbols to subscribe; waiting");
                sleep(Duration::from_secs(5)).await;
                continue;
            }

            core.set_status(ConnectionStatus::Connecting);
            match run_push_session(source.as_ref(), &core, &symbols).await {
                Ok(()) => {
                    // orderly close; reconnect promptly
                    backoff = INITIAL_BACKOFF;
                    failures = 0;
                    core.set_status(ConnectionStatus::Disconnected);
                    core.record_reconnect();
                }
                Err(e) => {
                    failures += 1;
                    core.set_status(ConnectionStatus::Error);
                    core.record_error(&e.to_string());
                    core.record_reconnect();
                    core.notify(FeedUpdate::SourceDown {
                        source: source.source().to_string(),
                        reason: e.to_string(),
                    })
                    .await;

                    if failures >= max_reconnect_attempts {
                        warn!(
                            source = source.source(),
                            failures, "reconnect budget exhausted; parking adapter"
                        );
                        core.notify(FeedUpdate::MaxReconnect {
                            source: source.source().to_string(),
                        })
                        .await;
                        core.re_arm.notified().await;
                        info!(source = source.source(), "adapter re-armed");
                        failures = 0;
                        backoff = INITIAL_BACKOFF;
                        continue;
                    }

                    warn!(source = source.source(), error = %e, delay = ?backoff, "feed disconnected; reconnecting");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    });
}

async fn run_push_session(
    source: &dyn PushSource,
    core: &AdapterCore,
    symbols: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let upstream: Vec<String> = symbols.keys().cloned().collect();
    let url = source.url(&upstream);
    let (ws, _resp) = connect_async(&url).await?;
    let (mut write, mut read) = ws.split();

    if let Some(payload) = source.subscribe_payload(&upstream) {
        write.send(Message::Text(payload)).await?;
    }

    core.set_status(ConnectionStatus::Connected);
    info!(source = %core.source, symbols = symbols.len(), "✅ feed connected");
    core.notify(FeedUpdate::SourceUp {
        source: core.source.clone(),
    })
    .await;

    let heartbeat = source.heartbeat();
    let mut ping = interval(heartbeat.as_ref().map(|(d, _)| *d).unwrap_or(Duration::from_secs(30)));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Some((_, ref payload)) = heartbeat {
                    write.send(Message::Text(payload.clone())).await?;
                    core.record_heartbeat();
                }
            }
            msg = timeout(IDLE_TIMEOUT, read.next()) => {
                let msg = match msg {
                    Ok(Some(msg)) => msg,
                    Ok(None) => anyhow::bail!("stream ended"),
                    Err(_) => anyhow::bail!("idle for {IDLE_TIMEOUT:?}; forcing reconnect"),
                };
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(tick) = source.parse(&text, symbols, core) {
                            core.record_tick(tick);
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        write.send(Message::Pong(payload)).await?;
                        core.record_heartbeat();
                    }
                    Ok(Message::Pong(_)) => {
                        core.record_heartbeat();
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(source = %core.source, ?frame, "feed close frame");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => anyhow::bail!("ws error: {e}"),
                }
            }
        }
    }
}

/// Run a poll adapter forever.
pub fn spawn_poll_adapter(
    source: Arc<dyn PollSource>,
    core: Arc<AdapterCore>,
    registry: Arc<SymbolRegistry>,
    symbol_cap: usize,
    max_reconnect_attempts: u32,
) {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        let mut backoff = INITIAL_BACKOFF;
        let mut tick = interval(source.poll_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        core.set_status(ConnectionStatus::Connecting);

        loop {
            tick.tick().await;
            let symbols = subscription_map(&registry, source.source(), symbol_cap);
            if symbols.is_empty() {
                continue;
            }

            match source.poll(&symbols, &core).await {
                Ok(ticks) => {
                    if failures > 0 || core.health().status != ConnectionStatus::Connected {
                        core.set_status(ConnectionStatus::Connected);
                        core.notify(FeedUpdate::SourceUp {
                            source: core.source.clone(),
                        })
                        .await;
                    }
                    failures = 0;
                    backoff = INITIAL_BACKOFF;
                    core.record_heartbeat();
                    for t in ticks {
                        core.record_tick(t);
                    }
                }
                Err(e) => {
                    failures += 1;
                    core.set_status(ConnectionStatus::Degraded);
                    core.record_error(&e.to_string());
                    if failures >= max_reconnect_attempts {
                        core.set_status(ConnectionStatus::Error);
                        core.notify(FeedUpdate::MaxReconnect {
                            source: core.source.clone(),
                        })
                        .await;
                        core.re_arm.notified().await;
                        failures = 0;
                        backoff = INITIAL_BACKOFF;
                        continue;
                    }
                    warn!(source = %core.source, error = %e, "poll failed; backing off");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn core_with_rx() -> (Arc<AdapterCore>, mpsc::Receiver<FeedUpdate>) {
        let (tx, rx) = mpsc::channel(64);
        (AdapterCore::new("binance", dec!(0.5), tx), rx)
    }

    fn tick(symbol: &str, last: Decimal, seq: u64) -> PriceTick {
        PriceTick {
            symbol: symbol.into(),
            last,
            bid: last - dec!(0.5),
            ask: last + dec!(0.5),
            bid_size: dec!(1),
            ask_size: dec!(1),
            volume_24h: dec!(10),
            quote_volume_24h: dec!(1000),
            timestamp: 1_700_000_000_000 + seq as i64,
            source: "binance".into(),
            sequence: seq,
        }
    }

    #[tokio::test]
    async fn test_valid_tick_forwarded() {
        let (core, mut rx) = core_with_rx();
        assert!(core.record_tick(tick("BTCUSDT", dec!(50000), 1)));
        match rx.recv().await.unwrap() {
            FeedUpdate::Tick(t) => assert_eq!(t.last, dec!(50000)),
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_tick_dropped() {
        let (core, _rx) = core_with_rx();
        let mut bad = tick("BTCUSDT", dec!(50000), 1);
        bad.bid = bad.ask + dec!(1); // crossed
        assert!(!core.record_tick(bad));
        assert_eq!(core.health().errors, 1);
    }

    #[tokio::test]
    async fn test_outlier_gate() {
        let (core, _rx) = core_with_rx();
        assert!(core.record_tick(tick("BTCUSDT", dec!(50000), 1)));
        // +80% jump rejected at the default 50% threshold
        assert!(!core.record_tick(tick("BTCUSDT", dec!(90000), 2)));
        // +10% accepted
        assert!(core.record_tick(tick("BTCUSDT", dec!(55000), 3)));
        // other symbols unaffected by BTC's history
        assert!(core.record_tick(tick("ETHUSDT", dec!(3000), 4)));
    }

    #[tokio::test]
    async fn test_ring_buffer_bounded() {
        let (core, mut rx) = core_with_rx();
        for i in 0..1100u64 {
            core.record_tick(tick("BTCUSDT", dec!(50000), i + 1));
            // drain so the inbox never fills
            while rx.try_recv().is_ok() {}
        }
        assert_eq!(core.recent_ticks(2000).len(), TICK_RING_CAPACITY);
    }

    #[tokio::test]
    async fn test_health_quality_decays_without_data() {
        let (core, _rx) = core_with_rx();
        // no data yet: stale penalty applies
        let health = core.health();
        assert!(health.quality <= 50);
        core.record_tick(tick("BTCUSDT", dec!(50000), 1));
        let health = core.health();
        assert_eq!(health.quality, 100);
    }
}
