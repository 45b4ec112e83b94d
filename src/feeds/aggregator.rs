//! Price aggregator.
//!
//! Merges per-source ticks into one `SymbolPriceState` per symbol, picks the
//! primary source by priority and freshness, derives the mark price, and
//! fans out: raw ticks immediately on an internal channel, `price_update`
//! batches on a throttled flush, `failover`/`feed_*` system events as they
//! happen. A periodic health pass demotes a degraded primary.

use crate::feeds::adapter::{AdapterCore, FeedUpdate};
use crate::models::{
    MarkPriceRule, Price, PriceTick, PriceUpdate, SourceId, WsServerEvent,
};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Aggregated view of one symbol across sources.
#[derive(Debug, Clone)]
pub struct SymbolPriceState {
    pub symbol: String,
    pub per_source: HashMap<SourceId, PriceTick>,
    pub primary_source: Option<SourceId>,
    pub mark_price: Option<Price>,
    /// UTC milliseconds of the latest accepted tick.
    pub last_update: i64,
}

impl SymbolPriceState {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            per_source: HashMap::new(),
            primary_source: None,
            mark_price: None,
            last_update: 0,
        }
    }
}

pub struct PriceAggregator {
    states: RwLock<HashMap<String, SymbolPriceState>>,
    adapters: RwLock<HashMap<SourceId, Arc<AdapterCore>>>,
    /// Source priority, best first.
    priority: Vec<SourceId>,
    rule: MarkPriceRule,
    outlier_threshold: Decimal,
    stale_after_ms: i64,
    failover_quality_floor: u8,
    events: broadcast::Sender<WsServerEvent>,
    raw_ticks: broadcast::Sender<PriceTick>,
    /// Coalesced per-symbol updates awaiting the throttled flush.
    pending: Mutex<HashMap<String, PriceUpdate>>,
}

impl PriceAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        priority: Vec<SourceId>,
        rule: MarkPriceRule,
        outlier_threshold: Decimal,
        stale_after: Duration,
        failover_quality_floor: u8,
        events: broadcast::Sender<WsServerEvent>,
    ) -> Arc<Self> {
        let (raw_ticks, _) = broadcast::channel(4096);
        Arc::new(Self {
            states: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
            priority,
            rule,
            outlier_threshold,
            stale_after_ms: stale_after.as_millis() as i64,
            failover_quality_floor,
            events,
            raw_ticks,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn register_adapter(&self, core: Arc<AdapterCore>) {
        self.adapters.write().insert(core.source.clone(), core);
    }

    /// Re-arm a parked adapter (operator action).
    pub fn re_arm(&self, source: &str) -> bool {
        match self.adapters.read().get(source) {
            Some(core) => {
                core.re_arm.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn subscribe_raw_ticks(&self) -> broadcast::Receiver<PriceTick> {
        self.raw_ticks.subscribe()
    }

    pub fn mark(&self, symbol: &str) -> Option<Price> {
        self.states.read().get(symbol)?.mark_price
    }

    pub fn state(&self, symbol: &str) -> Option<SymbolPriceState> {
        self.states.read().get(symbol).cloned()
    }

    pub fn source_health(&self) -> Vec<crate::models::SourceHealth> {
        self.adapters.read().values().map(|a| a.health()).collect()
    }

    /// Latest composed update for a symbol (snapshot path).
    pub fn price_update_for(&self, symbol: &str) -> Option<PriceUpdate> {
        let states = self.states.read();
        let state = states.get(symbol)?;
        compose_update(state)
    }

    fn priority_index(&self, source: &str) -> usize {
        self.priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(usize::MAX)
    }

    /// Spawn the consume + flush + health loops.
    pub fn spawn(
        self: &Arc<Self>,
        mut inbox: mpsc::Receiver<FeedUpdate>,
        flush_interval: Duration,
        health_interval: Duration,
    ) {
        let agg = self.clone();
        tokio::spawn(async move {
            let mut flush = interval(flush_interval);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut health = interval(health_interval);
            health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    update = inbox.recv() => {
                        let Some(update) = update else {
                            info!("feed inbox closed; aggregator stopping");
                            return;
                        };
                        agg.handle_update(update);
                    }
                    _ = flush.tick() => {
                        agg.flush_pending();
                    }
                    _ = health.tick() => {
                        agg.health_check();
                    }
                }
            }
        });
    }

    pub fn handle_update(&self, update: FeedUpdate) {
        match update {
            FeedUpdate::Tick(tick) => self.apply_tick(tick),
            FeedUpdate::SourceUp { source } => {
                self.system_event("feed_connected", &source);
            }
            FeedUpdate::SourceDown { source, reason } => {
                debug!(source = %source, reason = %reason, "source down");
                self.system_event("feed_disconnected", &source);
            }
            FeedUpdate::MaxReconnect { source } => {
                warn!(source = %source, "source exhausted its reconnect budget");
                self.system_event("max_reconnect", &source);
            }
        }
    }

    pub fn apply_tick(&self, tick: PriceTick) {
        if !tick.is_valid() {
            return;
        }

        let mut states = self.states.write();
        let state = states
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolPriceState::new(&tick.symbol));

        // Second outlier gate, against the aggregated mark: a source that
        // disagrees wildly with consensus is dropped even if self-consistent.
        if let Some(mark) = state.mark_price {
            if mark > Decimal::ZERO {
                let change = ((tick.last - mark) / mark).abs();
                if change > self.outlier_threshold {
                    warn!(
                        symbol = %tick.symbol,
                        source = %tick.source,
                        change = %change,
                        "tick rejected against mark"
                    );
                    return;
                }
            }
        }

        state.per_source.insert(tick.source.clone(), tick.clone());
        state.last_update = state.last_update.max(tick.timestamp);
        self.recompute(state);

        if let Some(update) = compose_update(state) {
            // last-writer-wins until the throttled flush drains it
            self.pending.lock().insert(update.symbol.clone(), update);
        }

        let _ = self.raw_ticks.send(tick);
    }

    /// Recompute primary source and mark price. The primary is the highest
    /// priority source with a fresh tick; when none qualifies the previous
    /// primary is kept rather than dropping the mark.
    fn recompute(&self, state: &mut SymbolPriceState) {
        let now = chrono::Utc::now().timestamp_millis();
        let new_primary = state
            .per_source
            .values()
            .filter(|t| now - t.timestamp <= self.stale_after_ms)
            .min_by_key(|t| self.priority_index(&t.source))
            .map(|t| t.source.clone());

        if let Some(primary) = new_primary {
            state.primary_source = Some(primary);
        }
        self.recompute_mark(state);
    }

    /// Mark price from the current primary, without re-selecting it (the
    /// failover path owns the selection there).
    fn recompute_mark(&self, state: &mut SymbolPriceState) {
        let now = chrono::Utc::now().timestamp_millis();
        let fresh: Vec<&PriceTick> = state
            .per_source
            .values()
            .filter(|t| now - t.timestamp <= self.stale_after_ms)
            .collect();

        let Some(primary) = state.primary_source.clone() else {
            return;
        };
        let Some(primary_tick) = state.per_source.get(&primary) else {
            return;
        };

        state.mark_price = Some(match self.rule {
            MarkPriceRule::Last => primary_tick.last,
            MarkPriceRule::Mid => primary_tick.mid(),
            MarkPriceRule::Vwap => {
                let mut weighted = Decimal::ZERO;
                let mut volume = Decimal::ZERO;
                for t in &fresh {
                    weighted += t.last * t.volume_24h;
                    volume += t.volume_24h;
                }
                if volume > Decimal::ZERO {
                    weighted / volume
                } else {
                    primary_tick.mid()
                }
            }
        });
    }

    /// Drain coalesced updates into one `price_update` batch.
    pub fn flush_pending(&self) {
        let batch: Vec<PriceUpdate> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            pending.drain().map(|(_, v)| v).collect()
        };
        metrics::counter!("price_updates_flushed", batch.len() as u64);
        let _ = self.events.send(WsServerEvent::PriceUpdate(batch));
    }

    /// Demote any primary whose adapter is unhealthy; the next-best fresh
    /// source takes over and a `failover` event is broadcast. Idempotent.
    pub fn health_check(&self) {
        let healths: HashMap<SourceId, (bool, u8)> = self
            .adapters
            .read()
            .iter()
            .map(|(name, core)| {
                let h = core.health();
                (name.clone(), (h.connected, h.quality))
            })
            .collect();

        let now = chrono::Utc::now().timestamp_millis();
        let mut failovers: Vec<(String, SourceId, SourceId)> = Vec::new();

        {
            let mut states = self.states.write();
            for state in states.values_mut() {
                let Some(primary) = state.primary_source.clone() else {
                    continue;
                };
                let (connected, quality) = healths.get(&primary).copied().unwrap_or((false, 0));
                let primary_fresh = state
                    .per_source
                    .get(&primary)
                    .map(|t| now - t.timestamp <= self.stale_after_ms)
                    .unwrap_or(false);
                if connected && quality >= self.failover_quality_floor && primary_fresh {
                    continue;
                }

                let replacement = state
                    .per_source
                    .values()
                    .filter(|t| t.source != primary)
                    .filter(|t| now - t.timestamp <= self.stale_after_ms)
                    .filter(|t| {
                        healths.get(&t.source).map(|(_, q)| *q).unwrap_or(0)
                            >= self.failover_quality_floor
                    })
                    .min_by_key(|t| self.priority_index(&t.source))
                    .map(|t| t.source.clone());

                if let Some(next) = replacement {
                    state.primary_source = Some(next.clone());
                    self.recompute_mark(state);
                    if let Some(update) = compose_update(state) {
                        self.pending.lock().insert(update.symbol.clone(), update);
                    }
                    failovers.push((state.symbol.clone(), primary, next));
                }
            }
        }

        for (symbol, from, to) in failovers {
            info!(symbol = %symbol, from = %from, to = %to, "primary source failover");
            metrics::counter!("feed_failovers_total", 1);
            let _ = self.events.send(WsServerEvent::System {
                event: "failover".into(),
                detail: format!("{symbol}: {from} -> {to}"),
                ts: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    fn system_event(&self, event: &str, source: &str) {
        let _ = self.events.send(WsServerEvent::System {
            event: event.into(),
            detail: source.into(),
            ts: chrono::Utc::now().timestamp_millis(),
        });
    }
}

fn compose_update(state: &SymbolPriceState) -> Option<PriceUpdate> {
    let primary = state.primary_source.as_ref()?;
    let tick = state.per_source.get(primary)?;
    Some(PriceUpdate {
        symbol: state.symbol.clone(),
        mark: state.mark_price?,
        bid: tick.bid,
        ask: tick.ask,
        last: tick.last,
        volume_24h: tick.volume_24h,
        source: primary.clone(),
        ts: tick.timestamp,
    })
}
