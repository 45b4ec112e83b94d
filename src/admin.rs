//! Admin control surface.
//!
//! Invoked by the out-of-scope admin layer, either directly or through the
//! session protocol's `admin.command`. Every action is logged at WARN with
//! its reason and broadcast as a `system.*` event.

use crate::engine::controller::OrderController;
use crate::engine::worker::MatchingRouter;
use crate::error::{EngineError, EngineResult};
use crate::feeds::aggregator::PriceAggregator;
use crate::liquidation::engine::LiquidationEngine;
use crate::margin::calculator::LeverageTier;
use crate::margin::position::PositionManager;
use crate::markets::registry::SymbolRegistry;
use crate::models::WsServerEvent;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Scope of a pause/resume: everything or one symbol.
#[derive(Debug, Clone)]
pub enum TradingScope {
    Global,
    Symbol(String),
}

pub struct AdminControl {
    controller: Arc<OrderController>,
    router: Arc<MatchingRouter>,
    registry: Arc<SymbolRegistry>,
    positions: Arc<PositionManager>,
    liquidation: Arc<LiquidationEngine>,
    agg: Arc<PriceAggregator>,
    events: broadcast::Sender<WsServerEvent>,
}

impl AdminControl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller: Arc<OrderController>,
        router: Arc<MatchingRouter>,
        registry: Arc<SymbolRegistry>,
        positions: Arc<PositionManager>,
        liquidation: Arc<LiquidationEngine>,
        agg: Arc<PriceAggregator>,
        events: broadcast::Sender<WsServerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            router,
            registry,
            positions,
            liquidation,
            agg,
            events,
        })
    }

    pub async fn pause_trading(&self, scope: TradingScope, reason: &str) -> EngineResult<()> {
        match &scope {
            TradingScope::Global => {
                warn!(reason, "trading paused globally");
                self.router.set_all_paused(true).await;
                self.system("trading_paused", "all symbols");
            }
            TradingScope::Symbol(symbol) => {
                warn!(symbol = %symbol, reason, "trading paused");
                self.router.get(symbol)?.set_paused(true).await?;
                self.system("trading_paused", symbol);
            }
        }
        Ok(())
    }

    pub async fn resume_trading(&self, scope: TradingScope) -> EngineResult<()> {
        match &scope {
            TradingScope::Global => {
                warn!("trading resumed globally");
                self.router.set_all_paused(false).await;
                self.system("trading_resumed", "all symbols");
            }
            TradingScope::Symbol(symbol) => {
                warn!(symbol = %symbol, "trading resumed");
                self.router.get(symbol)?.set_paused(false).await?;
                self.system("trading_resumed", symbol);
            }
        }
        Ok(())
    }

    pub async fn cancel_all(
        &self,
        symbol: Option<&str>,
        user_id: Option<&str>,
        reason: &str,
    ) -> usize {
        warn!(?symbol, ?user_id, reason, "admin cancel-all");
        let count = self.controller.cancel_all(symbol, user_id).await;
        self.system("cancel_all", &format!("{count} orders cancelled"));
        count
    }

    pub async fn force_liquidate(&self, position_id: &str, reason: &str) -> EngineResult<()> {
        if self.positions.handle(position_id).is_none() {
            return Err(EngineError::not_found("position", position_id));
        }
        warn!(position_id, reason, "forced liquidation requested");
        if !self.liquidation.force_enqueue(position_id) {
            return Err(EngineError::conflict("position already being liquidated"));
        }
        self.system("force_liquidate", position_id);
        Ok(())
    }

    pub async fn set_maintenance(
        &self,
        enabled: bool,
        duration: Option<Duration>,
        reason: &str,
    ) {
        warn!(enabled, ?duration, reason, "maintenance toggled");
        self.controller.set_maintenance(enabled);
        self.system(
            "maintenance",
            if enabled { "enabled" } else { "disabled" },
        );
        if enabled {
            if let Some(duration) = duration {
                let controller = self.controller.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    controller.set_maintenance(false);
                    let _ = events.send(WsServerEvent::System {
                        event: "maintenance".into(),
                        detail: "disabled".into(),
                        ts: Utc::now().timestamp_millis(),
                    });
                });
            }
        }
    }

    /// Pause one symbol for a bounded window, then auto-resume.
    pub async fn emergency_halt(
        &self,
        symbol: &str,
        duration: Duration,
        reason: &str,
    ) -> EngineResult<()> {
        warn!(symbol, ?duration, reason, "emergency halt");
        let handle = self.router.get(symbol)?;
        handle.set_paused(true).await?;
        self.system("emergency_halt", symbol);

        let events = self.events.clone();
        let symbol_owned = symbol.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if handle.set_paused(false).await.is_ok() {
                let _ = events.send(WsServerEvent::System {
                    event: "trading_resumed".into(),
                    detail: symbol_owned,
                    ts: Utc::now().timestamp_millis(),
                });
            }
        });
        Ok(())
    }

    pub async fn trigger_circuit_breaker(
        &self,
        symbol: &str,
        duration: Duration,
    ) -> EngineResult<()> {
        self.emergency_halt(symbol, duration, "circuit breaker").await?;
        self.system("circuit_breaker", symbol);
        Ok(())
    }

    pub fn update_leverage_tiers(
        &self,
        symbol: &str,
        tiers: Vec<LeverageTier>,
    ) -> EngineResult<()> {
        if self.registry.get(symbol).is_none() {
            return Err(EngineError::not_found("market", symbol));
        }
        warn!(symbol, tiers = tiers.len(), "leverage tiers updated");
        self.positions.set_tiers(symbol, tiers)?;
        self.system("leverage_tiers_updated", symbol);
        Ok(())
    }

    pub fn re_arm_feed(&self, source: &str) -> EngineResult<()> {
        if !self.agg.re_arm(source) {
            return Err(EngineError::not_found("feed source", source));
        }
        self.system("feed_rearmed", source);
        Ok(())
    }

    /// Dispatch for the session protocol's `admin.command`.
    pub async fn handle_command(&self, command: &str, params: Value) -> EngineResult<Value> {
        let symbol = params.get("symbol").and_then(|v| v.as_str());
        let reason = params
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("admin command");
        let duration = params
            .get("duration_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);

        match command {
            "pause_trading" => {
                let scope = match symbol {
                    Some(s) => TradingScope::Symbol(s.to_string()),
                    None => TradingScope::Global,
                };
                self.pause_trading(scope, reason).await?;
                Ok(json!({"paused": true}))
            }
            "resume_trading" => {
                let scope = match symbol {
                    Some(s) => TradingScope::Symbol(s.to_string()),
                    None => TradingScope::Global,
                };
                self.resume_trading(scope).await?;
                Ok(json!({"resumed": true}))
            }
            "cancel_all" => {
                let user = params.get("user_id").and_then(|v| v.as_str());
                let count = self.cancel_all(symbol, user, reason).await;
                Ok(json!({ "cancelled": count }))
            }
            "force_liquidate" => {
                let position_id = params
                    .get("position_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| EngineError::validation("position_id required"))?;
                self.force_liquidate(position_id, reason).await?;
                Ok(json!({"queued": true}))
            }
            "set_maintenance" => {
                let enabled = params
                    .get("enabled")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                self.set_maintenance(enabled, duration, reason).await;
                Ok(json!({ "maintenance": enabled }))
            }
            "emergency_halt" => {
                let symbol =
                    symbol.ok_or_else(|| EngineError::validation("symbol required"))?;
                self.emergency_halt(
                    symbol,
                    duration.unwrap_or(Duration::from_secs(300)),
                    reason,
                )
                .await?;
                Ok(json!({"halted": symbol}))
            }
            "circuit_breaker" => {
                let symbol =
                    symbol.ok_or_else(|| EngineError::validation("symbol required"))?;
                self.trigger_circuit_breaker(
                    symbol,
                    duration.unwrap_or(Duration::from_secs(60)),
                )
                .await?;
                Ok(json!({"tripped": symbol}))
            }
            "update_leverage_tiers" => {
                let symbol =
                    symbol.ok_or_else(|| EngineError::validation("symbol required"))?;
                let tiers: Vec<LeverageTier> = serde_json::from_value(
                    params
                        .get("tiers")
                        .cloned()
                        .ok_or_else(|| EngineError::validation("tiers required"))?,
                )
                .map_err(|e| EngineError::validation(format!("bad tier table: {e}")))?;
                self.update_leverage_tiers(symbol, tiers)?;
                Ok(json!({"updated": symbol}))
            }
            "rearm_feed" => {
                let source = params
                    .get("source")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| EngineError::validation("source required"))?;
                self.re_arm_feed(source)?;
                Ok(json!({"rearmed": source}))
            }
            "toggle_market" => {
                let symbol =
                    symbol.ok_or_else(|| EngineError::validation("symbol required"))?;
                let enabled = params
                    .get("enabled")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                if !self.registry.toggle(symbol, enabled) {
                    return Err(EngineError::not_found("market", symbol));
                }
                Ok(json!({"symbol": symbol, "enabled": enabled}))
            }
            other => Err(EngineError::validation(format!(
                "unknown admin command: {other}"
            ))),
        }
    }

    fn system(&self, event: &str, detail: &str) {
        let _ = self.events.send(WsServerEvent::System {
            event: event.to_string(),
            detail: detail.to_string(),
            ts: Utc::now().timestamp_millis(),
        });
    }
}
