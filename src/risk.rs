//! Risk Monitor
//!
//! Periodically aggregates every open position into system-wide exposure
//! metrics, raises alerts when thresholds are crossed, and runs on-demand
//! stress tests that revalue the book under shifted marks without mutating
//! anything.

use crate::margin::calculator::{
    maintenance_margin, margin_ratio, tier_for, unrealised_pnl,
};
use crate::margin::position::PositionManager;
use crate::models::{
    AlertSeverity, RiskAlert, RiskLevel, RiskMetrics, StressReport, StressScenario, WsServerEvent,
};
use crate::storage::db::Store;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RiskThresholds {
    /// Total exposure past this raises a medium alert.
    pub exposure_warning: Decimal,
    /// Total exposure past this raises a critical alert.
    pub exposure_critical: Decimal,
    /// Share of total exposure in one symbol or user that raises an alert.
    pub concentration_limit: Decimal,
    /// Number of near-liquidation positions that raises an alert.
    pub near_liquidation_limit: usize,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            exposure_warning: Decimal::from(50_000_000u64),
            exposure_critical: Decimal::from(200_000_000u64),
            concentration_limit: Decimal::new(5, 1), // 0.5
            near_liquidation_limit: 25,
        }
    }
}

pub struct RiskMonitor {
    positions: Arc<PositionManager>,
    store: Arc<Store>,
    events: broadcast::Sender<WsServerEvent>,
    ids: Arc<crate::engine::ids::IdGen>,
    thresholds: RiskThresholds,
    latest: RwLock<RiskMetrics>,
}

impl RiskMonitor {
    pub fn new(
        positions: Arc<PositionManager>,
        store: Arc<Store>,
        events: broadcast::Sender<WsServerEvent>,
        ids: Arc<crate::engine::ids::IdGen>,
        thresholds: RiskThresholds,
    ) -> Arc<Self> {
        Arc::new(Self {
            positions,
            store,
            events,
            ids,
            thresholds,
            latest: RwLock::new(RiskMetrics::default()),
        })
    }

    pub fn latest(&self) -> RiskMetrics {
        self.latest.read().clone()
    }

    /// One aggregation pass: recompute metrics, raise any threshold alerts.
    pub async fn scan(&self) -> RiskMetrics {
        let positions = self.positions.open_positions().await;
        let mut metrics = RiskMetrics {
            ts: Utc::now().timestamp_millis(),
            ..Default::default()
        };

        for p in &positions {
            let exposure = p.notional();
            metrics.total_exposure += exposure;
            metrics.total_margin += p.margin;
            metrics.total_unrealised_pnl += p.unrealised_pnl;
            metrics.open_positions += 1;
            if p.risk_level >= RiskLevel::Critical {
                metrics.positions_near_liquidation += 1;
            }
            *metrics
                .exposure_per_symbol
                .entry(p.symbol.clone())
                .or_default() += exposure;
            *metrics
                .exposure_per_user
                .entry(p.user_id.clone())
                .or_default() += exposure;
        }

        metrics::gauge!("risk_total_exposure", decimal_to_f64(metrics.total_exposure));
        metrics::gauge!(
            "risk_positions_near_liquidation",
            metrics.positions_near_liquidation as f64
        );

        self.raise_alerts(&metrics);
        *self.latest.write() = metrics.clone();
        metrics
    }

    fn raise_alerts(&self, metrics: &RiskMetrics) {
        if metrics.total_exposure >= self.thresholds.exposure_critical {
            self.alert(
                AlertSeverity::Critical,
                "exposure_critical",
                format!("total exposure {} past critical threshold", metrics.total_exposure),
                HashMap::new(),
            );
        } else if metrics.total_exposure >= self.thresholds.exposure_warning {
            self.alert(
                AlertSeverity::Medium,
                "exposure_warning",
                format!("total exposure {} past warning threshold", metrics.total_exposure),
                HashMap::new(),
            );
        }

        if metrics.total_exposure > Decimal::ZERO {
            for (symbol, exposure) in &metrics.exposure_per_symbol {
                if exposure / metrics.total_exposure > self.thresholds.concentration_limit {
                    let mut ctx = HashMap::new();
                    ctx.insert("symbol".to_string(), symbol.clone());
                    self.alert(
                        AlertSeverity::High,
                        "symbol_concentration",
                        format!("{symbol} carries {exposure} of {} exposure", metrics.total_exposure),
                        ctx,
                    );
                }
            }
            for (user, exposure) in &metrics.exposure_per_user {
                if exposure / metrics.total_exposure > self.thresholds.concentration_limit {
                    let mut ctx = HashMap::new();
                    ctx.insert("user_id".to_string(), user.clone());
                    self.alert(
                        AlertSeverity::High,
                        "user_concentration",
                        format!("one account carries {exposure} of {} exposure", metrics.total_exposure),
                        ctx,
                    );
                }
            }
        }

        if metrics.positions_near_liquidation >= self.thresholds.near_liquidation_limit {
            self.alert(
                AlertSeverity::Critical,
                "liquidation_cluster",
                format!(
                    "{} positions near liquidation",
                    metrics.positions_near_liquidation
                ),
                HashMap::new(),
            );
        }
    }

    fn alert(
        &self,
        severity: AlertSeverity,
        code: &str,
        message: String,
        context: HashMap<String, String>,
    ) {
        let alert = RiskAlert {
            alert_id: self.ids.next("ALR"),
            severity,
            code: code.to_string(),
            message,
            context,
            ts: Utc::now(),
        };
        warn!(
            code = %alert.code,
            severity = alert.severity.as_str(),
            "{}",
            alert.message
        );
        if let Err(e) = self.store.insert_alert(&alert) {
            warn!(error = %e, "risk alert persist failed");
        }
        let _ = self.events.send(WsServerEvent::RiskAlert(alert));
    }

    /// Revalue every open position under the scenario's shifted marks and
    /// count the fallout. Pure read: nothing is mutated.
    pub async fn stress_test(&self, scenario: &StressScenario) -> StressReport {
        let positions = self.positions.open_positions().await;
        let mut report = StressReport {
            positions_evaluated: positions.len(),
            ..Default::default()
        };

        for p in &positions {
            let shift = scenario
                .price_shifts
                .get(&p.symbol)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let shifted_mark = p.mark_price * (Decimal::ONE + shift);
            let pnl = unrealised_pnl(p.side, p.entry_price, shifted_mark, p.quantity);
            let notional = p.quantity * shifted_mark;
            let tiers = self.positions.tiers_for(&p.symbol);
            let maintenance = maintenance_margin(notional, tier_for(&tiers, notional));
            let ratio = margin_ratio(maintenance, p.margin, pnl);

            if ratio >= Decimal::new(95, 2) {
                report.liquidations += 1;
                let loss = -pnl.min(Decimal::ZERO);
                report.total_loss += loss;
                *report.per_symbol_loss.entry(p.symbol.clone()).or_default() += loss;
            }
        }

        report.worst_symbol = report
            .per_symbol_loss
            .iter()
            .max_by_key(|(_, loss)| **loss)
            .map(|(symbol, _)| symbol.clone());

        info!(
            evaluated = report.positions_evaluated,
            liquidations = report.liquidations,
            total_loss = %report.total_loss,
            "stress test complete"
        );
        report
    }

    pub fn spawn(self: &Arc<Self>, cadence: Duration) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cadence);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                monitor.scan().await;
            }
        });
    }
}

fn decimal_to_f64(d: Decimal) -> f64 {
    use std::str::FromStr;
    f64::from_str(&d.to_string()).unwrap_or(0.0)
}
