//! Liquidation engine.
//!
//! Two loops over the mark-price stream: a monitor that classifies open
//! positions and enqueues the ones at or past the liquidation threshold,
//! and a processor that works the queue with bounded concurrency, walking
//! the partial-liquidation ladder and settling every reduction against the
//! insurance fund. Errors affect only the position at hand; it is retried
//! on a later pass.

use crate::engine::controller::OrderController;
use crate::error::EngineResult;
use crate::liquidation::insurance::InsuranceFund;
use crate::margin::position::PositionManager;
use crate::models::{
    LiquidationEvent, LiquidationLevel, Position, PositionSide, PositionStatus, Side,
    WsServerEvent,
};
use crate::storage::db::Store;
use crate::storage::wallet::WalletLedger;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct LiquidationConfig {
    pub margin_call_ratio: Decimal,
    pub liquidation_ratio: Decimal,
    pub adl_ratio: Decimal,
    pub fee_rate: Decimal,
    pub concurrency: usize,
}

/// Ladder rung for a margin ratio at or past the liquidation threshold.
pub fn ladder_level(ratio: Decimal) -> LiquidationLevel {
    if ratio < dec!(0.80) {
        LiquidationLevel::CancelOrders
    } else if ratio < dec!(0.85) {
        LiquidationLevel::Reduce25
    } else if ratio < dec!(0.90) {
        LiquidationLevel::Reduce50
    } else {
        LiquidationLevel::Full
    }
}

pub struct LiquidationEngine {
    positions: Arc<PositionManager>,
    controller: Arc<OrderController>,
    wallets: Arc<WalletLedger>,
    fund: Arc<InsuranceFund>,
    store: Arc<Store>,
    events: broadcast::Sender<WsServerEvent>,
    cfg: LiquidationConfig,
    queue: Mutex<VecDeque<String>>,
    queued: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<String>>,
    /// Positions already margin-called, to avoid re-alerting every pass.
    margin_called: Mutex<HashSet<String>>,
    /// Admin-forced liquidations skip the recovered-position recheck.
    forced: Mutex<HashSet<String>>,
}

impl LiquidationEngine {
    pub fn new(
        positions: Arc<PositionManager>,
        controller: Arc<OrderController>,
        wallets: Arc<WalletLedger>,
        fund: Arc<InsuranceFund>,
        store: Arc<Store>,
        events: broadcast::Sender<WsServerEvent>,
        cfg: LiquidationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            positions,
            controller,
            wallets,
            fund,
            store,
            events,
            cfg,
            queue: Mutex::new(VecDeque::new()),
            queued: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            margin_called: Mutex::new(HashSet::new()),
            forced: Mutex::new(HashSet::new()),
        })
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Classify every open position; enqueue the ones past the liquidation
    /// threshold. A position already queued or processing never re-enters
    /// within the same pass.
    pub async fn monitor_pass(&self) {
        let positions = self.positions.open_positions().await;
        for p in positions {
            if p.status != PositionStatus::Open {
                continue;
            }
            let ratio = p.margin_ratio;

            if ratio >= self.cfg.liquidation_ratio {
                let mut queued = self.queued.lock();
                let in_flight = self.in_flight.lock();
                if !queued.contains(&p.position_id) && !in_flight.contains(&p.position_id) {
                    queued.insert(p.position_id.clone());
                    self.queue.lock().push_back(p.position_id.clone());
                    info!(
                        position_id = %p.position_id,
                        ratio = %ratio,
                        "position queued for liquidation"
                    );
                    metrics::counter!("liquidations_queued_total", 1);
                }
            } else if ratio >= self.cfg.margin_call_ratio {
                if self.margin_called.lock().insert(p.position_id.clone()) {
                    let _ = self.events.send(WsServerEvent::MarginCall {
                        position_id: p.position_id.clone(),
                        user_id: p.user_id.clone(),
                        symbol: p.symbol.clone(),
                        margin_ratio: ratio,
                    });
                }
            } else {
                self.margin_called.lock().remove(&p.position_id);
            }

            if ratio >= self.cfg.adl_ratio && self.fund.utilisation() < dec!(0.1) {
                let _ = self.events.send(WsServerEvent::System {
                    event: "adl_candidate".into(),
                    detail: p.position_id.clone(),
                    ts: Utc::now().timestamp_millis(),
                });
            }
        }
    }

    /// Drain the queue up to the concurrency budget.
    pub async fn processor_pass(self: &Arc<Self>) {
        loop {
            let position_id = {
                let in_flight = self.in_flight.lock();
                if in_flight.len() >= self.cfg.concurrency {
                    return;
                }
                drop(in_flight);
                let Some(id) = self.queue.lock().pop_front() else {
                    return;
                };
                self.queued.lock().remove(&id);
                self.in_flight.lock().insert(id.clone());
                id
            };

            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.process_position(&position_id).await {
                    warn!(position_id = %position_id, error = %e, "liquidation attempt failed");
                }
                engine.in_flight.lock().remove(&position_id);
            });
        }
    }

    /// Force a position straight onto the queue (admin path). Forced
    /// positions are processed even if their ratio has recovered.
    pub fn force_enqueue(&self, position_id: &str) -> bool {
        let mut queued = self.queued.lock();
        if queued.contains(position_id) || self.in_flight.lock().contains(position_id) {
            return false;
        }
        queued.insert(position_id.to_string());
        self.forced.lock().insert(position_id.to_string());
        self.queue.lock().push_back(position_id.to_string());
        true
    }

    async fn process_position(&self, position_id: &str) -> EngineResult<()> {
        let Some(handle) = self.positions.handle(position_id) else {
            return Ok(()); // closed since it was queued
        };
        let snapshot = { handle.lock().await.clone() };
        if snapshot.status != PositionStatus::Open {
            return Ok(());
        }

        // re-check with the latest ratio: never liquidate a recovered
        // position (unless an operator forced it)
        let forced = self.forced.lock().remove(position_id);
        let ratio = snapshot.margin_ratio;
        if !forced && ratio < self.cfg.liquidation_ratio {
            return Ok(());
        }

        self.positions
            .set_status(position_id, PositionStatus::Liquidating)
            .await?;

        let level = ladder_level(ratio);
        let result = self.execute_level(&snapshot, level, ratio).await;

        match result {
            Ok(fully_closed) => {
                if !fully_closed {
                    // partial rung done; back to open for the next monitor
                    // pass to re-evaluate
                    self.positions
                        .set_status(position_id, PositionStatus::Open)
                        .await?;
                }
                Ok(())
            }
            Err(e) => {
                // leave the position open; it re-enters on the next pass
                let _ = self
                    .positions
                    .set_status(position_id, PositionStatus::Open)
                    .await;
                Err(e)
            }
        }
    }

    async fn execute_level(
        &self,
        position: &Position,
        level: LiquidationLevel,
        ratio: Decimal,
    ) -> EngineResult<bool> {
        info!(
            position_id = %position.position_id,
            level = level.as_str(),
            ratio = %ratio,
            "executing liquidation level"
        );

        let reduce_fraction = match level {
            LiquidationLevel::CancelOrders => {
                let cancelled = self
                    .controller
                    .cancel_all(Some(&position.symbol), Some(&position.user_id))
                    .await;
                info!(
                    position_id = %position.position_id,
                    cancelled,
                    "liquidation level: user orders cancelled"
                );
                return Ok(false);
            }
            LiquidationLevel::Reduce25 => dec!(0.25),
            LiquidationLevel::Reduce50 => dec!(0.50),
            LiquidationLevel::Full => Decimal::ONE,
        };

        let qty = position.quantity * reduce_fraction;
        let close_side = match position.side {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        };

        let (exec_price, filled) = self
            .controller
            .execute_liquidation_order(&position.user_id, &position.symbol, close_side, qty)
            .await?;
        if filled <= Decimal::ZERO {
            return Err(crate::error::EngineError::conflict(
                "no liquidity for liquidation order",
            ));
        }

        let outcome = self
            .positions
            .liquidation_reduce(&position.position_id, filled, exec_price)
            .await?;

        // economics of the reduction
        let loss = -outcome.realised_pnl; // positive = user lost money
        let fee = exec_price * filled * self.cfg.fee_rate;

        // the closed share's margin leaves the wallet; whatever survives
        // loss and fee goes back to the user
        self.wallets
            .spend_locked(&position.user_id, "USDT", outcome.margin_released)
            .await?;
        let refund = outcome.margin_released - loss - fee;
        if refund > Decimal::ZERO {
            self.wallets
                .credit(&position.user_id, "USDT", refund)
                .await?;
        }

        let fund_delta = if loss + fee <= outcome.margin_released {
            // solvent: the fee is the fund's revenue
            self.fund.contribute(fee);
            fee
        } else {
            let deficit = loss + fee - outcome.margin_released;
            let covered = self.fund.payout(deficit);
            if covered < deficit {
                error!(
                    position_id = %position.position_id,
                    uncovered = %(deficit - covered),
                    "insurance fund exhausted during liquidation"
                );
            }
            -covered
        };

        let event = LiquidationEvent {
            position_id: position.position_id.clone(),
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: filled,
            exec_price,
            mark_price: position.mark_price,
            loss,
            fee,
            insurance_fund_delta: fund_delta,
            ts: Utc::now(),
            level,
            partial: !outcome.fully_closed,
        };
        if let Err(e) = self.store.insert_liquidation(&event) {
            warn!(position_id = %position.position_id, error = %e, "liquidation history persist failed");
        }
        metrics::counter!("liquidations_executed_total", 1);
        let _ = self.events.send(WsServerEvent::System {
            event: "liquidation".into(),
            detail: format!(
                "{} {} {} @ {} ({})",
                position.symbol,
                close_side.as_str(),
                filled,
                exec_price,
                level.as_str()
            ),
            ts: Utc::now().timestamp_millis(),
        });

        Ok(outcome.fully_closed)
    }

    /// Start the monitor and processor loops.
    pub fn spawn(self: &Arc<Self>, monitor_interval: Duration, processor_interval: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                engine.monitor_pass().await;
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(processor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                engine.processor_pass().await;
            }
        });
    }
}
