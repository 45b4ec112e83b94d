//! SQLite persistence for the engine.
//!
//! One connection in WAL mode behind a fast mutex; critical sections are
//! short and every multi-row unit of work runs in an explicit transaction.
//! Decimals are stored as TEXT and parsed back on load; SQLite REAL is
//! never used for money.

use crate::models::{
    Balance, Fill, LiquidationEvent, LiquidationLevel, MarginMode, Order, OrderFlags, OrderStatus,
    OrderType, Position, PositionSide, PositionStatus, RiskAlert, RiskLevel, Side, SymbolInfo,
    TimeInForce, Trade,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS markets (
    symbol TEXT PRIMARY KEY,
    base TEXT NOT NULL,
    quote TEXT NOT NULL,
    tick_size TEXT NOT NULL,
    step_size TEXT NOT NULL,
    min_notional TEXT NOT NULL,
    enabled_sources TEXT NOT NULL,
    rank INTEGER NOT NULL,
    enabled INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    price TEXT,
    stop_price TEXT,
    quantity TEXT NOT NULL,
    filled TEXT NOT NULL,
    remaining TEXT NOT NULL,
    average_fill_price TEXT NOT NULL,
    fees TEXT NOT NULL,
    status TEXT NOT NULL,
    time_in_force TEXT NOT NULL,
    hidden INTEGER NOT NULL DEFAULT 0,
    reduce_only INTEGER NOT NULL DEFAULT 0,
    post_only INTEGER NOT NULL DEFAULT 0,
    oco_linked_id TEXT,
    leverage INTEGER,
    margin_mode TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    triggered_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_open ON orders(symbol, status)
    WHERE status IN ('pending','open','partially_filled');

CREATE TABLE IF NOT EXISTS fills (
    fill_id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    counter_order_id TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    fee TEXT NOT NULL,
    fee_asset TEXT NOT NULL,
    is_maker INTEGER NOT NULL,
    ts TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_id, ts);

CREATE TABLE IF NOT EXISTS trades (
    trade_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    buy_order_id TEXT NOT NULL,
    sell_order_id TEXT NOT NULL,
    is_buyer_maker INTEGER NOT NULL,
    ts TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol, ts DESC);

CREATE TABLE IF NOT EXISTS positions (
    position_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    status TEXT NOT NULL,
    margin_mode TEXT NOT NULL,
    quantity TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    mark_price TEXT NOT NULL,
    liquidation_price TEXT NOT NULL,
    bankruptcy_price TEXT NOT NULL,
    leverage INTEGER NOT NULL,
    margin TEXT NOT NULL,
    maintenance_margin TEXT NOT NULL,
    margin_ratio TEXT NOT NULL,
    isolated_margin TEXT,
    unrealised_pnl TEXT NOT NULL,
    realised_pnl TEXT NOT NULL,
    risk_level TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    closed_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id, status);
CREATE INDEX IF NOT EXISTS idx_positions_open ON positions(status)
    WHERE status IN ('open','closing','liquidating');

CREATE TABLE IF NOT EXISTS position_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    position_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    realised_pnl TEXT NOT NULL,
    closed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS liquidation_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    position_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity TEXT NOT NULL,
    exec_price TEXT NOT NULL,
    mark_price TEXT NOT NULL,
    loss TEXT NOT NULL,
    fee TEXT NOT NULL,
    insurance_fund_delta TEXT NOT NULL,
    level TEXT NOT NULL,
    partial INTEGER NOT NULL,
    ts TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_liq_user ON liquidation_history(user_id, ts DESC);

CREATE TABLE IF NOT EXISTS wallets (
    user_id TEXT NOT NULL,
    asset TEXT NOT NULL,
    available TEXT NOT NULL,
    locked TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, asset)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS risk_alerts (
    alert_id TEXT PRIMARY KEY,
    severity TEXT NOT NULL,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    context_json TEXT NOT NULL,
    ts TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS insurance_fund (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    balance TEXT NOT NULL,
    contributions TEXT NOT NULL,
    payouts TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

fn dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("bad decimal in db: {s}"))
}

fn dec_opt(s: Option<String>) -> Result<Option<Decimal>> {
    s.as_deref().map(dec).transpose()
}

fn ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in db: {s}"))?
        .with_timezone(&Utc))
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open sqlite at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        info!(path = %path.as_ref().display(), "database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // Markets
    // ------------------------------------------------------------------

    pub fn upsert_market(&self, m: &SymbolInfo) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO markets (symbol, base, quote, tick_size, step_size, min_notional,
                                  enabled_sources, rank, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(symbol) DO UPDATE SET
                base = excluded.base,
                quote = excluded.quote,
                tick_size = excluded.tick_size,
                step_size = excluded.step_size,
                min_notional = excluded.min_notional,
                enabled_sources = excluded.enabled_sources,
                rank = excluded.rank",
            params![
                m.symbol,
                m.base,
                m.quote,
                m.tick_size.to_string(),
                m.step_size.to_string(),
                m.min_notional.to_string(),
                m.enabled_sources.join(","),
                m.rank,
                m.enabled as i64,
            ],
        )?;
        Ok(())
    }

    pub fn set_market_enabled(&self, symbol: &str, enabled: bool) -> Result<bool> {
        let n = self.conn.lock().execute(
            "UPDATE markets SET enabled = ?2 WHERE symbol = ?1",
            params![symbol, enabled as i64],
        )?;
        Ok(n > 0)
    }

    pub fn load_markets(&self) -> Result<Vec<SymbolInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, base, quote, tick_size, step_size, min_notional,
                    enabled_sources, rank, enabled
             FROM markets ORDER BY rank",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, base, quote, tick, step, min_notional, sources, rank, enabled) = row?;
            out.push(SymbolInfo {
                symbol,
                base,
                quote,
                tick_size: dec(&tick)?,
                step_size: dec(&step)?,
                min_notional: dec(&min_notional)?,
                enabled_sources: sources
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                rank,
                enabled: enabled != 0,
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Orders & fills & trades
    // ------------------------------------------------------------------

    pub fn upsert_order(&self, o: &Order) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO orders (order_id, user_id, symbol, side, order_type, price, stop_price,
                                 quantity, filled, remaining, average_fill_price, fees, status,
                                 time_in_force, hidden, reduce_only, post_only, oco_linked_id,
                                 leverage, margin_mode, created_at, updated_at, triggered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23)
             ON CONFLICT(order_id) DO UPDATE SET
                price = excluded.price,
                stop_price = excluded.stop_price,
                quantity = excluded.quantity,
                filled = excluded.filled,
                remaining = excluded.remaining,
                average_fill_price = excluded.average_fill_price,
                fees = excluded.fees,
                status = excluded.status,
                oco_linked_id = excluded.oco_linked_id,
                updated_at = excluded.updated_at,
                triggered_at = excluded.triggered_at",
            params![
                o.order_id,
                o.user_id,
                o.symbol,
                o.side.as_str(),
                o.order_type.as_str(),
                o.price.map(|p| p.to_string()),
                o.stop_price.map(|p| p.to_string()),
                o.quantity.to_string(),
                o.filled.to_string(),
                o.remaining.to_string(),
                o.average_fill_price.to_string(),
                o.fees.to_string(),
                o.status.as_str(),
                tif_str(o.time_in_force),
                o.flags.hidden as i64,
                o.flags.reduce_only as i64,
                o.flags.post_only as i64,
                o.oco_linked_id,
                o.leverage,
                o.margin_mode.map(|m| m.as_str()),
                o.created_at.to_rfc3339(),
                o.updated_at.to_rfc3339(),
                o.triggered_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn delete_order(&self, order_id: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM orders WHERE order_id = ?1", params![order_id])?;
        Ok(())
    }

    pub fn load_open_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, user_id, symbol, side, order_type, price, stop_price, quantity,
                    filled, remaining, average_fill_price, fees, status, time_in_force, hidden,
                    reduce_only, post_only, oco_linked_id, leverage, margin_mode, created_at,
                    updated_at, triggered_at
             FROM orders
             WHERE status IN ('pending','open','partially_filled')
             ORDER BY created_at",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(order_from_row(row)?);
        }
        Ok(out)
    }

    pub fn insert_fill(&self, f: &Fill) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO fills (fill_id, order_id, counter_order_id, price, quantity, fee,
                                fee_asset, is_maker, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                f.fill_id,
                f.order_id,
                f.counter_order_id,
                f.price.to_string(),
                f.quantity.to_string(),
                f.fee.to_string(),
                f.fee_asset,
                f.is_maker as i64,
                f.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_trade(&self, t: &Trade) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO trades (trade_id, symbol, price, quantity, buy_order_id, sell_order_id,
                                 is_buyer_maker, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                t.trade_id,
                t.symbol,
                t.price.to_string(),
                t.quantity.to_string(),
                t.buy_order_id,
                t.sell_order_id,
                t.is_buyer_maker as i64,
                t.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, symbol, price, quantity, buy_order_id, sell_order_id,
                    is_buyer_maker, ts
             FROM trades WHERE symbol = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (trade_id, symbol, price, quantity, buy_id, sell_id, maker, at) = row?;
            out.push(Trade {
                trade_id,
                symbol,
                price: dec(&price)?,
                quantity: dec(&quantity)?,
                buy_order_id: buy_id,
                sell_order_id: sell_id,
                is_buyer_maker: maker != 0,
                ts: ts(&at)?,
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub fn upsert_position(&self, p: &Position) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO positions (position_id, user_id, symbol, side, status, margin_mode,
                                    quantity, entry_price, mark_price, liquidation_price,
                                    bankruptcy_price, leverage, margin, maintenance_margin,
                                    margin_ratio, isolated_margin, unrealised_pnl, realised_pnl,
                                    risk_level, opened_at, updated_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(position_id) DO UPDATE SET
                status = excluded.status,
                margin_mode = excluded.margin_mode,
                quantity = excluded.quantity,
                entry_price = excluded.entry_price,
                mark_price = excluded.mark_price,
                liquidation_price = excluded.liquidation_price,
                bankruptcy_price = excluded.bankruptcy_price,
                leverage = excluded.leverage,
                margin = excluded.margin,
                maintenance_margin = excluded.maintenance_margin,
                margin_ratio = excluded.margin_ratio,
                isolated_margin = excluded.isolated_margin,
                unrealised_pnl = excluded.unrealised_pnl,
                realised_pnl = excluded.realised_pnl,
                risk_level = excluded.risk_level,
                updated_at = excluded.updated_at,
                closed_at = excluded.closed_at",
            params![
                p.position_id,
                p.user_id,
                p.symbol,
                p.side.as_str(),
                p.status.as_str(),
                p.margin_mode.as_str(),
                p.quantity.to_string(),
                p.entry_price.to_string(),
                p.mark_price.to_string(),
                p.liquidation_price.to_string(),
                p.bankruptcy_price.to_string(),
                p.leverage,
                p.margin.to_string(),
                p.maintenance_margin.to_string(),
                p.margin_ratio.to_string(),
                p.isolated_margin.map(|m| m.to_string()),
                p.unrealised_pnl.to_string(),
                p.realised_pnl.to_string(),
                p.risk_level.as_str(),
                p.opened_at.to_rfc3339(),
                p.updated_at.to_rfc3339(),
                p.closed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn load_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT position_id, user_id, symbol, side, status, margin_mode, quantity,
                    entry_price, mark_price, liquidation_price, bankruptcy_price, leverage,
                    margin, maintenance_margin, margin_ratio, isolated_margin, unrealised_pnl,
                    realised_pnl, risk_level, opened_at, updated_at, closed_at
             FROM positions WHERE status IN ('open','closing','liquidating')",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(position_from_row(row)?);
        }
        Ok(out)
    }

    pub fn insert_position_history(&self, p: &Position) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO position_history (position_id, user_id, symbol, side, quantity,
                                           entry_price, realised_pnl, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                p.position_id,
                p.user_id,
                p.symbol,
                p.side.as_str(),
                p.quantity.to_string(),
                p.entry_price.to_string(),
                p.realised_pnl.to_string(),
                p.closed_at.unwrap_or_else(Utc::now).to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Liquidations & insurance fund
    // ------------------------------------------------------------------

    pub fn insert_liquidation(&self, e: &LiquidationEvent) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO liquidation_history (position_id, user_id, symbol, side, quantity,
                                              exec_price, mark_price, loss, fee,
                                              insurance_fund_delta, level, partial, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                e.position_id,
                e.user_id,
                e.symbol,
                e.side.as_str(),
                e.quantity.to_string(),
                e.exec_price.to_string(),
                e.mark_price.to_string(),
                e.loss.to_string(),
                e.fee.to_string(),
                e.insurance_fund_delta.to_string(),
                e.level.as_str(),
                e.partial as i64,
                e.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn liquidation_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM liquidation_history", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn save_insurance_fund(
        &self,
        balance: Decimal,
        contributions: Decimal,
        payouts: Decimal,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO insurance_fund (id, balance, contributions, payouts, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                balance = excluded.balance,
                contributions = excluded.contributions,
                payouts = excluded.payouts,
                updated_at = excluded.updated_at",
            params![
                balance.to_string(),
                contributions.to_string(),
                payouts.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_insurance_fund(&self) -> Result<Option<(Decimal, Decimal, Decimal)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT balance, contributions, payouts FROM insurance_fund WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match row {
            Some((b, c, p)) => Ok(Some((dec(&b)?, dec(&c)?, dec(&p)?))),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------

    /// Persist one user's balances atomically.
    pub fn save_wallet(&self, user_id: &str, balances: &[Balance]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO wallets (user_id, asset, available, locked, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id, asset) DO UPDATE SET
                    available = excluded.available,
                    locked = excluded.locked,
                    updated_at = excluded.updated_at",
            )?;
            let now = Utc::now().to_rfc3339();
            for b in balances {
                stmt.execute(params![
                    user_id,
                    b.asset,
                    b.available.to_string(),
                    b.locked.to_string(),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_wallet(&self, user_id: &str) -> Result<Vec<Balance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT asset, available, locked FROM wallets WHERE user_id = ?1 ORDER BY asset",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (asset, available, locked) = row?;
            out.push(Balance {
                asset,
                available: dec(&available)?,
                locked: dec(&locked)?,
            });
        }
        Ok(out)
    }

    pub fn load_all_wallets(&self) -> Result<Vec<(String, Balance)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, asset, available, locked FROM wallets ORDER BY user_id, asset",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (user_id, asset, available, locked) = row?;
            out.push((
                user_id,
                Balance {
                    asset,
                    available: dec(&available)?,
                    locked: dec(&locked)?,
                },
            ));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub fn insert_alert(&self, a: &RiskAlert) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO risk_alerts (alert_id, severity, code, message, context_json, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                a.alert_id,
                a.severity.as_str(),
                a.code,
                a.message,
                serde_json::to_string(&a.context).unwrap_or_else(|_| "{}".into()),
                a.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
        TimeInForce::PostOnly => "PostOnly",
    }
}

fn tif_parse(s: &str) -> Result<TimeInForce> {
    Ok(match s {
        "GTC" => TimeInForce::Gtc,
        "IOC" => TimeInForce::Ioc,
        "FOK" => TimeInForce::Fok,
        "PostOnly" => TimeInForce::PostOnly,
        other => anyhow::bail!("bad time_in_force in db: {other}"),
    })
}

fn side_parse(s: &str) -> Result<Side> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

fn order_type_parse(s: &str) -> Result<OrderType> {
    Ok(match s {
        "market" => OrderType::Market,
        "limit" => OrderType::Limit,
        "stop" => OrderType::Stop,
        "stop_limit" => OrderType::StopLimit,
        "take_profit" => OrderType::TakeProfit,
        "trailing_stop" => OrderType::TrailingStop,
        other => anyhow::bail!("bad order_type in db: {other}"),
    })
}

fn status_parse(s: &str) -> Result<OrderStatus> {
    Ok(match s {
        "pending" => OrderStatus::Pending,
        "open" => OrderStatus::Open,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        other => anyhow::bail!("bad order status in db: {other}"),
    })
}

fn margin_mode_parse(s: &str) -> Result<MarginMode> {
    Ok(match s {
        "cross" => MarginMode::Cross,
        "isolated" => MarginMode::Isolated,
        other => anyhow::bail!("bad margin mode in db: {other}"),
    })
}

fn position_side_parse(s: &str) -> Result<PositionSide> {
    Ok(match s {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        other => anyhow::bail!("bad position side in db: {other}"),
    })
}

fn position_status_parse(s: &str) -> Result<PositionStatus> {
    Ok(match s {
        "open" => PositionStatus::Open,
        "closing" => PositionStatus::Closing,
        "closed" => PositionStatus::Closed,
        "liquidating" => PositionStatus::Liquidating,
        "liquidated" => PositionStatus::Liquidated,
        other => anyhow::bail!("bad position status in db: {other}"),
    })
}

fn risk_level_parse(s: &str) -> Result<RiskLevel> {
    Ok(match s {
        "safe" => RiskLevel::Safe,
        "warning" => RiskLevel::Warning,
        "danger" => RiskLevel::Danger,
        "critical" => RiskLevel::Critical,
        "liquidation" => RiskLevel::Liquidation,
        other => anyhow::bail!("bad risk level in db: {other}"),
    })
}

fn order_from_row(row: &rusqlite::Row<'_>) -> Result<Order> {
    Ok(Order {
        order_id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        side: side_parse(&row.get::<_, String>(3)?)?,
        order_type: order_type_parse(&row.get::<_, String>(4)?)?,
        price: dec_opt(row.get(5)?)?,
        stop_price: dec_opt(row.get(6)?)?,
        quantity: dec(&row.get::<_, String>(7)?)?,
        filled: dec(&row.get::<_, String>(8)?)?,
        remaining: dec(&row.get::<_, String>(9)?)?,
        average_fill_price: dec(&row.get::<_, String>(10)?)?,
        fees: dec(&row.get::<_, String>(11)?)?,
        status: status_parse(&row.get::<_, String>(12)?)?,
        time_in_force: tif_parse(&row.get::<_, String>(13)?)?,
        flags: OrderFlags {
            hidden: row.get::<_, i64>(14)? != 0,
            reduce_only: row.get::<_, i64>(15)? != 0,
            post_only: row.get::<_, i64>(16)? != 0,
        },
        oco_linked_id: row.get(17)?,
        trailing: None,
        leverage: row.get(18)?,
        margin_mode: row
            .get::<_, Option<String>>(19)?
            .as_deref()
            .map(margin_mode_parse)
            .transpose()?,
        created_at: ts(&row.get::<_, String>(20)?)?,
        updated_at: ts(&row.get::<_, String>(21)?)?,
        triggered_at: row
            .get::<_, Option<String>>(22)?
            .as_deref()
            .map(ts)
            .transpose()?,
    })
}

fn position_from_row(row: &rusqlite::Row<'_>) -> Result<Position> {
    Ok(Position {
        position_id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        side: position_side_parse(&row.get::<_, String>(3)?)?,
        status: position_status_parse(&row.get::<_, String>(4)?)?,
        margin_mode: margin_mode_parse(&row.get::<_, String>(5)?)?,
        quantity: dec(&row.get::<_, String>(6)?)?,
        entry_price: dec(&row.get::<_, String>(7)?)?,
        mark_price: dec(&row.get::<_, String>(8)?)?,
        liquidation_price: dec(&row.get::<_, String>(9)?)?,
        bankruptcy_price: dec(&row.get::<_, String>(10)?)?,
        leverage: row.get(11)?,
        margin: dec(&row.get::<_, String>(12)?)?,
        maintenance_margin: dec(&row.get::<_, String>(13)?)?,
        margin_ratio: dec(&row.get::<_, String>(14)?)?,
        isolated_margin: dec_opt(row.get(15)?)?,
        unrealised_pnl: dec(&row.get::<_, String>(16)?)?,
        realised_pnl: dec(&row.get::<_, String>(17)?)?,
        risk_level: risk_level_parse(&row.get::<_, String>(18)?)?,
        opened_at: ts(&row.get::<_, String>(19)?)?,
        updated_at: ts(&row.get::<_, String>(20)?)?,
        closed_at: row
            .get::<_, Option<String>>(21)?
            .as_deref()
            .map(ts)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderFlags;
    use rust_decimal_macros::dec as d;

    fn sample_order() -> Order {
        let now = Utc::now();
        Order {
            order_id: "ORD-1-abc".into(),
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(d!(50000)),
            stop_price: None,
            quantity: d!(1.5),
            filled: d!(0.5),
            remaining: d!(1),
            average_fill_price: d!(49999.5),
            fees: d!(2.5),
            status: OrderStatus::PartiallyFilled,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags {
                hidden: true,
                ..Default::default()
            },
            oco_linked_id: Some("ORD-2-def".into()),
            trailing: None,
            leverage: Some(10),
            margin_mode: Some(MarginMode::Isolated),
            created_at: now,
            updated_at: now,
            triggered_at: None,
        }
    }

    #[test]
    fn test_order_roundtrip_preserves_decimals() {
        let store = Store::open_in_memory().unwrap();
        let order = sample_order();
        store.upsert_order(&order).unwrap();

        let loaded = store.load_open_orders().unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.order_id, order.order_id);
        assert_eq!(got.price, Some(d!(50000)));
        assert_eq!(got.filled, d!(0.5));
        assert_eq!(got.average_fill_price, d!(49999.5));
        assert!(got.flags.hidden);
        assert_eq!(got.oco_linked_id.as_deref(), Some("ORD-2-def"));
        assert_eq!(got.margin_mode, Some(MarginMode::Isolated));
    }

    #[test]
    fn test_filled_orders_not_loaded_as_open() {
        let store = Store::open_in_memory().unwrap();
        let mut order = sample_order();
        order.filled = order.quantity;
        order.remaining = Decimal::ZERO;
        order.status = OrderStatus::Filled;
        store.upsert_order(&order).unwrap();
        assert!(store.load_open_orders().unwrap().is_empty());
    }

    #[test]
    fn test_market_upsert_preserves_enabled() {
        let store = Store::open_in_memory().unwrap();
        let mut market = SymbolInfo {
            symbol: "BTCUSDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            tick_size: d!(0.01),
            step_size: d!(0.00001),
            min_notional: d!(10),
            enabled_sources: vec!["binance".into(), "kraken".into()],
            rank: 1,
            enabled: true,
        };
        store.upsert_market(&market).unwrap();
        store.set_market_enabled("BTCUSDT", false).unwrap();

        // catalogue refresh upserts again; enabled flag must survive
        market.rank = 2;
        store.upsert_market(&market).unwrap();
        let loaded = store.load_markets().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].enabled);
        assert_eq!(loaded[0].rank, 2);
        assert_eq!(loaded[0].enabled_sources.len(), 2);
    }

    #[test]
    fn test_wallet_save_and_load() {
        let store = Store::open_in_memory().unwrap();
        let balances = vec![
            Balance {
                asset: "USDT".into(),
                available: d!(900.12345678),
                locked: d!(99.87654322),
            },
            Balance {
                asset: "BTC".into(),
                available: d!(0.5),
                locked: Decimal::ZERO,
            },
        ];
        store.save_wallet("u1", &balances).unwrap();
        let loaded = store.load_wallet("u1").unwrap();
        assert_eq!(loaded.len(), 2);
        let usdt = loaded.iter().find(|b| b.asset == "USDT").unwrap();
        assert_eq!(usdt.available, d!(900.12345678));
        assert_eq!(usdt.total(), d!(1000.00000000));
    }

    #[test]
    fn test_insurance_fund_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_insurance_fund().unwrap().is_none());
        store
            .save_insurance_fund(d!(1000000), d!(500), d!(200))
            .unwrap();
        let (b, c, p) = store.load_insurance_fund().unwrap().unwrap();
        assert_eq!((b, c, p), (d!(1000000), d!(500), d!(200)));
    }
}
