//! Kraken REST poll feed.
//!
//! Kraken's public Ticker endpoint returns every requested pair in one
//! response, so a single poll covers the whole subscription set. Kraken
//! spells a few assets its own way (XBT for BTC, XDG for DOGE).

use crate::feeds::adapter::{AdapterCore, PollSource};
use crate::models::PriceTick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub struct KrakenFeed {
    client: reqwest::Client,
    url: String,
    poll_interval: Duration,
}

impl KrakenFeed {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            url: "https://api.kraken.com/0/public/Ticker".to_string(),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Canonical -> Kraken pair spelling.
fn kraken_pair(canonical: &str) -> String {
    canonical.replace("BTC", "XBT").replace("DOGE", "XDG")
}

#[derive(Deserialize)]
struct TickerResponse {
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, PairTicker>,
}

#[derive(Deserialize)]
struct PairTicker {
    /// ask [price, whole lot volume, lot volume]
    a: Vec<String>,
    /// bid [price, whole lot volume, lot volume]
    b: Vec<String>,
    /// last trade closed [price, lot volume]
    c: Vec<String>,
    /// volume [today, last 24 hours]
    v: Vec<String>,
    /// vwap [today, last 24 hours]
    #[serde(default)]
    p: Vec<String>,
}

fn dec_at(values: &[String], idx: usize) -> Option<Decimal> {
    values.get(idx).and_then(|s| Decimal::from_str(s).ok())
}

#[async_trait]
impl PollSource for KrakenFeed {
    fn source(&self) -> &str {
        "kraken"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(
        &self,
        symbols: &HashMap<String, String>,
        core: &AdapterCore,
    ) -> Result<Vec<PriceTick>> {
        // kraken pair -> canonical
        let pairs: HashMap<String, String> = symbols
            .values()
            .map(|canonical| (kraken_pair(canonical), canonical.clone()))
            .collect();
        let pair_param: Vec<&str> = pairs.keys().map(String::as_str).collect();

        let resp: TickerResponse = self
            .client
            .get(&self.url)
            .query(&[("pair", pair_param.join(","))])
            .send()
            .await
            .context("kraken ticker request")?
            .error_for_status()
            .context("kraken ticker status")?
            .json()
            .await
            .context("kraken ticker parse")?;

        if !resp.error.is_empty() {
            anyhow::bail!("kraken error: {}", resp.error.join("; "));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut out = Vec::with_capacity(resp.result.len());
        for (pair, ticker) in resp.result {
            let Some(canonical) = pairs.get(&pair) else {
                continue;
            };
            let (Some(last), Some(bid), Some(ask)) = (
                dec_at(&ticker.c, 0),
                dec_at(&ticker.b, 0),
                dec_at(&ticker.a, 0),
            ) else {
                continue;
            };
            let volume_24h = dec_at(&ticker.v, 1).unwrap_or(Decimal::ZERO);
            let vwap_24h = dec_at(&ticker.p, 1).unwrap_or(last);
            out.push(PriceTick {
                symbol: canonical.clone(),
                last,
                bid,
                ask,
                bid_size: dec_at(&ticker.b, 2).unwrap_or(Decimal::ZERO),
                ask_size: dec_at(&ticker.a, 2).unwrap_or(Decimal::ZERO),
                volume_24h,
                quote_volume_24h: volume_24h * vwap_24h,
                timestamp: now,
                source: "kraken".into(),
                sequence: core.next_sequence(),
            });
        }
        Ok(out)
    }
}
