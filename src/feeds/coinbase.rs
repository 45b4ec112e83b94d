//! Coinbase Exchange push feed (ticker channel).

use crate::feeds::adapter::{AdapterCore, PushSource};
use crate::models::PriceTick;
use async_trait::async_trait;
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub struct CoinbaseFeed;

#[derive(Deserialize)]
struct TickerMsg {
    #[serde(rename = "type")]
    msg_type: String,
    product_id: String,
    price: String,
    best_bid: String,
    best_ask: String,
    #[serde(default)]
    best_bid_size: Option<String>,
    #[serde(default)]
    best_ask_size: Option<String>,
    #[serde(default)]
    volume_24h: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

fn dec(s: &str) -> Option<Decimal> {
    Decimal::from_str(s).ok()
}

fn dec_or_zero(s: &Option<String>) -> Decimal {
    s.as_deref()
        .and_then(|v| Decimal::from_str(v).ok())
        .unwrap_or(Decimal::ZERO)
}

#[async_trait]
impl PushSource for CoinbaseFeed {
    fn source(&self) -> &str {
        "coinbase"
    }

    fn url(&self, _upstream_symbols: &[String]) -> String {
        "wss://ws-feed.exchange.coinbase.com".to_string()
    }

    fn subscribe_payload(&self, upstream_symbols: &[String]) -> Option<String> {
        Some(
            serde_json::json!({
                "type": "subscribe",
                "product_ids": upstream_symbols,
                "channels": ["ticker", "heartbeat"],
            })
            .to_string(),
        )
    }

    fn heartbeat(&self) -> Option<(Duration, String)> {
        // the heartbeat channel keeps the session warm server-side
        None
    }

    fn parse(
        &self,
        text: &str,
        symbols: &HashMap<String, String>,
        core: &AdapterCore,
    ) -> Option<PriceTick> {
        let msg: TickerMsg = serde_json::from_str(text).ok()?;
        if msg.msg_type != "ticker" {
            if msg.msg_type == "heartbeat" {
                core.record_heartbeat();
            }
            return None;
        }
        let canonical = symbols.get(&msg.product_id)?;
        let last = dec(&msg.price)?;
        let timestamp = msg
            .time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        Some(PriceTick {
            symbol: canonical.clone(),
            last,
            bid: dec(&msg.best_bid)?,
            ask: dec(&msg.best_ask)?,
            bid_size: dec_or_zero(&msg.best_bid_size),
            ask_size: dec_or_zero(&msg.best_ask_size),
            volume_24h: dec_or_zero(&msg.volume_24h),
            quote_volume_24h: dec_or_zero(&msg.volume_24h) * last,
            timestamp,
            source: "coinbase".into(),
            sequence: core.next_sequence(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::adapter::FeedUpdate;
    use rust_decimal_macros::dec as d;
    use tokio::sync::mpsc;

    fn core() -> std::sync::Arc<AdapterCore> {
        let (tx, _rx): (mpsc::Sender<FeedUpdate>, _) = mpsc::channel(8);
        AdapterCore::new("coinbase", d!(0.5), tx)
    }

    #[test]
    fn test_parse_ticker() {
        let feed = CoinbaseFeed;
        let symbols: HashMap<String, String> =
            [("BTC-USDT".to_string(), "BTCUSDT".to_string())].into();
        let text = r#"{"type":"ticker","product_id":"BTC-USDT","price":"50000.5",
            "best_bid":"50000.1","best_ask":"50000.9","best_bid_size":"0.5",
            "best_ask_size":"0.4","volume_24h":"321.5","time":"2023-11-14T22:13:20.123Z"}"#;
        let tick = feed.parse(text, &symbols, &core()).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.source, "coinbase");
        assert_eq!(tick.bid, d!(50000.1));
        assert!(tick.is_valid());
        assert_eq!(tick.quote_volume_24h, d!(321.5) * d!(50000.5));
    }

    #[test]
    fn test_parse_ignores_subscription_acks() {
        let feed = CoinbaseFeed;
        let symbols = HashMap::new();
        let text = r#"{"type":"subscriptions","product_id":"","price":"0","best_bid":"0","best_ask":"0"}"#;
        assert!(feed.parse(text, &symbols, &core()).is_none());
    }

    #[test]
    fn test_subscribe_payload_lists_products() {
        let feed = CoinbaseFeed;
        let payload = feed
            .subscribe_payload(&["BTC-USDT".into(), "ETH-USDT".into()])
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["product_ids"][0], "BTC-USDT");
        assert_eq!(json["channels"][0], "ticker");
    }
}
