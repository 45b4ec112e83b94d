//! Binance spot push feed (combined 24hr ticker streams).

use crate::feeds::adapter::{AdapterCore, PushSource};
use crate::models::PriceTick;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub struct BinanceFeed;

#[derive(Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: TickerData,
}

#[derive(Deserialize)]
struct TickerData {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last: String,
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "B")]
    bid_size: String,
    #[serde(rename = "a")]
    ask: String,
    #[serde(rename = "A")]
    ask_size: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
}

fn dec(s: &str) -> Option<Decimal> {
    Decimal::from_str(s).ok()
}

#[async_trait]
impl PushSource for BinanceFeed {
    fn source(&self) -> &str {
        "binance"
    }

    fn url(&self, upstream_symbols: &[String]) -> String {
        let streams: Vec<String> = upstream_symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        format!(
            "wss://stream.binance.com:9443/stream?streams={}",
            streams.join("/")
        )
    }

    fn subscribe_payload(&self, _upstream_symbols: &[String]) -> Option<String> {
        // subscriptions ride on the URL for combined streams
        None
    }

    fn heartbeat(&self) -> Option<(Duration, String)> {
        // Binance pings us; we only answer pongs.
        None
    }

    fn parse(
        &self,
        text: &str,
        symbols: &HashMap<String, String>,
        core: &AdapterCore,
    ) -> Option<PriceTick> {
        let frame: CombinedFrame = serde_json::from_str(text).ok()?;
        if frame.data.event != "24hrTicker" {
            return None;
        }
        let canonical = symbols.get(&frame.data.symbol)?;
        Some(PriceTick {
            symbol: canonical.clone(),
            last: dec(&frame.data.last)?,
            bid: dec(&frame.data.bid)?,
            ask: dec(&frame.data.ask)?,
            bid_size: dec(&frame.data.bid_size)?,
            ask_size: dec(&frame.data.ask_size)?,
            volume_24h: dec(&frame.data.volume)?,
            quote_volume_24h: dec(&frame.data.quote_volume)?,
            timestamp: frame.data.event_time,
            source: "binance".into(),
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
        AdapterCore::new("binance", d!(0.5), tx)
    }

    #[test]
    fn test_parse_combined_ticker_frame() {
        let feed = BinanceFeed;
        let symbols: HashMap<String, String> =
            [("BTCUSDT".to_string(), "BTCUSDT".to_string())].into();
        let text = r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000123,
            "s":"BTCUSDT","c":"50000.5","b":"50000.1","B":"1.5","a":"50000.9","A":"0.7",
            "v":"12345.6","q":"617280000"}}"#;
        let tick = feed.parse(text, &symbols, &core()).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.last, d!(50000.5));
        assert_eq!(tick.bid, d!(50000.1));
        assert_eq!(tick.ask, d!(50000.9));
        assert_eq!(tick.timestamp, 1700000000123);
        assert!(tick.is_valid());
    }

    #[test]
    fn test_parse_ignores_other_events() {
        let feed = BinanceFeed;
        let symbols: HashMap<String, String> =
            [("BTCUSDT".to_string(), "BTCUSDT".to_string())].into();
        let text = r#"{"stream":"btcusdt@depth","data":{"e":"depthUpdate","E":1,"s":"BTCUSDT",
            "c":"0","b":"0","B":"0","a":"0","A":"0","v":"0","q":"0"}}"#;
        assert!(feed.parse(text, &symbols, &core()).is_none());
    }

    #[test]
    fn test_parse_ignores_unsubscribed_symbols() {
        let feed = BinanceFeed;
        let symbols: HashMap<String, String> =
            [("ETHUSDT".to_string(), "ETHUSDT".to_string())].into();
        let text = r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1,"s":"BTCUSDT",
            "c":"1","b":"1","B":"1","a":"2","A":"1","v":"1","q":"1"}}"#;
        assert!(feed.parse(text, &symbols, &core()).is_none());
    }

    #[test]
    fn test_url_builds_combined_streams() {
        let feed = BinanceFeed;
        let url = feed.url(&["BTCUSDT".into(), "ETHUSDT".into()]);
        assert!(url.starts_with("wss://stream.binance.com:9443/stream?streams="));
        assert!(url.contains("btcusdt@ticker/ethusdt@ticker"));
    }
}
