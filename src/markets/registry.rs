//! Symbol registry.
//!
//! Canonical set of tradable pairs with per-exchange mappings and order
//! constraints. Refresh rebuilds the set from upstream catalogues but never
//! fails callers: an unreachable catalogue keeps the previous set, and the
//! operator-controlled `enabled` flag always survives a refresh.

use crate::models::SymbolInfo;
use crate::storage::db::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// One upstream symbol catalogue (exchange listing endpoint).
#[async_trait]
pub trait CatalogueSource: Send + Sync {
    fn source(&self) -> &str;
    async fn fetch(&self) -> Result<Vec<SymbolInfo>>;
}

/// Binance spot exchangeInfo catalogue.
pub struct BinanceCatalogue {
    client: reqwest::Client,
    url: String,
}

impl BinanceCatalogue {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            url: "https://api.binance.com/api/v3/exchangeInfo".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeSymbol {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    status: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

impl ExchangeSymbol {
    fn filter_value(&self, filter_type: &str, key: &str) -> Option<Decimal> {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(filter_type))
            .and_then(|f| f.get(key))
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
    }
}

#[async_trait]
impl CatalogueSource for BinanceCatalogue {
    fn source(&self) -> &str {
        "binance"
    }

    async fn fetch(&self) -> Result<Vec<SymbolInfo>> {
        let info: ExchangeInfo = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("fetch exchangeInfo")?
            .error_for_status()
            .context("exchangeInfo status")?
            .json()
            .await
            .context("parse exchangeInfo")?;

        let mut out = Vec::new();
        for (rank, s) in info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING" && s.quote_asset == "USDT")
            .enumerate()
        {
            out.push(SymbolInfo {
                tick_size: s
                    .filter_value("PRICE_FILTER", "tickSize")
                    .unwrap_or(dec!(0.01)),
                step_size: s
                    .filter_value("LOT_SIZE", "stepSize")
                    .unwrap_or(dec!(0.00001)),
                min_notional: s
                    .filter_value("NOTIONAL", "minNotional")
                    .unwrap_or(dec!(10)),
                symbol: s.symbol,
                base: s.base_asset,
                quote: s.quote_asset,
                enabled_sources: vec!["binance".into()],
                rank: rank as u32 + 1,
                enabled: true,
            });
        }
        Ok(out)
    }
}

/// Fixed catalogue for boot-strapping and offline runs: the majors, listed
/// on every configured source.
pub struct StaticCatalogue {
    sources: Vec<String>,
}

impl StaticCatalogue {
    pub fn new(sources: Vec<String>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl CatalogueSource for StaticCatalogue {
    fn source(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Vec<SymbolInfo>> {
        let majors = [
            ("BTCUSDT", "BTC", "0.01", "0.00001"),
            ("ETHUSDT", "ETH", "0.01", "0.0001"),
            ("SOLUSDT", "SOL", "0.001", "0.01"),
            ("BNBUSDT", "BNB", "0.01", "0.001"),
            ("XRPUSDT", "XRP", "0.0001", "1"),
            ("ADAUSDT", "ADA", "0.0001", "1"),
            ("DOGEUSDT", "DOGE", "0.00001", "1"),
            ("LTCUSDT", "LTC", "0.01", "0.001"),
        ];
        Ok(majors
            .iter()
            .enumerate()
            .map(|(rank, (symbol, base, tick, step))| SymbolInfo {
                symbol: symbol.to_string(),
                base: base.to_string(),
                quote: "USDT".to_string(),
                tick_size: Decimal::from_str(tick).expect("static tick"),
                step_size: Decimal::from_str(step).expect("static step"),
                min_notional: dec!(10),
                enabled_sources: self.sources.clone(),
                rank: rank as u32 + 1,
                enabled: true,
            })
            .collect())
    }
}

pub struct SymbolRegistry {
    store: Arc<Store>,
    symbols: RwLock<HashMap<String, SymbolInfo>>,
    catalogues: Vec<Box<dyn CatalogueSource>>,
}

impl SymbolRegistry {
    pub fn new(store: Arc<Store>, catalogues: Vec<Box<dyn CatalogueSource>>) -> Self {
        Self {
            store,
            symbols: RwLock::new(HashMap::new()),
            catalogues,
        }
    }

    /// Load the persisted set at boot.
    pub fn load(&self) -> Result<usize> {
        let markets = self.store.load_markets()?;
        let mut symbols = self.symbols.write();
        for m in markets {
            symbols.insert(m.symbol.clone(), m);
        }
        Ok(symbols.len())
    }

    /// Rebuild the set from the catalogues, merging per-source listings and
    /// preserving existing `enabled` flags. Catalogue failures are logged
    /// and skipped; the previous set survives.
    pub async fn refresh(&self) -> usize {
        let mut merged: HashMap<String, SymbolInfo> = HashMap::new();
        let mut fetched_any = false;

        for catalogue in &self.catalogues {
            match catalogue.fetch().await {
                Ok(listings) => {
                    fetched_any = true;
                    for listing in listings {
                        match merged.get_mut(&listing.symbol) {
                            Some(existing) => {
                                for src in listing.enabled_sources {
                                    if !existing.enabled_sources.contains(&src) {
                                        existing.enabled_sources.push(src);
                                    }
                                }
                                existing.rank = existing.rank.min(listing.rank);
                            }
                            None => {
                                merged.insert(listing.symbol.clone(), listing);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(source = catalogue.source(), error = %e, "catalogue fetch failed");
                }
            }
        }

        if !fetched_any {
            let count = self.symbols.read().len();
            warn!("all catalogues unavailable; keeping previous symbol set");
            return count;
        }

        let mut symbols = self.symbols.write();
        for (name, mut info) in merged {
            if let Some(existing) = symbols.get(&name) {
                info.enabled = existing.enabled;
            }
            if let Err(e) = self.store.upsert_market(&info) {
                warn!(symbol = %name, error = %e, "market upsert failed");
            }
            symbols.insert(name, info);
        }
        info!(count = symbols.len(), "symbol registry refreshed");
        symbols.len()
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolInfo> {
        self.symbols.read().get(symbol).cloned()
    }

    /// List symbols, optionally only enabled ones, ordered by rank.
    pub fn list(&self, enabled_only: bool) -> Vec<SymbolInfo> {
        let mut out: Vec<SymbolInfo> = self
            .symbols
            .read()
            .values()
            .filter(|s| !enabled_only || s.enabled)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.rank);
        out
    }

    pub fn toggle(&self, symbol: &str, enabled: bool) -> bool {
        let mut symbols = self.symbols.write();
        let Some(info) = symbols.get_mut(symbol) else {
            return false;
        };
        info.enabled = enabled;
        if let Err(e) = self.store.set_market_enabled(symbol, enabled) {
            warn!(symbol, error = %e, "market toggle persist failed");
        }
        true
    }

    /// Upstream identifier for `symbol` on `source`, or `None`.
    pub fn map(&self, symbol: &str, source: &str) -> Option<String> {
        self.symbols.read().get(symbol)?.source_symbol(source)
    }

    /// Enabled symbols a source should subscribe to, best-ranked first,
    /// bounded by the adapter's capacity.
    pub fn symbols_for_source(&self, source: &str, cap: usize) -> Vec<String> {
        let mut listed: Vec<&SymbolInfo> = Vec::new();
        let guard = self.symbols.read();
        for info in guard.values() {
            if info.enabled && info.enabled_sources.iter().any(|s| s == source) {
                listed.push(info);
            }
        }
        listed.sort_by_key(|s| s.rank);
        listed
            .into_iter()
            .take(cap)
            .map(|s| s.symbol.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_static() -> SymbolRegistry {
        let store = Arc::new(Store::open_in_memory().unwrap());
        SymbolRegistry::new(
            store,
            vec![Box::new(StaticCatalogue::new(vec![
                "binance".into(),
                "coinbase".into(),
            ]))],
        )
    }

    #[tokio::test]
    async fn test_refresh_populates_and_persists() {
        let registry = registry_with_static();
        let n = registry.refresh().await;
        assert!(n >= 8);
        let btc = registry.get("BTCUSDT").unwrap();
        assert_eq!(btc.base, "BTC");
        assert!(btc.enabled);
        assert_eq!(registry.map("BTCUSDT", "coinbase").as_deref(), Some("BTC-USDT"));
    }

    #[tokio::test]
    async fn test_toggle_survives_refresh() {
        let registry = registry_with_static();
        registry.refresh().await;
        assert!(registry.toggle("ETHUSDT", false));
        registry.refresh().await;
        assert!(!registry.get("ETHUSDT").unwrap().enabled);
        // disabled symbols are skipped for subscriptions
        let symbols = registry.symbols_for_source("binance", 100);
        assert!(!symbols.contains(&"ETHUSDT".to_string()));
    }

    #[tokio::test]
    async fn test_symbols_for_source_respects_cap_and_rank() {
        let registry = registry_with_static();
        registry.refresh().await;
        let symbols = registry.symbols_for_source("binance", 3);
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols[0], "BTCUSDT");
    }

    #[tokio::test]
    async fn test_failed_catalogue_keeps_previous_set() {
        struct Failing;
        #[async_trait]
        impl CatalogueSource for Failing {
            fn source(&self) -> &str {
                "failing"
            }
            async fn fetch(&self) -> Result<Vec<SymbolInfo>> {
                anyhow::bail!("catalogue down")
            }
        }

        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = SymbolRegistry::new(
            store.clone(),
            vec![
                Box::new(StaticCatalogue::new(vec!["binance".into()])),
                Box::new(Failing),
            ],
        );
        let n = registry.refresh().await;
        assert!(n >= 8);

        // now only the failing catalogue
        let registry2 = SymbolRegistry::new(store, vec![Box::new(Failing)]);
        registry2.load().unwrap();
        let before = registry2.list(false).len();
        let after = registry2.refresh().await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_toggle_unknown_symbol_is_false() {
        let registry = registry_with_static();
        assert!(!registry.toggle("NOPEUSDT", true));
    }
}
