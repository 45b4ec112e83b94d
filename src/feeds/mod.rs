//! Upstream price feeds: one adapter per source, merged by the aggregator.

pub mod adapter;
pub mod aggregator;
pub mod binance;
pub mod coinbase;
pub mod kraken;

pub use adapter::{AdapterCore, FeedUpdate};
pub use aggregator::PriceAggregator;
