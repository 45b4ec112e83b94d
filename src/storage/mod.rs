//! Durable state: SQLite store and the wallet ledger on top of it.

pub mod db;
pub mod wallet;

pub use db::Store;
pub use wallet::WalletLedger;
