//! WebSocket session fanout.

pub mod server;

pub use server::{ws_handler, FanoutConfig, FanoutState, Session};
