//! Order path: controller, per-symbol matching workers, triggers.

pub mod controller;
pub mod ids;
pub mod matching;
pub mod triggers;
pub mod worker;

pub use controller::{OrderController, PlaceOrder};
pub use worker::{EngineHandle, MatchingRouter};
