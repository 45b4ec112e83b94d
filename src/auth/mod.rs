//! Session authentication.

pub mod jwt;

pub use jwt::{Claims, JwtHandler, UserRole};
