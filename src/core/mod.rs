//! Core infrastructure for the delivery engine.
//!
//! - `config` - Delivery tuning knobs and validation
//! - `executor` - Serial queue executor and a deterministic test driver
//! - `latch` - Reusable counting latch for delivery flushes
//! - `time` - Deterministic time utilities

pub mod config;
pub mod executor;
pub mod latch;
pub mod time;

pub use config::*;
pub use executor::*;
pub use latch::*;
pub use time::*;
