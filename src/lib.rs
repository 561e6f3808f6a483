//! Trading Memory Library
//!
//! Persistent bias memory and consistency enforcement for an AI trading
//! assistant. Stores the current directional bias per symbol, its change
//! history and the decision log, and refuses bias changes that break the
//! holding-period, reversal or invalidation rules.

pub mod cli;
pub mod config;
pub mod consistency;
pub mod error;
pub mod kv;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use service::TradingMemory;
