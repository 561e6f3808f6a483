//! Key-value storage layer
//!
//! A backend is split in two halves: a [`KvConnector`] that knows how to open
//! a connection and the [`KvConnection`] it yields. [`KvClient`] owns the
//! connection lifecycle on top of that, adding retries, health checks and
//! JSON (de)serialization.

pub mod client;
pub mod memory;
pub mod redis_backend;
pub mod retry;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub use client::{HealthSnapshot, KvClient};
pub use memory::MemoryConnector;
pub use redis_backend::RedisConnector;
pub use retry::RetryPolicy;

/// One step of an atomic multi-key transaction
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Delete(String),
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Raw string-level operations a backend must provide
#[async_trait]
pub trait KvConnection: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool>;

    /// Inclusive range, negative indices count from the tail
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Push to the head, then trim to `max_len` when given. Returns the length after the push.
    async fn push_trim(&self, key: &str, value: String, max_len: Option<usize>) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Apply every op or none. One flag per op: key removed, value written, expiry applied.
    async fn transaction(&self, ops: &[KvOp]) -> Result<Vec<bool>>;

    async fn ping(&self) -> Result<()>;
}

/// Opens connections to a backend
#[async_trait]
pub trait KvConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn KvConnection>>;

    /// Human-readable target, safe to log
    fn describe(&self) -> String;
}
