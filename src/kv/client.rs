//! Resilient key-value client
//!
//! Wraps a [`KvConnector`] with lazy connection setup, retry on transient
//! failures, a background health-check loop and JSON encoding. Values that
//! fail to decode are logged and read back as absent rather than erroring.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{KvConnection, KvConnector, KvOp, RetryPolicy};
use crate::error::{Error, Result};

/// Health flags shared between the client and its health-check task
#[derive(Debug, Default)]
struct HealthState {
    healthy: AtomicBool,
    /// Unix millis of the last completed ping, 0 when none yet
    last_check_ms: AtomicI64,
}

impl HealthState {
    fn record(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        self.last_check_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    fn snapshot(&self) -> HealthSnapshot {
        let last = self.last_check_ms.load(Ordering::SeqCst);
        HealthSnapshot {
            healthy: self.healthy.load(Ordering::SeqCst),
            last_health_check: (last > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last))
                .flatten(),
        }
    }
}

/// Point-in-time view of client health
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
}

type ConnectionSlot = Arc<Mutex<Option<Arc<dyn KvConnection>>>>;

/// Key-value client with retries and health monitoring
pub struct KvClient {
    connector: Arc<dyn KvConnector>,
    connection: ConnectionSlot,
    health: Arc<HealthState>,
    retry: RetryPolicy,
    health_interval: Duration,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl KvClient {
    pub fn new(
        connector: Arc<dyn KvConnector>,
        retry: RetryPolicy,
        health_interval: Duration,
    ) -> Self {
        Self {
            connector,
            connection: Arc::new(Mutex::new(None)),
            health: Arc::new(HealthState::default()),
            retry,
            health_interval,
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
        }
    }

    /// Connect and start the health-check loop. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_connection().await?;

        let mut task = self.health_task.lock().await;
        if task.as_ref().map_or(true, |handle| handle.is_finished()) {
            *task = Some(self.spawn_health_loop());
            info!(
                target_store = %self.connector.describe(),
                interval_secs = self.health_interval.as_secs(),
                "KV client initialized"
            );
        }
        Ok(())
    }

    /// Stop the health loop and drop the connection
    pub async fn close(&self) {
        self.shutdown.cancel();

        if let Some(handle) = self.health_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Health-check task ended abnormally: {}", e);
            }
        }

        self.connection.lock().await.take();
        self.health.mark_unhealthy();
        info!("KV client closed");
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.healthy.load(Ordering::SeqCst)
    }

    /// Token that aborts in-flight retries when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Return the live connection, (re)connecting if absent or unhealthy
    async fn ensure_connection(&self) -> Result<Arc<dyn KvConnection>> {
        let mut slot = self.connection.lock().await;

        if let Some(conn) = slot.as_ref() {
            if self.is_healthy() {
                return Ok(conn.clone());
            }
        }

        debug!(target_store = %self.connector.describe(), "Opening KV connection");
        let conn = match self.connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                self.health.record(false);
                return Err(e);
            }
        };
        conn.ping().await.inspect_err(|_| self.health.record(false))?;

        self.health.record(true);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let health = self.health.clone();
        let shutdown = self.shutdown.clone();
        let period = self.health_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick fires immediately; the connection was just verified
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Health-check loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Clone out of the slot so pings never hold the lock
                        let conn = connection.lock().await.clone();
                        let healthy = match conn {
                            Some(conn) => match conn.ping().await {
                                Ok(()) => true,
                                Err(e) => {
                                    warn!("KV health check failed: {}", e);
                                    false
                                }
                            },
                            None => false,
                        };
                        health.record(healthy);
                        debug!(healthy = healthy, "KV health check");
                    }
                }
            }
        })
    }

    /// Run `op` against a live connection under the retry policy
    async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn KvConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = &op;
        self.retry
            .run(operation, &self.shutdown, move || async move {
                let conn = self.ensure_connection().await?;
                op(conn).await.inspect_err(|e| {
                    if e.is_retryable() {
                        self.health.mark_unhealthy();
                    }
                })
            })
            .await
    }

    /// Fetch and decode a JSON value. Undecodable payloads read as `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self
            .execute("get", |conn| async move { conn.get(key).await })
            .await?;

        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    /// Encode and store a JSON value, optionally with a TTL
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let payload = encode(value)?;
        self.execute("set", |conn| {
            let payload = payload.clone();
            async move { conn.set(key, payload, ttl).await }
        })
        .await
    }

    /// Decode list entries in `[start, stop]`, skipping any that fail to decode
    pub async fn get_list<T: DeserializeOwned>(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<T>> {
        let raw = self
            .execute("lrange", |conn| async move {
                conn.lrange(key, start, stop).await
            })
            .await?;

        Ok(raw.iter().filter_map(|item| decode(key, item)).collect())
    }

    /// Push to the head of a list, trimming to `max_len` entries
    pub async fn push_to_list<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        max_len: Option<usize>,
    ) -> Result<u64> {
        let payload = encode(value)?;
        self.execute("push", |conn| {
            let payload = payload.clone();
            async move { conn.push_trim(key, payload, max_len).await }
        })
        .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.execute("exists", |conn| async move { conn.exists(key).await })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.execute("delete", |conn| async move { conn.delete(key).await })
            .await
    }

    pub async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.execute("expire", |conn| async move { conn.expire(key, ttl).await })
            .await
    }

    /// Fetch several JSON values in one round trip
    pub async fn get_multiple<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<T>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let raw = self
            .execute("mget", |conn| async move { conn.mget(keys).await })
            .await?;

        Ok(keys
            .iter()
            .zip(raw)
            .map(|(key, value)| {
                let decoded = value.and_then(|raw| decode(key, &raw));
                (key.clone(), decoded)
            })
            .collect())
    }

    /// Apply all ops atomically
    pub async fn atomic_transaction(&self, ops: &[KvOp]) -> Result<Vec<bool>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        self.execute("transaction", |conn| async move { conn.transaction(ops).await })
            .await
            .inspect_err(|e| error!(ops = ops.len(), "Atomic transaction failed: {}", e))
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = key, "Discarding undecodable stored value: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryConnector;
    use serde_json::{json, Value};

    fn test_client(connector: MemoryConnector) -> KvClient {
        KvClient::new(
            Arc::new(connector),
            RetryPolicy::new(3, Duration::from_millis(1), 2.0),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_json_round_trip_with_ttl() {
        let client = test_client(MemoryConnector::new());
        client.initialize().await.unwrap();

        let value = json!({"bias": "bullish", "confidence": 80});
        assert!(client
            .set_json("bias:SPY", &value, Some(Duration::from_secs(60)))
            .await
            .unwrap());

        let read: Option<Value> = client.get_json("bias:SPY").await.unwrap();
        assert_eq!(read, Some(value));
        assert!(client.exists("bias:SPY").await.unwrap());
        assert!(client.health().healthy);
        assert!(client.health().last_health_check.is_some());

        client.close().await;
    }

    /// Poll until `client.is_healthy()` equals `expected`
    async fn wait_for_health(client: &KvClient, expected: bool) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.is_healthy() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_health_loop_tracks_ping_failures() {
        let connector = MemoryConnector::new();
        let client = KvClient::new(
            Arc::new(connector.clone()),
            RetryPolicy::none(),
            Duration::from_millis(20),
        );
        client.initialize().await.unwrap();
        assert!(client.health().healthy);
        let first_check = client.health().last_health_check;

        connector.fail_next(u32::MAX);
        assert!(wait_for_health(&client, false).await);
        let snapshot = client.health();
        assert!(!snapshot.healthy);
        assert!(snapshot.last_health_check >= first_check);

        connector.fail_next(0);
        assert!(wait_for_health(&client, true).await);

        client.close().await;
        assert!(!client.is_healthy());
    }

    #[tokio::test]
    async fn test_corrupt_value_reads_as_absent() {
        let connector = MemoryConnector::new();
        connector.insert_raw("bias:SPY", "{not json");
        let client = test_client(connector);

        let read: Option<Value> = client.get_json("bias:SPY").await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_list_trim_and_corrupt_entries_skipped() {
        let connector = MemoryConnector::new();
        let client = test_client(connector.clone());

        for i in 0..5 {
            client
                .push_to_list("changes:SPY", &json!({"n": i}), Some(3))
                .await
                .unwrap();
        }
        connector.push_raw("changes:SPY", "garbage");

        let items: Vec<Value> = client.get_list("changes:SPY", 0, -1).await.unwrap();
        // Newest first, oldest two trimmed, garbage skipped
        assert_eq!(items, vec![json!({"n": 4}), json!({"n": 3}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let connector = MemoryConnector::new();
        let client = test_client(connector.clone());
        client.set_json("k", &json!(1), None).await.unwrap();

        connector.fail_next(2);
        let read: Option<Value> = client.get_json("k").await.unwrap();
        assert_eq!(read, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_error() {
        let connector = MemoryConnector::new();
        let client = test_client(connector.clone());
        client.set_json("k", &json!(1), None).await.unwrap();

        connector.fail_next(10);
        let result: Result<Option<Value>> = client.get_json("k").await;
        assert!(matches!(result, Err(Error::StorageConnection(_))));
        assert!(!client.is_healthy());
    }

    #[tokio::test]
    async fn test_get_multiple_and_transaction() {
        let client = test_client(MemoryConnector::new());
        client.set_json("a", &json!("x"), None).await.unwrap();
        client.set_json("b", &json!("y"), None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values: HashMap<String, Option<Value>> = client.get_multiple(&keys).await.unwrap();
        assert_eq!(values["a"], Some(json!("x")));
        assert_eq!(values["c"], None);

        let ops: Vec<KvOp> = keys.iter().cloned().map(KvOp::Delete).collect();
        let removed = client.atomic_transaction(&ops).await.unwrap();
        assert_eq!(removed, vec![true, true, false]);
        assert!(!client.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_operations_after_close_are_cancelled() {
        let connector = MemoryConnector::new();
        let client = test_client(connector.clone());
        client.initialize().await.unwrap();
        client.close().await;

        connector.fail_next(100);
        let result: Result<Option<Value>> = client.get_json("k").await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
