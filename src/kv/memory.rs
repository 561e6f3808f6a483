//! In-process key-value backend
//!
//! Mirrors the subset of Redis semantics the client relies on: string
//! values, head-pushed lists, per-key expiry and all-or-nothing
//! transactions. Used for local runs and throughout the test suite.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{KvConnection, KvConnector, KvOp};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    /// Number of upcoming operations that fail with a connection error
    pending_failures: AtomicU32,
}

impl Shared {
    /// Lock the map with expired keys purged
    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries)
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(Error::StorageConnection("injected connection failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Connector for the in-process backend. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations (pings included) fail with a transient error
    pub fn fail_next(&self, n: u32) {
        self.shared.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Store a raw string without JSON encoding
    pub fn insert_raw(&self, key: &str, raw: &str) {
        if let Ok(mut entries) = self.shared.entries() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(raw.to_string()),
                    expires_at: None,
                },
            );
        }
    }

    /// Push a raw string to the head of a list without JSON encoding
    pub fn push_raw(&self, key: &str, raw: &str) {
        if let Ok(mut entries) = self.shared.entries() {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            if let Value::List(list) = &mut entry.value {
                list.push_front(raw.to_string());
            }
        }
    }

    /// Remaining TTL of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.shared.entries().ok()?;
        let expires_at = entries.get(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    pub fn key_count(&self) -> usize {
        self.shared.entries().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl KvConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn KvConnection>> {
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
}

fn wrong_type(key: &str) -> Error {
    Error::Storage(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// Resolve a Redis-style inclusive range against a list length
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn apply_op(entries: &mut HashMap<String, Entry>, op: &KvOp) -> bool {
    match op {
        KvOp::Delete(key) => entries.remove(key).is_some(),
        KvOp::Set { key, value, ttl } => {
            entries.insert(
                key.clone(),
                Entry {
                    value: Value::Str(value.clone()),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            true
        }
        KvOp::Expire { key, ttl } => match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + *ttl);
                true
            }
            None => false,
        },
    }
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.shared.check_failure()?;
        let entries = self.shared.entries()?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::List(_)) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool> {
        self.shared.check_failure()?;
        let mut entries = self.shared.entries()?;
        Ok(apply_op(
            &mut entries,
            &KvOp::Set {
                key: key.to_string(),
                value,
                ttl,
            },
        ))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.shared.check_failure()?;
        let entries = self.shared.entries()?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Str(_)) => Err(wrong_type(key)),
            Some(Value::List(list)) => Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
        }
    }

    async fn push_trim(&self, key: &str, value: String, max_len: Option<usize>) -> Result<u64> {
        self.shared.check_failure()?;
        let mut entries = self.shared.entries()?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                list.push_front(value);
                let len = list.len() as u64;
                if let Some(max_len) = max_len {
                    list.truncate(max_len);
                }
                Ok(len)
            }
            Value::Str(_) => Err(wrong_type(key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.shared.check_failure()?;
        Ok(self.shared.entries()?.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.shared.check_failure()?;
        let mut entries = self.shared.entries()?;
        Ok(apply_op(&mut entries, &KvOp::Delete(key.to_string())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.shared.check_failure()?;
        let mut entries = self.shared.entries()?;
        Ok(apply_op(
            &mut entries,
            &KvOp::Expire {
                key: key.to_string(),
                ttl,
            },
        ))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.shared.check_failure()?;
        let entries = self.shared.entries()?;
        // Like MGET, non-string keys read as nil
        Ok(keys
            .iter()
            .map(|key| match entries.get(key).map(|e| &e.value) {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            })
            .collect())
    }

    async fn transaction(&self, ops: &[KvOp]) -> Result<Vec<bool>> {
        self.shared.check_failure()?;
        let mut entries = self.shared.entries()?;
        Ok(ops.iter().map(|op| apply_op(&mut entries, op)).collect())
    }

    async fn ping(&self) -> Result<()> {
        self.shared.check_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 0, 2), Some((0, 2)));
        assert_eq!(resolve_range(5, 1, 100), Some((1, 4)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 6, 9), None);
        assert_eq!(resolve_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let connector = MemoryConnector::new();
        let conn = connector.connect().await.unwrap();
        conn.set("short", "1".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        conn.set("long", "2".into(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(conn.get("short").await.unwrap(), None);
        assert_eq!(conn.get("long").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_push_trim_keeps_newest() {
        let conn = MemoryConnector::new().connect().await.unwrap();
        for i in 0..4 {
            conn.push_trim("l", i.to_string(), Some(2)).await.unwrap();
        }
        assert_eq!(conn.lrange("l", 0, -1).await.unwrap(), vec!["3", "2"]);
    }

    #[tokio::test]
    async fn test_wrong_type_is_permanent() {
        let conn = MemoryConnector::new().connect().await.unwrap();
        conn.set("s", "x".into(), None).await.unwrap();
        let err = conn.lrange("s", 0, -1).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let connector = MemoryConnector::new();
        let conn = connector.connect().await.unwrap();
        connector.fail_next(1);
        assert!(conn.ping().await.unwrap_err().is_retryable());
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_transaction_reports_per_op() {
        let connector = MemoryConnector::new();
        let conn = connector.connect().await.unwrap();
        conn.set("a", "1".into(), None).await.unwrap();

        let flags = conn
            .transaction(&[
                KvOp::Expire {
                    key: "a".into(),
                    ttl: Duration::from_secs(60),
                },
                KvOp::Delete("missing".into()),
                KvOp::Set {
                    key: "b".into(),
                    value: "2".into(),
                    ttl: None,
                },
            ])
            .await
            .unwrap();

        assert_eq!(flags, vec![true, false, true]);
        assert!(connector.ttl("a").is_some());
        assert_eq!(connector.key_count(), 2);
    }
}
