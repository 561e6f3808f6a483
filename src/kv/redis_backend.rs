//! Redis backend built on `ConnectionManager`
//!
//! Every command is bounded by the configured socket timeout. List pushes
//! and multi-key transactions go out as `MULTI`/`EXEC` pipelines.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{KvConnection, KvConnector, KvOp};
use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// Opens managed Redis connections
pub struct RedisConnector {
    config: RedisConfig,
}

impl RedisConnector {
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl KvConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn KvConnection>> {
        let client = redis::Client::open(self.config.url())
            .map_err(|e| Error::Config(format!("Invalid Redis URL: {}", e)))?;

        let manager = bounded(
            self.config.connect_timeout(),
            ConnectionManager::new(client),
        )
        .await?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            db = self.config.db,
            "Connected to Redis"
        );

        Ok(Arc::new(RedisConnection {
            manager,
            timeout: self.config.socket_timeout(),
        }))
    }

    fn describe(&self) -> String {
        format!("redis://{}:{}/{}", self.config.host, self.config.port, self.config.db)
    }
}

/// Await a redis future, mapping elapsed deadlines to a transient timeout
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::StorageTimeout(limit.as_millis() as u64)),
    }
}

struct RedisConnection {
    manager: ConnectionManager,
    timeout: Duration,
}

impl RedisConnection {
    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn reply_flag(value: &redis::Value) -> bool {
    match value {
        redis::Value::Int(n) => *n > 0,
        redis::Value::Okay => true,
        _ => false,
    }
}

#[async_trait]
impl KvConnection for RedisConnection {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        bounded(self.timeout, conn.get(key)).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                bounded::<(), _>(self.timeout, conn.set_ex(key, value, ttl.as_secs().max(1)))
                    .await?
            }
            None => bounded::<(), _>(self.timeout, conn.set(key, value)).await?,
        }
        Ok(true)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        bounded(self.timeout, conn.lrange(key, start, stop)).await
    }

    async fn push_trim(&self, key: &str, value: String, max_len: Option<usize>) -> Result<u64> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic().lpush(key, value);
        if let Some(max_len) = max_len {
            let stop = max_len.saturating_sub(1) as isize;
            pipe.ltrim(key, 0, stop).ignore();
        }
        let (len,): (u64,) = bounded(self.timeout, pipe.query_async(&mut conn)).await?;
        Ok(len)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        bounded(self.timeout, conn.exists(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: u64 = bounded(self.timeout, conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        bounded(self.timeout, conn.expire(key, secs)).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        bounded(self.timeout, cmd.query_async(&mut conn)).await
    }

    async fn transaction(&self, ops: &[KvOp]) -> Result<Vec<bool>> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                KvOp::Delete(key) => {
                    pipe.del(key);
                }
                KvOp::Set {
                    key,
                    value,
                    ttl: Some(ttl),
                } => {
                    pipe.set_ex(key, value, ttl.as_secs().max(1));
                }
                KvOp::Set {
                    key,
                    value,
                    ttl: None,
                } => {
                    pipe.set(key, value);
                }
                KvOp::Expire { key, ttl } => {
                    let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
                    pipe.expire(key, secs);
                }
            }
        }

        let replies: Vec<redis::Value> = bounded(self.timeout, pipe.query_async(&mut conn)).await?;
        Ok(replies.iter().map(reply_flag).collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = bounded(self.timeout, redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}
