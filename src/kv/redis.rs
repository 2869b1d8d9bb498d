use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use super::KvStore;
use crate::error::{CrawlError, Result};

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Redis-backed `KvStore`. One multiplexed connection manager shared across
/// the process; every operation runs under the configured deadline.
///
/// The event log leans on RPUSH being atomic and the log being append-only:
/// the length RPUSH returns is the event id, and the id of the entry at list
/// index `i` is `i + 1`, so ranged reads are a single LRANGE.
#[derive(Clone)]
pub struct RedisKv {
    conn: MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisKv {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CrawlError::Fatal(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CrawlError::Transient(format!("redis connect: {e}")))?;
        Ok(RedisKv { conn, op_timeout })
    }

    async fn op<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) if e.is_timeout() => Err(CrawlError::Timeout(format!("redis {what}: {e}"))),
            Ok(Err(e)) => Err(CrawlError::Transient(format!("redis {what}: {e}"))),
            Err(_) => Err(CrawlError::Timeout(format!("redis {what}: deadline"))),
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.op("sadd", conn.sadd::<_, _, u64>(key, members)).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.op("sismember", conn.sismember::<_, _, bool>(key, member))
            .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.op("smembers", conn.smembers::<_, Vec<String>>(key))
            .await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.op("rpush", conn.rpush::<_, _, ()>(key, value)).await
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.op("lpop", conn.lpop::<_, Option<String>>(key, None))
            .await
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        self.op("llen", conn.llen::<_, u64>(key)).await
    }

    async fn counter_incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.op("incrby", conn.incr::<_, _, i64>(key, delta)).await
    }

    async fn counter_get(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self.op("get", conn.get(key)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        self.op("hset", conn.hset_multiple::<_, _, _, ()>(key, fields))
            .await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.op("hget", conn.hget::<_, _, Option<String>>(key, field))
            .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.op("hgetall", conn.hgetall::<_, HashMap<String, String>>(key))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.op("get", conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                self.op(
                    "setex",
                    conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)),
                )
                .await
            }
            None => self.op("set", conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        self.op(
            "expire",
            conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.op("del", conn.del::<_, ()>(key)).await
    }

    async fn event_append(&self, key: &str, payload: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        self.op("rpush", conn.rpush::<_, _, u64>(key, payload))
            .await
    }

    async fn event_range(
        &self,
        key: &str,
        after_id: u64,
        max: usize,
    ) -> Result<Vec<(u64, String)>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let start = after_id as isize;
        let stop = start + max as isize - 1;
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = self.op("lrange", conn.lrange(key, start, stop)).await?;
        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| (after_id + i as u64 + 1, p))
            .collect())
    }

    async fn event_tail(
        &self,
        key: &str,
        after_id: u64,
        timeout: Duration,
    ) -> Result<Vec<(u64, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.event_range(key, after_id, 256).await?;
            if !events.is_empty() {
                return Ok(events);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(TAIL_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
