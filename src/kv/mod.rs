pub mod memory;
pub mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Typed operations over the shared key-value store. All coordination between
/// workers goes through this seam; in-process state is only ever an
/// accelerator on top of it.
///
/// `set_add` is linearizable per key; the remaining operations are at least
/// sequentially consistent per key. Implementations apply their own op
/// deadline and surface failures as `Timeout` / `Transient`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Add members to a set; returns how many were not previously present.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// FIFO queue push/pop.
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;
    async fn list_pop(&self, key: &str) -> Result<Option<String>>;
    async fn list_len(&self, key: &str) -> Result<u64>;

    async fn counter_incr(&self, key: &str, delta: i64) -> Result<i64>;
    async fn counter_get(&self, key: &str) -> Result<i64>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append to an event log; ids are strictly increasing from 1 per key.
    async fn event_append(&self, key: &str, payload: &str) -> Result<u64>;
    /// Events with id > `after_id`, in id order, at most `max`.
    async fn event_range(&self, key: &str, after_id: u64, max: usize)
        -> Result<Vec<(u64, String)>>;
    /// Like `event_range`, but waits up to `timeout` for new events.
    /// May return empty on timeout.
    async fn event_tail(
        &self,
        key: &str,
        after_id: u64,
        timeout: Duration,
    ) -> Result<Vec<(u64, String)>>;
}

pub type SharedKv = Arc<dyn KvStore>;

/// TTL applied to per-job counters on first touch.
const TOTALS_TTL: Duration = Duration::from_secs(24 * 3600);

/// Bump one monotonic job total via the counter primitive (never
/// read-modify-write).
pub async fn incr_total(kv: &dyn KvStore, job_id: &str, field: &str) -> Result<i64> {
    let key = keys::job_total(job_id, field);
    let value = kv.counter_incr(&key, 1).await?;
    if value == 1 {
        kv.expire(&key, TOTALS_TTL).await?;
    }
    Ok(value)
}

/// Snapshot all job totals.
pub async fn read_totals(kv: &dyn KvStore, job_id: &str) -> Result<crate::models::Totals> {
    let mut values = HashMap::new();
    for field in crate::models::TOTAL_FIELDS {
        let value = kv.counter_get(&keys::job_total(job_id, field)).await?;
        values.insert(field.to_string(), value);
    }
    Ok(crate::models::Totals::from_counters(&values))
}

/// Per-job and per-host key layout.
pub mod keys {
    pub fn job_meta(job_id: &str) -> String {
        format!("job:{job_id}:meta")
    }
    pub fn job_total(job_id: &str, field: &str) -> String {
        format!("job:{job_id}:totals:{field}")
    }
    pub fn frontier(job_id: &str) -> String {
        format!("frontier:{job_id}")
    }
    pub fn visited(job_id: &str) -> String {
        format!("visited:{job_id}")
    }
    pub fn claimed(job_id: &str) -> String {
        format!("claimed:{job_id}")
    }
    pub fn workers(job_id: &str) -> String {
        format!("workers:{job_id}")
    }
    pub fn events(job_id: &str) -> String {
        format!("events:{job_id}")
    }
    pub fn completing(job_id: &str) -> String {
        format!("completing:{job_id}")
    }
    pub fn pages(job_id: &str) -> String {
        format!("pages:{job_id}")
    }
    pub fn result(job_id: &str) -> String {
        format!("result:{job_id}")
    }
    pub fn discovery(job_id: &str) -> String {
        format!("discovery:{job_id}")
    }
    pub fn jobs_index() -> String {
        "jobs:index".to_string()
    }
    pub fn sitemap_cache(host: &str) -> String {
        format!("sitemap:{host}:urls")
    }
    pub fn robots_cache(host: &str) -> String {
        format!("robots:{host}")
    }
}
