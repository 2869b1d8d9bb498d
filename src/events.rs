use serde_json::Value;
use std::time::Duration;

use crate::error::Result;
use crate::kv::{keys, SharedKv};
use crate::models::{now_millis, Event, EventType};

const COMPLETING_LOCK_TTL: Duration = Duration::from_secs(10);

/// Append-only per-job event log over the KV event primitives. Ids are
/// strictly increasing from 1 and the sequence ends with exactly one
/// terminal event, enforced through the `completing:{id}` single-writer lock.
#[derive(Clone)]
pub struct EventLog {
    kv: SharedKv,
    ttl: Duration,
}

impl EventLog {
    pub fn new(kv: SharedKv, ttl: Duration) -> Self {
        EventLog { kv, ttl }
    }

    /// Append one event; returns its id.
    pub async fn append(
        &self,
        job_id: &str,
        event_type: EventType,
        payload: Value,
    ) -> Result<u64> {
        let key = keys::events(job_id);
        let envelope = serde_json::json!({
            "type": event_type.as_str(),
            "payload": payload,
            "timestamp": now_millis(),
        });
        let id = self.kv.event_append(&key, &envelope.to_string()).await?;
        if id == 1 {
            self.kv.expire(&key, self.ttl).await?;
        }
        tracing::debug!(job_id = %job_id, event_id = id, event = event_type.as_str(), "Event appended");
        Ok(id)
    }

    /// Events with id > `after_id`, in id order.
    pub async fn read_after(&self, job_id: &str, after_id: u64, max: usize) -> Result<Vec<Event>> {
        let raw = self
            .kv
            .event_range(&keys::events(job_id), after_id, max)
            .await?;
        Ok(decode(job_id, raw))
    }

    /// Blocking-tail read; returns as soon as events past `after_id` exist,
    /// or empty after `timeout`.
    pub async fn tail(
        &self,
        job_id: &str,
        after_id: u64,
        timeout: Duration,
    ) -> Result<Vec<Event>> {
        let raw = self
            .kv
            .event_tail(&keys::events(job_id), after_id, timeout)
            .await?;
        Ok(decode(job_id, raw))
    }

    /// Highest assigned event id (0 when the log is empty).
    pub async fn last_event_id(&self, job_id: &str) -> Result<u64> {
        self.kv.list_len(&keys::events(job_id)).await
    }

    /// Acquire the single-writer terminal lock. At most one caller per job
    /// holds it at a time; the TTL guards against a crashed holder.
    pub async fn try_acquire_terminal_lock(&self, job_id: &str) -> Result<bool> {
        let key = keys::completing(job_id);
        let acquired = self.kv.set_add(&key, &["1".to_string()]).await? == 1;
        if acquired {
            self.kv.expire(&key, COMPLETING_LOCK_TTL).await?;
        }
        Ok(acquired)
    }

    pub async fn release_terminal_lock(&self, job_id: &str) -> Result<()> {
        self.kv.delete(&keys::completing(job_id)).await
    }
}

fn decode(job_id: &str, raw: Vec<(u64, String)>) -> Vec<Event> {
    raw.into_iter()
        .filter_map(|(id, payload)| {
            let value: Value = serde_json::from_str(&payload).ok()?;
            let event_type: EventType =
                serde_json::from_value(value.get("type")?.clone()).ok()?;
            Some(Event {
                event_id: id,
                job_id: job_id.to_string(),
                event_type,
                payload: value.get("payload").cloned().unwrap_or(Value::Null),
                timestamp: value.get("timestamp").and_then(Value::as_u64).unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;
    use std::sync::Arc;

    fn log() -> EventLog {
        EventLog::new(Arc::new(MemoryKv::new()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let log = log();
        let a = log
            .append("j", EventType::StreamConnected, json!({}))
            .await
            .unwrap();
        let b = log
            .append("j", EventType::UrlStarted, json!({"url": "https://x.test"}))
            .await
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(log.last_event_id("j").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_after_skips_delivered() {
        let log = log();
        for i in 0..5 {
            log.append("j", EventType::Progress, json!({"processed": i}))
                .await
                .unwrap();
        }
        let events = log.read_after("j", 2, 100).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_id, 3);
        assert_eq!(events[2].event_id, 5);
        assert_eq!(events[0].event_type, EventType::Progress);
    }

    #[tokio::test]
    async fn test_events_are_isolated_per_job() {
        let log = log();
        log.append("a", EventType::StreamConnected, json!({}))
            .await
            .unwrap();
        log.append("b", EventType::StreamConnected, json!({}))
            .await
            .unwrap();
        assert_eq!(log.last_event_id("a").await.unwrap(), 1);
        assert_eq!(log.read_after("b", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_lock_single_holder() {
        let log = log();
        assert!(log.try_acquire_terminal_lock("j").await.unwrap());
        assert!(!log.try_acquire_terminal_lock("j").await.unwrap());
        log.release_terminal_lock("j").await.unwrap();
        assert!(log.try_acquire_terminal_lock("j").await.unwrap());
    }

    #[tokio::test]
    async fn test_tail_returns_new_events() {
        let log = log();
        log.append("j", EventType::Progress, json!({})).await.unwrap();

        let tail_log = log.clone();
        let handle = tokio::spawn(async move {
            tail_log
                .tail("j", 1, Duration::from_secs(5))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("j", EventType::JobCompleted, json!({"totalProcessed": 1}))
            .await
            .unwrap();

        let events = handle.await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 2);
        assert!(events[0].event_type.is_terminal());
    }
}
