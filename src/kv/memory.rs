use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::KvStore;
use crate::error::{CrawlError, Result};

/// In-process `KvStore` used by tests and single-node dev runs. Supports the
/// full contract including TTLs and the blocking event tail, so the rest of
/// the engine cannot tell it apart from Redis.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, Entry>>,
    appended: Notify,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
enum Value {
    Set(HashSet<String>),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Counter(i64),
    Str(String),
    /// Event payloads; id == index + 1.
    Events(Vec<String>),
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        key: &str,
        make: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> Result<T>,
    ) -> Result<T> {
        let mut map = self.inner.lock().expect("kv lock");
        Self::purge_expired(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: make(),
            expires_at: None,
        });
        f(&mut entry.value)
    }

    fn read_entry<T>(&self, key: &str, f: impl FnOnce(Option<&Value>) -> Result<T>) -> Result<T> {
        let mut map = self.inner.lock().expect("kv lock");
        Self::purge_expired(&mut map, key);
        f(map.get(key).map(|e| &e.value))
    }

    fn purge_expired(map: &mut HashMap<String, Entry>, key: &str) {
        let expired = map
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            map.remove(key);
        }
    }

    fn wrong_kind(key: &str) -> CrawlError {
        CrawlError::Fatal(format!("kv key {key} holds a different kind"))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64> {
        self.with_entry(
            key,
            || Value::Set(HashSet::new()),
            |v| match v {
                Value::Set(set) => {
                    let mut added = 0u64;
                    for m in members {
                        if set.insert(m.clone()) {
                            added += 1;
                        }
                    }
                    Ok(added)
                }
                _ => Err(Self::wrong_kind(key)),
            },
        )
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.read_entry(key, |v| match v {
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(false),
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.read_entry(key, |v| match v {
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        self.with_entry(
            key,
            || Value::List(VecDeque::new()),
            |v| match v {
                Value::List(list) => {
                    list.push_back(value.to_string());
                    Ok(())
                }
                _ => Err(Self::wrong_kind(key)),
            },
        )
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        self.with_entry(
            key,
            || Value::List(VecDeque::new()),
            |v| match v {
                Value::List(list) => Ok(list.pop_front()),
                _ => Err(Self::wrong_kind(key)),
            },
        )
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        self.read_entry(key, |v| match v {
            Some(Value::List(list)) => Ok(list.len() as u64),
            // Event logs answer length queries too (their id == length)
            Some(Value::Events(log)) => Ok(log.len() as u64),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(0),
        })
    }

    async fn counter_incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_entry(
            key,
            || Value::Counter(0),
            |v| match v {
                Value::Counter(n) => {
                    *n += delta;
                    Ok(*n)
                }
                _ => Err(Self::wrong_kind(key)),
            },
        )
    }

    async fn counter_get(&self, key: &str) -> Result<i64> {
        self.read_entry(key, |v| match v {
            Some(Value::Counter(n)) => Ok(*n),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(0),
        })
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.with_entry(
            key,
            || Value::Hash(HashMap::new()),
            |v| match v {
                Value::Hash(hash) => {
                    for (f, val) in fields {
                        hash.insert(f.to_string(), val.clone());
                    }
                    Ok(())
                }
                _ => Err(Self::wrong_kind(key)),
            },
        )
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.read_entry(key, |v| match v {
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(None),
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.read_entry(key, |v| match v {
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(HashMap::new()),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_entry(key, |v| match v {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.inner.lock().expect("kv lock");
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut map = self.inner.lock().expect("kv lock");
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().expect("kv lock").remove(key);
        Ok(())
    }

    async fn event_append(&self, key: &str, payload: &str) -> Result<u64> {
        let id = self.with_entry(
            key,
            || Value::Events(Vec::new()),
            |v| match v {
                Value::Events(log) => {
                    log.push(payload.to_string());
                    Ok(log.len() as u64)
                }
                _ => Err(Self::wrong_kind(key)),
            },
        )?;
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn event_range(
        &self,
        key: &str,
        after_id: u64,
        max: usize,
    ) -> Result<Vec<(u64, String)>> {
        self.read_entry(key, |v| match v {
            Some(Value::Events(log)) => Ok(log
                .iter()
                .enumerate()
                .skip(after_id as usize)
                .take(max)
                .map(|(i, p)| (i as u64 + 1, p.clone()))
                .collect()),
            Some(_) => Err(Self::wrong_kind(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn event_tail(
        &self,
        key: &str,
        after_id: u64,
        timeout: Duration,
    ) -> Result<Vec<(u64, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the waiter before reading so an append between the read and
            // the wait cannot be missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events = self.event_range(key, after_id, 256).await?;
            if !events.is_empty() {
                return Ok(events);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(deadline - now) => return Ok(Vec::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_add_counts_new_members_only() {
        let kv = MemoryKv::new();
        let added = kv
            .set_add("s", &["a".into(), "b".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(added, 2);
        let added = kv.set_add("s", &["b".into(), "c".into()]).await.unwrap();
        assert_eq!(added, 1);
        assert!(kv.set_contains("s", "c").await.unwrap());
        assert!(!kv.set_contains("s", "z").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_fifo() {
        let kv = MemoryKv::new();
        kv.list_push("q", "1").await.unwrap();
        kv.list_push("q", "2").await.unwrap();
        assert_eq!(kv.list_len("q").await.unwrap(), 2);
        assert_eq!(kv.list_pop("q").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.list_pop("q").await.unwrap().as_deref(), Some("2"));
        assert_eq!(kv.list_pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter() {
        let kv = MemoryKv::new();
        assert_eq!(kv.counter_incr("c", 1).await.unwrap(), 1);
        assert_eq!(kv.counter_incr("c", 2).await.unwrap(), 3);
        assert_eq!(kv.counter_incr("c", -1).await.unwrap(), 2);
        assert_eq!(kv.counter_get("c").await.unwrap(), 2);
        assert_eq!(kv.counter_get("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let kv = MemoryKv::new();
        kv.hash_set("h", &[("a", "1".into()), ("b", "2".into())])
            .await
            .unwrap();
        assert_eq!(kv.hash_get("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.hash_get("h", "z").await.unwrap(), None);
        let all = kv.hash_get_all("h").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_ttl_expires() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_event_ids_are_monotonic() {
        let kv = MemoryKv::new();
        assert_eq!(kv.event_append("e", "one").await.unwrap(), 1);
        assert_eq!(kv.event_append("e", "two").await.unwrap(), 2);
        assert_eq!(kv.event_append("e", "three").await.unwrap(), 3);

        let all = kv.event_range("e", 0, 100).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], (1, "one".to_string()));

        let after = kv.event_range("e", 1, 100).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].0, 2);
    }

    #[tokio::test]
    async fn test_event_tail_wakes_on_append() {
        let kv = Arc::new(MemoryKv::new());
        let writer = kv.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.event_append("e", "late").await.unwrap();
        });

        let got = kv.event_tail("e", 0, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, "late");
    }

    #[tokio::test]
    async fn test_event_tail_times_out_empty() {
        let kv = MemoryKv::new();
        let got = kv
            .event_tail("e", 0, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_set_add_single_winner() {
        let kv = Arc::new(MemoryKv::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.set_add("lock", &["owner".into()]).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() == 1 {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
