use std::collections::HashSet;
use std::sync::Mutex;

use super::urls::{self, ScopeFilter};
use crate::error::{CrawlError, Result};
use crate::kv::{incr_total, keys, SharedKv};
use crate::models::{now_secs, page_id_for, FrontierEntry, JobOptions, PageRecord, PageStatus};

/// Why a URL did not enter the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Invalid,
    OutOfScope,
    TooDeep,
    AlreadySeen,
    CapacityReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Skipped(SkipReason),
}

/// Shared work queue with at-most-once enqueue semantics per job.
///
/// The authoritative visited set lives in the KV store; the in-process set
/// only short-circuits repeats within one worker invocation. A URL is "new"
/// only when every permutation of it was newly added to the shared set.
pub struct Frontier {
    kv: SharedKv,
    job_id: String,
    options: JobOptions,
    scope: ScopeFilter,
    local_seen: Mutex<HashSet<String>>,
}

impl Frontier {
    pub fn new(kv: SharedKv, job_id: &str, options: JobOptions, scope: ScopeFilter) -> Self {
        Frontier {
            kv,
            job_id: job_id.to_string(),
            options,
            scope,
            local_seen: Mutex::new(HashSet::new()),
        }
    }

    /// Try to admit one URL at the given depth. Counters move exactly once
    /// per call: `filtered` for validity/scope rejects, `skipped` for
    /// dup/depth/capacity rejects, `discovered`+`queued` on success.
    pub async fn try_enqueue(
        &self,
        raw_url: &str,
        depth: u32,
        parent_url: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        let canonical = match urls::normalize(raw_url, None) {
            Ok(url) => url,
            Err(CrawlError::InvalidUrl(_)) => {
                return self.filtered(SkipReason::Invalid).await;
            }
            Err(e) => return Err(e),
        };

        if !urls::is_documentation_url(&canonical) {
            return self.filtered(SkipReason::Invalid).await;
        }
        if !self.scope.accepts(&canonical) {
            return self.filtered(SkipReason::OutOfScope).await;
        }
        if depth > self.options.max_depth {
            return self.skipped(SkipReason::TooDeep).await;
        }

        let canonical_str = canonical.to_string();
        if self
            .local_seen
            .lock()
            .expect("frontier seen lock")
            .contains(&canonical_str)
        {
            return self.skipped(SkipReason::AlreadySeen).await;
        }

        let perms = urls::permutations(&canonical);
        let added = self
            .kv
            .set_add(&keys::visited(&self.job_id), &perms)
            .await?;
        self.local_seen
            .lock()
            .expect("frontier seen lock")
            .insert(canonical_str.clone());
        if added < perms.len() as u64 {
            return self.skipped(SkipReason::AlreadySeen).await;
        }

        // Capacity gate: claim a discovered slot, give it back on overflow.
        let discovered = incr_total(self.kv.as_ref(), &self.job_id, "discovered").await?;
        if discovered > self.options.max_pages as i64 {
            self.kv
                .counter_incr(&keys::job_total(&self.job_id, "discovered"), -1)
                .await?;
            return self.skipped(SkipReason::CapacityReached).await;
        }

        let record = PageRecord {
            page_id: page_id_for(&canonical_str),
            job_id: self.job_id.clone(),
            url: canonical_str.clone(),
            status: PageStatus::Pending,
            http_status: None,
            title: None,
            quality_score: None,
            word_count: None,
            content: None,
            discovered_at: now_secs(),
            crawled_at: None,
            attempts: 0,
            error_message: None,
            depth,
            parent_url: parent_url.map(str::to_string),
        };
        let record_json = serde_json::to_string(&record)
            .map_err(|e| CrawlError::Fatal(format!("page record encode: {e}")))?;
        self.kv
            .hash_set(
                &keys::pages(&self.job_id),
                &[(record.page_id.as_str(), record_json)],
            )
            .await?;

        let entry = FrontierEntry {
            url: canonical_str,
            depth,
            parent_url: parent_url.map(str::to_string),
        };
        let entry_json = serde_json::to_string(&entry)
            .map_err(|e| CrawlError::Fatal(format!("frontier entry encode: {e}")))?;
        self.kv
            .list_push(&keys::frontier(&self.job_id), &entry_json)
            .await?;
        incr_total(self.kv.as_ref(), &self.job_id, "queued").await?;

        Ok(EnqueueOutcome::Enqueued)
    }

    /// Pop one entry; each entry is delivered to exactly one caller.
    pub async fn dequeue(&self) -> Result<Option<FrontierEntry>> {
        let Some(raw) = self.kv.list_pop(&keys::frontier(&self.job_id)).await? else {
            return Ok(None);
        };
        let entry = serde_json::from_str(&raw)
            .map_err(|e| CrawlError::Fatal(format!("frontier entry decode: {e}")))?;
        Ok(Some(entry))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.kv.list_len(&keys::frontier(&self.job_id)).await? == 0)
    }

    async fn filtered(&self, reason: SkipReason) -> Result<EnqueueOutcome> {
        incr_total(self.kv.as_ref(), &self.job_id, "filtered").await?;
        Ok(EnqueueOutcome::Skipped(reason))
    }

    async fn skipped(&self, reason: SkipReason) -> Result<EnqueueOutcome> {
        incr_total(self.kv.as_ref(), &self.job_id, "skipped").await?;
        Ok(EnqueueOutcome::Skipped(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{read_totals, KvStore, MemoryKv};
    use std::sync::Arc;
    use url::Url;

    fn frontier_with(options: JobOptions) -> Frontier {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let seed = Url::parse("https://x.test/").unwrap();
        let scope = ScopeFilter::new(&seed, &options).unwrap();
        Frontier::new(kv, "job1", options, scope)
    }

    fn frontier() -> Frontier {
        frontier_with(JobOptions::default())
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue_fifo() {
        let f = frontier();
        assert_eq!(
            f.try_enqueue("https://x.test/a", 0, None).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            f.try_enqueue("https://x.test/b", 1, Some("https://x.test/a"))
                .await
                .unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert!(!f.is_empty().await.unwrap());

        let first = f.dequeue().await.unwrap().unwrap();
        assert_eq!(first.url, "https://x.test/a");
        assert_eq!(first.depth, 0);
        let second = f.dequeue().await.unwrap().unwrap();
        assert_eq!(second.url, "https://x.test/b");
        assert_eq!(second.parent_url.as_deref(), Some("https://x.test/a"));
        assert!(f.dequeue().await.unwrap().is_none());
        assert!(f.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_permutations_dedup() {
        let f = frontier();
        assert_eq!(
            f.try_enqueue("https://x.test/p", 0, None).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        // Protocol, www and trailing-slash variants are all the same page
        for variant in [
            "http://x.test/p",
            "https://x.test/p/",
            "https://www.x.test/p",
            "http://www.x.test/p/",
        ] {
            assert_eq!(
                f.try_enqueue(variant, 1, None).await.unwrap(),
                EnqueueOutcome::Skipped(SkipReason::AlreadySeen),
                "{variant} should dedup"
            );
        }

        let totals = read_totals(f.kv.as_ref(), "job1").await.unwrap();
        assert_eq!(totals.discovered, 1);
        assert_eq!(totals.queued, 1);
        assert_eq!(totals.skipped, 4);
    }

    #[tokio::test]
    async fn test_depth_and_validity_and_scope() {
        let f = frontier();
        assert_eq!(
            f.try_enqueue("https://x.test/deep", 3, None).await.unwrap(),
            EnqueueOutcome::Skipped(SkipReason::TooDeep)
        );
        assert_eq!(
            f.try_enqueue("https://x.test/logo.png", 0, None)
                .await
                .unwrap(),
            EnqueueOutcome::Skipped(SkipReason::Invalid)
        );
        assert_eq!(
            f.try_enqueue("https://elsewhere.test/docs", 0, None)
                .await
                .unwrap(),
            EnqueueOutcome::Skipped(SkipReason::OutOfScope)
        );
        assert_eq!(
            f.try_enqueue("::::", 0, None).await.unwrap(),
            EnqueueOutcome::Skipped(SkipReason::Invalid)
        );

        let totals = read_totals(f.kv.as_ref(), "job1").await.unwrap();
        assert_eq!(totals.filtered, 3);
        assert_eq!(totals.skipped, 1);
        assert_eq!(totals.discovered, 0);
    }

    #[tokio::test]
    async fn test_capacity_reached() {
        let f = frontier_with(JobOptions {
            max_pages: 1,
            ..Default::default()
        });
        assert_eq!(
            f.try_enqueue("https://x.test/", 0, None).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            f.try_enqueue("https://x.test/next", 1, None).await.unwrap(),
            EnqueueOutcome::Skipped(SkipReason::CapacityReached)
        );

        let totals = read_totals(f.kv.as_ref(), "job1").await.unwrap();
        assert_eq!(totals.discovered, 1);
        assert_eq!(totals.queued, 1);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_single_entry() {
        let f = Arc::new(frontier());
        let mut handles = Vec::new();
        for i in 0..12 {
            let f = f.clone();
            // Alternate permutation spellings of the same page
            let raw = if i % 2 == 0 {
                "https://x.test/race"
            } else {
                "http://www.x.test/race/"
            };
            handles.push(tokio::spawn(async move {
                f.try_enqueue(raw, 0, None).await.unwrap()
            }));
        }

        let mut enqueued = 0;
        for h in handles {
            if h.await.unwrap() == EnqueueOutcome::Enqueued {
                enqueued += 1;
            }
        }
        assert_eq!(enqueued, 1);

        let mut popped = 0;
        while f.dequeue().await.unwrap().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 1);
    }

    #[tokio::test]
    async fn test_pending_record_created_on_enqueue() {
        let f = frontier();
        f.try_enqueue("https://x.test/page", 0, None).await.unwrap();
        let pages = f.kv.hash_get_all(&keys::pages("job1")).await.unwrap();
        assert_eq!(pages.len(), 1);
        let record: PageRecord =
            serde_json::from_str(pages.values().next().unwrap()).unwrap();
        assert_eq!(record.url, "https://x.test/page");
        assert_eq!(record.status, PageStatus::Pending);
        assert_eq!(record.attempts, 0);
    }
}
