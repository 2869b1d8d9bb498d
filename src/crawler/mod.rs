pub mod extract;
pub mod fetcher;
pub mod frontier;
pub mod quality;
pub mod robots;
pub mod sitemap;
pub mod urls;

pub use fetcher::Fetcher;
pub use frontier::{EnqueueOutcome, Frontier, SkipReason};
pub use robots::RobotsGate;
pub use sitemap::SitemapDiscovery;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{backoff_delay, CrawlError, Result};
use crate::events::EventLog;
use crate::kv::{incr_total, keys, SharedKv};
use crate::models::{now_secs, page_id_for, FrontierEntry, JobOptions, PageRecord, PageStatus};

/// How one frontier entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Page persisted as crawled; carries the number of newly enqueued URLs.
    Crawled { new_urls: u64 },
    /// Page persisted as error; the job continues.
    Failed,
    /// Robots gate refused the fetch; page persisted as skipped.
    Skipped,
    /// Another worker holds the transition lock; nothing was done.
    NotOwned,
}

/// Per-URL pipeline: claim, fetch, extract, score, persist, harvest, emit.
///
/// One instance per worker invocation; all durable state goes through the
/// KV store so any worker can pick up any entry.
pub struct Pipeline {
    kv: SharedKv,
    fetcher: Fetcher,
    events: EventLog,
    robots: Arc<RobotsGate>,
    job_id: String,
    options: JobOptions,
    /// Job creation time; fetches never outlive createdAt + jobTimeout.
    created_at: u64,
    job_ttl: Duration,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: SharedKv,
        fetcher: Fetcher,
        events: EventLog,
        robots: Arc<RobotsGate>,
        job_id: &str,
        options: JobOptions,
        created_at: u64,
        job_ttl: Duration,
    ) -> Self {
        Pipeline {
            kv,
            fetcher,
            events,
            robots,
            job_id: job_id.to_string(),
            options,
            created_at,
            job_ttl,
        }
    }

    /// Process one popped frontier entry end to end. Page-scoped failures
    /// are absorbed into the page record and the event log; an `Err` from
    /// here means the KV store itself misbehaved.
    pub async fn process(&self, frontier: &Frontier, entry: &FrontierEntry) -> Result<PageOutcome> {
        let claimed_key = keys::claimed(&self.job_id);
        let claimed = self
            .kv
            .set_add(&claimed_key, &[entry.url.clone()])
            .await?;
        if claimed != 1 {
            return Ok(PageOutcome::NotOwned);
        }
        self.kv.expire(&claimed_key, self.job_ttl).await?;

        let mut record = self.load_record(&entry.url).await?.unwrap_or_else(|| {
            // Enqueue always writes a pending record first; tolerate a lost
            // one rather than dropping the entry.
            pending_record(&self.job_id, entry)
        });
        record.status = PageStatus::Fetching;
        self.save_record(&record).await?;

        self.events
            .append(
                &self.job_id,
                crate::models::EventType::UrlStarted,
                json!({ "url": entry.url }),
            )
            .await?;

        let url = match Url::parse(&entry.url) {
            Ok(u) => u,
            Err(e) => {
                return self
                    .finish_failed(record, &CrawlError::InvalidUrl(e.to_string()))
                    .await
            }
        };

        // Robots gate, consulted per URL about to be fetched
        let crawl_delay = if self.options.respect_robots {
            let rules = self.robots.rules_for(&url).await;
            if !rules.is_allowed(url.as_str(), fetcher::USER_AGENT) {
                record.status = PageStatus::Skipped;
                record.error_message = Some("blocked by robots.txt".to_string());
                self.save_record(&record).await?;
                incr_total(self.kv.as_ref(), &self.job_id, "skipped").await?;
                self.events
                    .append(
                        &self.job_id,
                        crate::models::EventType::UrlFailed,
                        json!({ "url": entry.url, "error": "blocked by robots.txt" }),
                    )
                    .await?;
                return Ok(PageOutcome::Skipped);
            }
            rules.crawl_delay(fetcher::USER_AGENT)
        } else {
            None
        };

        let fetched = match self.fetch_with_retries(&url, crawl_delay, &mut record).await {
            Ok(f) => f,
            Err(e) => return self.finish_failed(record, &e).await,
        };
        record.http_status = Some(fetched.status_code);

        let max_links = if entry.depth >= self.options.max_depth {
            // Leaf depth: links would be rejected anyway, skip the harvest
            0
        } else {
            self.options.max_links_per_page as usize
        };

        let extracted = match extract::extract(&fetched.body, &url, max_links) {
            Ok(e) => e,
            Err(e) => return self.finish_failed(record, &e).await,
        };

        let score = quality::score(&extracted.markdown, url.path());

        record.status = PageStatus::Crawled;
        record.title = extracted.title.clone();
        record.quality_score = Some(score);
        record.word_count = Some(extracted.word_count);
        record.content = Some(extracted.markdown.clone());
        record.crawled_at = Some(now_secs());
        record.error_message = None;
        self.save_record(&record).await?;
        incr_total(self.kv.as_ref(), &self.job_id, "processed").await?;

        // Harvest: each link goes through the frontier at depth + 1; the
        // first capacity refusal closes the gate for the rest of this page.
        let mut new_urls = 0u64;
        for link in &extracted.links {
            match frontier
                .try_enqueue(link, entry.depth + 1, Some(&entry.url))
                .await?
            {
                EnqueueOutcome::Enqueued => new_urls += 1,
                EnqueueOutcome::Skipped(SkipReason::CapacityReached) => break,
                EnqueueOutcome::Skipped(_) => {}
            }
        }

        self.events
            .append(
                &self.job_id,
                crate::models::EventType::UrlCrawled,
                json!({
                    "url": entry.url,
                    "success": true,
                    "content_length": extracted.markdown.len(),
                    "quality_score": score,
                }),
            )
            .await?;

        let total_discovered = self
            .kv
            .counter_get(&keys::job_total(&self.job_id, "discovered"))
            .await?;
        self.events
            .append(
                &self.job_id,
                crate::models::EventType::UrlsDiscovered,
                json!({
                    "source_url": entry.url,
                    "count": new_urls,
                    "total_discovered": total_discovered,
                }),
            )
            .await?;

        Ok(PageOutcome::Crawled { new_urls })
    }

    /// Fetch with retries: transient errors get three attempts with
    /// 2s/4s/8s backoff, a timeout gets one retry, HTTP errors none.
    /// The per-request timeout never extends past the job deadline.
    async fn fetch_with_retries(
        &self,
        url: &Url,
        crawl_delay: Option<Duration>,
        record: &mut PageRecord,
    ) -> Result<fetcher::FetchResult> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            record.attempts += 1;

            let remaining = self.job_time_remaining();
            if remaining.is_zero() {
                return Err(CrawlError::Timeout("job deadline reached".to_string()));
            }
            let timeout = Duration::from_secs(self.options.page_timeout).min(remaining);

            match self.fetcher.fetch(url, timeout, crawl_delay).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= e.max_attempts() || self.job_time_remaining().is_zero() {
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt).min(self.job_time_remaining());
                    tracing::debug!(
                        job_id = %self.job_id,
                        url = %url,
                        attempt,
                        error = %e,
                        "Fetch retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn job_time_remaining(&self) -> Duration {
        let deadline = self.created_at + self.options.job_timeout;
        Duration::from_secs(deadline.saturating_sub(now_secs()))
    }

    async fn finish_failed(
        &self,
        mut record: PageRecord,
        error: &CrawlError,
    ) -> Result<PageOutcome> {
        if let CrawlError::Http { status, .. } = error {
            record.http_status = Some(*status);
        }
        record.status = PageStatus::Error;
        record.error_message = Some(error.to_string());
        self.save_record(&record).await?;
        incr_total(self.kv.as_ref(), &self.job_id, "failed").await?;
        self.events
            .append(
                &self.job_id,
                crate::models::EventType::UrlFailed,
                json!({ "url": record.url, "error": error.to_string() }),
            )
            .await?;
        tracing::warn!(job_id = %self.job_id, url = %record.url, error = %error, "Page failed");
        Ok(PageOutcome::Failed)
    }

    async fn load_record(&self, url: &str) -> Result<Option<PageRecord>> {
        let raw = self
            .kv
            .hash_get(&keys::pages(&self.job_id), &page_id_for(url))
            .await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    async fn save_record(&self, record: &PageRecord) -> Result<()> {
        let encoded = serde_json::to_string(record)
            .map_err(|e| CrawlError::Fatal(format!("page record encode: {e}")))?;
        self.kv
            .hash_set(
                &keys::pages(&self.job_id),
                &[(record.page_id.as_str(), encoded)],
            )
            .await
    }
}

fn pending_record(job_id: &str, entry: &FrontierEntry) -> PageRecord {
    PageRecord {
        page_id: page_id_for(&entry.url),
        job_id: job_id.to_string(),
        url: entry.url.clone(),
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
        depth: entry.depth,
        parent_url: entry.parent_url.clone(),
    }
}
