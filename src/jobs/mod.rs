pub mod worker;

pub use worker::{ChannelSpawner, HttpSpawner, WorkerSpawner};

use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{Config, WorkerDispatch};
use crate::crawler::{urls, Fetcher, Frontier, RobotsGate, SitemapDiscovery};
use crate::error::{CrawlError, Result};
use crate::events::EventLog;
use crate::kv::{incr_total, keys, read_totals, SharedKv};
use crate::models::{
    now_secs, CreateJobRequest, CreateJobResponse, EventType, Job, JobListEntry, JobOptions,
    JobSnapshot, JobStatusKind, PageRecord, PageStatus,
};

/// How many workers a fresh job starts with.
const INITIAL_WORKERS: u32 = 3;

/// Job lifecycle coordinator: creation, discovery, cancellation, completion
/// detection and final assembly. All durable state lives in the KV store;
/// this struct is freely shareable and holds no job state of its own.
pub struct CrawlService {
    pub(crate) kv: SharedKv,
    pub(crate) config: Arc<Config>,
    pub(crate) fetcher: Fetcher,
    pub(crate) robots: Arc<RobotsGate>,
    pub(crate) sitemaps: SitemapDiscovery,
    pub(crate) events: EventLog,
    pub(crate) spawner: Arc<dyn WorkerSpawner>,
}

impl CrawlService {
    /// Build the service and, in channel-dispatch mode, start the in-process
    /// worker dispatch loop.
    pub fn new(kv: SharedKv, config: Arc<Config>) -> Arc<Self> {
        let (spawner, dispatch_rx): (Arc<dyn WorkerSpawner>, Option<mpsc::Receiver<String>>) =
            match config.worker_dispatch {
                WorkerDispatch::Channel => {
                    let (tx, rx) = mpsc::channel(256);
                    (Arc::new(ChannelSpawner { tx }), Some(rx))
                }
                WorkerDispatch::Http => {
                    (Arc::new(HttpSpawner::new(&config.public_base_url)), None)
                }
            };

        let discovery_client = reqwest::Client::builder()
            .user_agent(crate::crawler::fetcher::USER_AGENT)
            .build()
            .expect("Failed to build discovery client");

        let service = Arc::new(CrawlService {
            kv: kv.clone(),
            fetcher: Fetcher::new(),
            robots: Arc::new(RobotsGate::new(kv.clone(), discovery_client.clone())),
            sitemaps: SitemapDiscovery::new(kv.clone(), discovery_client),
            events: EventLog::new(kv, config.job_ttl),
            spawner,
            config,
        });

        if let Some(rx) = dispatch_rx {
            tokio::spawn(worker::dispatch_loop(rx, service.clone()));
        }

        service
    }

    /// Create a crawl job: validate the seed, persist the job, seed the
    /// frontier, kick off discovery and the first workers.
    pub async fn create_job(
        self: &Arc<Self>,
        request: CreateJobRequest,
    ) -> Result<CreateJobResponse> {
        let options = request.options.unwrap_or_default();

        let seed = urls::normalize(&request.url, None)?;
        if !urls::is_documentation_url(&seed) {
            return Err(CrawlError::InvalidUrl(format!(
                "{} is not a documentation url",
                request.url
            )));
        }
        let scope = urls::ScopeFilter::new(&seed, &options)?;
        if !scope.accepts(&seed) {
            return Err(CrawlError::InvalidUrl(format!(
                "{seed} is excluded by the configured path filters"
            )));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let now = now_secs();
        let job = Job {
            job_id: job_id.clone(),
            seed_url: seed.to_string(),
            status: JobStatusKind::Running,
            created_at: now,
            updated_at: now,
            completed_at: None,
            options: options.clone(),
            error_message: None,
        };

        self.kv
            .hash_set(&keys::job_meta(&job_id), &job.to_fields())
            .await?;
        self.kv
            .set_add(&keys::jobs_index(), &[job_id.clone()])
            .await?;

        self.events
            .append(
                &job_id,
                EventType::StreamConnected,
                json!({ "jobId": job_id, "seedUrl": job.seed_url }),
            )
            .await?;

        let frontier = Frontier::new(self.kv.clone(), &job_id, options.clone(), scope);
        match frontier.try_enqueue(seed.as_str(), 0, None).await? {
            crate::crawler::EnqueueOutcome::Enqueued => {}
            crate::crawler::EnqueueOutcome::Skipped(reason) => {
                let message = format!("seed {seed} rejected: {reason:?}");
                self.update_status(&job_id, JobStatusKind::Failed, Some(&message))
                    .await?;
                return Err(CrawlError::InvalidUrl(message));
            }
        }

        let ttl_keys = [
            keys::job_meta(&job_id),
            keys::frontier(&job_id),
            keys::visited(&job_id),
            keys::pages(&job_id),
        ];
        futures::future::try_join_all(
            ttl_keys
                .iter()
                .map(|key| self.kv.expire(key, self.config.job_ttl)),
        )
        .await?;

        if options.use_sitemap {
            let service = self.clone();
            let discovery_job = job_id.clone();
            tokio::spawn(async move {
                service.run_discovery(&discovery_job).await;
            });
        } else {
            self.kv
                .set(
                    &keys::discovery(&job_id),
                    "done",
                    Some(self.config.job_ttl),
                )
                .await?;
        }

        for _ in 0..options.max_workers.min(INITIAL_WORKERS) {
            self.spawner.dispatch(&job_id).await;
        }

        tracing::info!(
            job_id = %job_id,
            seed = %job.seed_url,
            max_pages = options.max_pages,
            max_depth = options.max_depth,
            "Crawl job created"
        );

        Ok(CreateJobResponse {
            stream_url: format!(
                "{}/jobs/{}/stream",
                self.config.public_base_url.trim_end_matches('/'),
                job_id
            ),
            job_id,
        })
    }

    /// Seed the frontier from sitemaps, then mark discovery complete and
    /// wake workers. Sitemap trouble never fails the job; the crawl falls
    /// back to the seed URL alone.
    async fn run_discovery(self: &Arc<Self>, job_id: &str) {
        if let Err(e) = self.discover_into_frontier(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Sitemap discovery failed");
        }
        if let Err(e) = self
            .kv
            .set(&keys::discovery(job_id), "done", Some(self.config.job_ttl))
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark discovery done");
        }

        if let Ok(Some(job)) = self.load_job(job_id).await {
            if !job.status.is_terminal() {
                for _ in 0..job.options.max_workers.min(INITIAL_WORKERS) {
                    self.spawner.dispatch(job_id).await;
                }
            }
        }
    }

    async fn discover_into_frontier(self: &Arc<Self>, job_id: &str) -> Result<()> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(());
        };
        let seed = urls::normalize(&job.seed_url, None)?;
        let scope = urls::ScopeFilter::new(&seed, &job.options)?;

        let rules = self.robots.rules_for(&seed).await;
        let result = self
            .sitemaps
            .discover(
                &seed,
                &rules.sitemaps,
                job.options.max_pages as usize * 2,
            )
            .await;
        if result.from_cache {
            incr_total(self.kv.as_ref(), job_id, "fromCache").await?;
        }
        if result.urls.is_empty() {
            return Ok(());
        }

        let frontier = Frontier::new(self.kv.clone(), job_id, job.options.clone(), scope);
        let mut enqueued = 0u64;
        for url in &result.urls {
            match frontier.try_enqueue(url, 0, None).await? {
                crate::crawler::EnqueueOutcome::Enqueued => enqueued += 1,
                crate::crawler::EnqueueOutcome::Skipped(
                    crate::crawler::SkipReason::CapacityReached,
                ) => break,
                crate::crawler::EnqueueOutcome::Skipped(_) => {}
            }
        }

        if enqueued > 0 {
            let total_discovered = self
                .kv
                .counter_get(&keys::job_total(job_id, "discovered"))
                .await?;
            self.events
                .append(
                    job_id,
                    EventType::UrlsDiscovered,
                    json!({
                        "source_url": "sitemap",
                        "count": enqueued,
                        "total_discovered": total_discovered,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub async fn load_job(&self, job_id: &str) -> Result<Option<Job>> {
        let fields = self.kv.hash_get_all(&keys::job_meta(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Job::from_fields(&fields))
    }

    pub(crate) async fn load_status(&self, job_id: &str) -> Result<Option<JobStatusKind>> {
        let raw = self.kv.hash_get(&keys::job_meta(job_id), "status").await?;
        Ok(raw.and_then(|s| JobStatusKind::parse(&s)))
    }

    /// Current snapshot for `GET /jobs/{id}/state`.
    pub async fn snapshot(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(None);
        };
        let totals = read_totals(self.kv.as_ref(), job_id).await?;
        let last_event_id = self.events.last_event_id(job_id).await?;
        Ok(Some(JobSnapshot {
            job_id: job.job_id,
            status: job.status,
            totals,
            last_event_id: (last_event_id > 0).then_some(last_event_id),
            error: job.error_message,
        }))
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobListEntry>> {
        let ids = self.kv.set_members(&keys::jobs_index()).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            // Expired jobs linger in the index; skip them
            if let Some(job) = self.load_job(&id).await? {
                jobs.push(JobListEntry {
                    id: job.job_id,
                    url: job.seed_url,
                    status: job.status,
                    created_at: job.created_at,
                });
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Cooperative cancel: flip the status so workers stop at their next
    /// iteration, then append the terminal event under the single-writer
    /// lock.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(true);
        }

        self.update_status(job_id, JobStatusKind::Cancelled, Some("cancelled"))
            .await?;
        self.append_terminal(job_id, EventType::JobFailed, json!({ "error": "cancelled" }))
            .await?;

        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(true)
    }

    /// Mark a job failed (fatal errors only) and append the terminal event.
    pub async fn fail_job(&self, job_id: &str, message: &str) -> Result<()> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        self.update_status(job_id, JobStatusKind::Failed, Some(message))
            .await?;
        self.append_terminal(job_id, EventType::JobFailed, json!({ "error": message }))
            .await?;
        Ok(())
    }

    /// Append a terminal event under the single-writer lock, retrying
    /// briefly if a completing worker holds it. Whoever wins, the log ends
    /// with exactly one terminal event.
    async fn append_terminal(
        &self,
        job_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<()> {
        for _ in 0..5 {
            if self.events.try_acquire_terminal_lock(job_id).await? {
                let result = async {
                    let last = self.events.last_event_id(job_id).await?;
                    let tail = self
                        .events
                        .read_after(job_id, last.saturating_sub(1), 2)
                        .await?;
                    if tail.iter().any(|e| e.event_type.is_terminal()) {
                        return Ok(());
                    }
                    self.events.append(job_id, event_type, payload.clone()).await?;
                    Ok(())
                }
                .await;
                self.events.release_terminal_lock(job_id).await?;
                return result;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        tracing::warn!(job_id = %job_id, "Terminal lock contended; event not appended");
        Ok(())
    }

    /// Completion detection. Idempotent: safe to call at any time, from any
    /// worker or an external nudge; only the lock holder that passes the
    /// re-check performs the terminal transition.
    pub async fn try_complete(&self, job_id: &str) -> Result<()> {
        if !self.events.try_acquire_terminal_lock(job_id).await? {
            return Ok(());
        }
        let result = self.complete_locked(job_id).await;
        self.events.release_terminal_lock(job_id).await?;
        result
    }

    async fn complete_locked(&self, job_id: &str) -> Result<()> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        let totals = read_totals(self.kv.as_ref(), job_id).await?;

        // Wall-clock timeout takes precedence over the quiescence check
        if now_secs() >= job.created_at + job.options.job_timeout {
            self.update_status(job_id, JobStatusKind::Timeout, Some("job timed out"))
                .await?;
            self.events
                .append(
                    job_id,
                    EventType::JobTimeout,
                    json!({
                        "totalProcessed": totals.processed,
                        "totalDiscovered": totals.discovered,
                        "timestamp": now_secs(),
                    }),
                )
                .await?;
            tracing::warn!(job_id = %job_id, "Job timed out");
            return Ok(());
        }

        // Quiescent only when nothing is queued, running, or still arriving
        let frontier_len = self.kv.list_len(&keys::frontier(job_id)).await?;
        let active = self.kv.counter_get(&keys::workers(job_id)).await?;
        let discovery_done = self
            .kv
            .get(&keys::discovery(job_id))
            .await?
            .as_deref()
            == Some("done");
        if frontier_len > 0 || active > 0 || !discovery_done {
            return Ok(());
        }

        let markdown = self.assemble(job_id, &job.options).await?;
        self.kv
            .set(&keys::result(job_id), &markdown, Some(self.config.job_ttl))
            .await?;

        self.update_status(job_id, JobStatusKind::Completed, None)
            .await?;
        self.events
            .append(
                job_id,
                EventType::JobCompleted,
                json!({
                    "totalProcessed": totals.processed,
                    "totalDiscovered": totals.discovered,
                    "timestamp": now_secs(),
                }),
            )
            .await?;

        tracing::info!(
            job_id = %job_id,
            processed = totals.processed,
            discovered = totals.discovered,
            "Job completed"
        );
        Ok(())
    }

    /// Build the combined Markdown: crawled pages at or above the quality
    /// threshold, best first, each section headed by title and source.
    async fn assemble(&self, job_id: &str, options: &JobOptions) -> Result<String> {
        let raw = self.kv.hash_get_all(&keys::pages(job_id)).await?;
        let mut pages: Vec<PageRecord> = raw
            .values()
            .filter_map(|r| serde_json::from_str::<PageRecord>(r).ok())
            .filter(|p| {
                p.status == PageStatus::Crawled
                    && p.quality_score.unwrap_or(0) >= options.quality_threshold
            })
            .collect();
        pages.sort_by(|a, b| {
            b.quality_score
                .cmp(&a.quality_score)
                .then_with(|| a.url.cmp(&b.url))
        });

        self.events
            .append(
                job_id,
                EventType::SentToProcessing,
                json!({ "pages": pages.len() }),
            )
            .await?;

        let sections: Vec<String> = pages
            .iter()
            .map(|page| {
                let title = page.title.as_deref().unwrap_or(page.url.as_str());
                format!(
                    "## {}\n\n**Source:** {}\n\n{}",
                    title,
                    page.url,
                    page.content.as_deref().unwrap_or_default()
                )
            })
            .collect();

        Ok(sections.join("\n\n---\n\n"))
    }

    /// `GET /jobs/{id}/download`; only a completed job has a result.
    pub async fn download(&self, job_id: &str) -> Result<Option<String>> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(None);
        };
        if job.status != JobStatusKind::Completed {
            return Ok(None);
        }
        self.kv.get(&keys::result(job_id)).await
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatusKind,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now_secs().to_string();
        let mut fields: Vec<(&str, String)> = vec![
            ("status", status.as_str().to_string()),
            ("updatedAt", now.clone()),
        ];
        if status.is_terminal() {
            fields.push(("completedAt", now));
        }
        if let Some(msg) = error {
            fields.push(("errorMessage", msg.to_string()));
        }
        self.kv.hash_set(&keys::job_meta(job_id), &fields).await
    }
}
