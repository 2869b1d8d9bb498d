use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::CrawlService;
use crate::crawler::{urls::ScopeFilter, Frontier, Pipeline};
use crate::error::{CrawlError, Result};
use crate::kv::keys;
use crate::models::{now_secs, EventType, Job};

/// Fire-and-forget dispatch of one worker invocation for a job. This is the
/// self-reinvocation seam: in-process by default, over HTTP when replicas
/// share the store.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn dispatch(&self, job_id: &str);
}

/// Feeds job ids into the in-process dispatch loop.
pub struct ChannelSpawner {
    pub(super) tx: mpsc::Sender<String>,
}

#[async_trait]
impl WorkerSpawner for ChannelSpawner {
    async fn dispatch(&self, job_id: &str) {
        if let Err(e) = self.tx.send(job_id.to_string()).await {
            tracing::error!(job_id = %job_id, error = %e, "Worker dispatch failed");
        }
    }
}

/// POSTs the worker entry point of this (or any) replica.
pub struct HttpSpawner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpawner {
    pub fn new(base_url: &str) -> Self {
        HttpSpawner {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl WorkerSpawner for HttpSpawner {
    async fn dispatch(&self, job_id: &str) {
        let url = format!("{}/internal/jobs/{}/worker", self.base_url, job_id);
        let client = self.client.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).send().await {
                tracing::error!(job_id = %job_id, error = %e, "Worker reinvocation failed");
            }
        });
    }
}

/// Receives dispatched job ids and runs one worker invocation per message.
pub(super) async fn dispatch_loop(mut rx: mpsc::Receiver<String>, service: Arc<CrawlService>) {
    while let Some(job_id) = rx.recv().await {
        let service = service.clone();
        tokio::spawn(async move {
            run_worker(service, job_id).await;
        });
    }
}

/// Why the batch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchEnd {
    Drained,
    BatchLimit,
    TimeBudget,
    JobDeadline,
    Terminal,
}

/// One bounded worker invocation: claim a slot, process up to `batchCount`
/// entries within the time budget, then hand off — reinvoke while work
/// remains, or trigger completion detection as the last worker out.
pub async fn run_worker(service: Arc<CrawlService>, job_id: String) {
    match worker_invocation(&service, &job_id).await {
        Ok(()) => {}
        Err(CrawlError::Fatal(msg)) => {
            tracing::error!(job_id = %job_id, error = %msg, "Worker hit fatal error");
            if let Err(e) = service.fail_job(&job_id, &msg).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to fail job");
            }
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Worker invocation error");
        }
    }
}

async fn worker_invocation(service: &Arc<CrawlService>, job_id: &str) -> Result<()> {
    let workers_key = keys::workers(job_id);
    let kv = service.kv.clone();

    let Some(job) = service.load_job(job_id).await? else {
        tracing::warn!(job_id = %job_id, "Worker dispatched for unknown job");
        return Ok(());
    };

    let slot = kv.counter_incr(&workers_key, 1).await?;
    if slot == 1 {
        kv.expire(&workers_key, service.config.job_ttl).await?;
    }
    if slot > job.options.max_workers as i64 {
        kv.counter_incr(&workers_key, -1).await?;
        return Ok(());
    }

    // The increment above and the decrement below are the single pair for
    // this invocation; every path between them funnels through `end`.
    let batch_result = run_batch(service, &job).await;
    let remaining = kv.counter_incr(&workers_key, -1).await?;

    let end = batch_result?;
    tracing::debug!(job_id = %job_id, ?end, remaining, "Worker invocation done");

    if end == BatchEnd::Terminal {
        return Ok(());
    }

    let Some(job) = service.load_job(job_id).await? else {
        return Ok(());
    };
    if job.status.is_terminal() {
        return Ok(());
    }

    let frontier_len = kv.list_len(&keys::frontier(job_id)).await?;
    let past_deadline = now_secs() >= job.created_at + job.options.job_timeout;

    if !past_deadline && frontier_len > 0 && remaining < job.options.max_workers as i64 {
        service.spawner.dispatch(job_id).await;
    } else if remaining <= 0 && (frontier_len == 0 || past_deadline) {
        service.try_complete(job_id).await?;
    }
    Ok(())
}

async fn run_batch(service: &Arc<CrawlService>, job: &Job) -> Result<BatchEnd> {
    let job_id = job.job_id.as_str();
    let options = job.options.clone();

    let seed = crate::crawler::urls::normalize(&job.seed_url, None)?;
    let scope = ScopeFilter::new(&seed, &options)?;
    let frontier = Frontier::new(service.kv.clone(), job_id, options.clone(), scope);
    let pipeline = Pipeline::new(
        service.kv.clone(),
        service.fetcher.clone(),
        service.events.clone(),
        service.robots.clone(),
        job_id,
        options.clone(),
        job.created_at,
        service.config.job_ttl,
    );

    let started = Instant::now();
    let soft_deadline = Duration::from_secs(options.soft_deadline);
    let mut end = BatchEnd::BatchLimit;
    let mut processed_any = false;

    for _ in 0..options.batch_count {
        // Cancellation is cooperative: re-read status at each boundary
        let status = service.load_status(job_id).await?;
        if status.map(|s| s.is_terminal()).unwrap_or(true) {
            return Ok(BatchEnd::Terminal);
        }

        let deadline = job.created_at + options.job_timeout;
        if now_secs() >= deadline {
            end = BatchEnd::JobDeadline;
            break;
        }

        let Some(entry) = frontier.dequeue().await? else {
            end = BatchEnd::Drained;
            break;
        };

        match pipeline.process(&frontier, &entry).await {
            Ok(outcome) => {
                processed_any = true;
                tracing::debug!(job_id = %job_id, url = %entry.url, ?outcome, "Entry processed");
            }
            Err(e @ CrawlError::Fatal(_)) => return Err(e),
            Err(e) => {
                // KV flake on a single entry: log and move on, the claim
                // set keeps the entry from being processed twice
                tracing::warn!(job_id = %job_id, url = %entry.url, error = %e, "Pipeline error");
            }
        }

        let job_remaining =
            Duration::from_secs((job.created_at + options.job_timeout).saturating_sub(now_secs()));
        if started.elapsed() > soft_deadline || job_remaining < service.config.reinvoke_margin {
            end = BatchEnd::TimeBudget;
            break;
        }
    }

    if processed_any {
        let totals = crate::kv::read_totals(service.kv.as_ref(), job_id).await?;
        let event_type = if end == BatchEnd::TimeBudget {
            EventType::TimeUpdate
        } else {
            EventType::Progress
        };
        service
            .events
            .append(
                job_id,
                event_type,
                json!({
                    "processed": totals.processed,
                    "discovered": totals.discovered,
                    "elapsedSec": now_secs().saturating_sub(job.created_at),
                }),
            )
            .await?;
    }

    Ok(end)
}
