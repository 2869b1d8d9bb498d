use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the Unix epoch, used for event timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// --- Job options ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default = "default_batch_count")]
    pub batch_count: u32,
    /// Per-invocation time budget in seconds before reinvoking.
    #[serde(default = "default_soft_deadline")]
    pub soft_deadline: u64,
    /// HTTP fetch timeout in seconds.
    #[serde(default = "default_page_timeout")]
    pub page_timeout: u64,
    /// Wall-clock cap in seconds from job creation to completion.
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u32,
    #[serde(default)]
    pub follow_external_links: bool,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    #[serde(default = "default_true")]
    pub use_sitemap: bool,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default = "default_max_links_per_page")]
    pub max_links_per_page: u32,
}

fn default_max_pages() -> u32 {
    50
}
fn default_max_depth() -> u32 {
    2
}
fn default_max_workers() -> u32 {
    5
}
fn default_batch_count() -> u32 {
    10
}
fn default_soft_deadline() -> u64 {
    25
}
fn default_page_timeout() -> u64 {
    8
}
fn default_job_timeout() -> u64 {
    300
}
fn default_quality_threshold() -> u32 {
    20
}
fn default_max_links_per_page() -> u32 {
    50
}
fn default_true() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            max_workers: default_max_workers(),
            batch_count: default_batch_count(),
            soft_deadline: default_soft_deadline(),
            page_timeout: default_page_timeout(),
            job_timeout: default_job_timeout(),
            quality_threshold: default_quality_threshold(),
            follow_external_links: false,
            respect_robots: true,
            use_sitemap: true,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            max_links_per_page: default_max_links_per_page(),
        }
    }
}

// --- Job ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusKind {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatusKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatusKind::Completed
                | JobStatusKind::Failed
                | JobStatusKind::Timeout
                | JobStatusKind::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatusKind::Pending => "pending",
            JobStatusKind::Running => "running",
            JobStatusKind::Completed => "completed",
            JobStatusKind::Failed => "failed",
            JobStatusKind::Timeout => "timeout",
            JobStatusKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatusKind::Pending),
            "running" => Some(JobStatusKind::Running),
            "completed" => Some(JobStatusKind::Completed),
            "failed" => Some(JobStatusKind::Failed),
            "timeout" => Some(JobStatusKind::Timeout),
            "cancelled" => Some(JobStatusKind::Cancelled),
            _ => None,
        }
    }
}

/// Monotonically non-decreasing per-job counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub discovered: u64,
    pub queued: u64,
    pub processed: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub failed: u64,
    pub from_cache: u64,
}

pub const TOTAL_FIELDS: &[&str] = &[
    "discovered",
    "queued",
    "processed",
    "filtered",
    "skipped",
    "failed",
    "fromCache",
];

impl Totals {
    pub fn from_counters(values: &HashMap<String, i64>) -> Self {
        let get = |f: &str| values.get(f).copied().unwrap_or(0).max(0) as u64;
        Totals {
            discovered: get("discovered"),
            queued: get("queued"),
            processed: get("processed"),
            filtered: get("filtered"),
            skipped: get("skipped"),
            failed: get("failed"),
            from_cache: get("fromCache"),
        }
    }
}

/// Job aggregate root, persisted as the `job:{id}:meta` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub seed_url: String,
    pub status: JobStatusKind,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    pub options: JobOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Job {
    /// Flatten into hash fields for the KV meta record.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("jobId", self.job_id.clone()),
            ("seedUrl", self.seed_url.clone()),
            ("status", self.status.as_str().to_string()),
            ("createdAt", self.created_at.to_string()),
            ("updatedAt", self.updated_at.to_string()),
            (
                "options",
                serde_json::to_string(&self.options).unwrap_or_default(),
            ),
        ];
        if let Some(at) = self.completed_at {
            fields.push(("completedAt", at.to_string()));
        }
        if let Some(ref msg) = self.error_message {
            fields.push(("errorMessage", msg.clone()));
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let options = fields
            .get("options")
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        Some(Job {
            job_id: fields.get("jobId")?.clone(),
            seed_url: fields.get("seedUrl")?.clone(),
            status: JobStatusKind::parse(fields.get("status")?)?,
            created_at: fields.get("createdAt").and_then(|s| s.parse().ok())?,
            updated_at: fields
                .get("updatedAt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            completed_at: fields.get("completedAt").and_then(|s| s.parse().ok()),
            options,
            error_message: fields.get("errorMessage").cloned(),
        })
    }
}

// --- Page records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Fetching,
    Crawled,
    Error,
    Skipped,
}

/// One crawled (or attempted) page. `(job_id, url)` is unique; inserts are
/// idempotent because the page id is derived from the canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub page_id: String,
    pub job_id: String,
    pub url: String,
    pub status: PageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub discovered_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawled_at: Option<u64>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
}

/// Stable page id: hex prefix of the canonical URL's SHA-256.
pub fn page_id_for(url: &str) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

// --- Frontier ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierEntry {
    pub url: String,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
}

// --- Events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StreamConnected,
    UrlStarted,
    UrlCrawled,
    UrlFailed,
    UrlsDiscovered,
    SentToProcessing,
    Progress,
    TimeUpdate,
    JobCompleted,
    JobFailed,
    JobTimeout,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StreamConnected => "stream_connected",
            EventType::UrlStarted => "url_started",
            EventType::UrlCrawled => "url_crawled",
            EventType::UrlFailed => "url_failed",
            EventType::UrlsDiscovered => "urls_discovered",
            EventType::SentToProcessing => "sent_to_processing",
            EventType::Progress => "progress",
            EventType::TimeUpdate => "time_update",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::JobTimeout => "job_timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::JobCompleted | EventType::JobFailed | EventType::JobTimeout
        )
    }
}

/// One entry of the per-job append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: u64,
    pub job_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

// --- API wire types ---

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub url: String,
    #[serde(default)]
    pub options: Option<JobOptions>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: String,
    pub stream_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatusKind,
    pub totals: Totals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListEntry {
    pub id: String,
    pub url: String,
    pub status: JobStatusKind,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let opts: JobOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.max_pages, 50);
        assert_eq!(opts.max_depth, 2);
        assert_eq!(opts.max_workers, 5);
        assert_eq!(opts.batch_count, 10);
        assert_eq!(opts.soft_deadline, 25);
        assert_eq!(opts.page_timeout, 8);
        assert_eq!(opts.job_timeout, 300);
        assert_eq!(opts.quality_threshold, 20);
        assert!(!opts.follow_external_links);
        assert!(opts.respect_robots);
        assert!(opts.use_sitemap);
        assert!(opts.include_paths.is_empty());
        assert_eq!(opts.max_links_per_page, 50);
    }

    #[test]
    fn test_options_override() {
        let opts: JobOptions =
            serde_json::from_str(r#"{"maxPages": 3, "maxDepth": 0, "useSitemap": false}"#).unwrap();
        assert_eq!(opts.max_pages, 3);
        assert_eq!(opts.max_depth, 0);
        assert!(!opts.use_sitemap);
        // Untouched fields keep their defaults
        assert_eq!(opts.max_workers, 5);
    }

    #[test]
    fn test_job_fields_roundtrip() {
        let job = Job {
            job_id: "j1".into(),
            seed_url: "https://docs.example.com".into(),
            status: JobStatusKind::Running,
            created_at: 1000,
            updated_at: 1001,
            completed_at: None,
            options: JobOptions::default(),
            error_message: None,
        };
        let map: HashMap<String, String> = job
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = Job::from_fields(&map).unwrap();
        assert_eq!(back.job_id, "j1");
        assert_eq!(back.status, JobStatusKind::Running);
        assert_eq!(back.options.max_pages, 50);
        assert!(back.completed_at.is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatusKind::Completed.is_terminal());
        assert!(JobStatusKind::Cancelled.is_terminal());
        assert!(JobStatusKind::Timeout.is_terminal());
        assert!(!JobStatusKind::Running.is_terminal());
    }

    #[test]
    fn test_page_id_is_stable() {
        let a = page_id_for("https://example.com/docs");
        let b = page_id_for("https://example.com/docs");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, page_id_for("https://example.com/other"));
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::JobCompleted).unwrap(),
            "\"job_completed\""
        );
        assert_eq!(EventType::UrlsDiscovered.as_str(), "urls_discovered");
        assert!(EventType::JobTimeout.is_terminal());
        assert!(!EventType::Progress.is_terminal());
    }
}
