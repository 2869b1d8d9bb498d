use std::time::Duration;
use thiserror::Error;

/// Error kinds for the crawl engine. Page-scoped kinds never abort a job;
/// only `Fatal` is allowed to unwind past the component that raised it.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("http status {status} for {url}")]
    Http { url: String, status: u16 },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("parse failure: {0}")]
    Parse(String),
    #[error("job cancelled")]
    Cancelled,
    #[error("page capacity reached")]
    CapacityReached,
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, CrawlError>;

impl CrawlError {
    /// Transient failures retry with backoff; a fetch timeout gets one retry.
    pub fn max_attempts(&self) -> u32 {
        match self {
            CrawlError::Transient(_) => 3,
            CrawlError::Timeout(_) => 2,
            _ => 1,
        }
    }

    /// Short machine-readable kind, used in `url_failed` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::InvalidUrl(_) => "invalid_url",
            CrawlError::Http { .. } => "http_error",
            CrawlError::Timeout(_) => "timeout",
            CrawlError::Transient(_) => "transient",
            CrawlError::Parse(_) => "parse_error",
            CrawlError::Cancelled => "cancelled",
            CrawlError::CapacityReached => "capacity_reached",
            CrawlError::Fatal(_) => "fatal",
        }
    }
}

/// Backoff before retry attempt `attempt` (1-based): 2s, 4s, 8s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(3))
}
