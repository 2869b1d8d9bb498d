use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{CrawlError, Result};

pub const USER_AGENT: &str = "DocspastaCrawler/1.0 (+https://docspasta.example/crawler)";
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml;q=0.9";

type HostLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Result of a successful page fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status_code: u16,
    pub body: String,
    pub final_url: String,
}

/// HTTP fetcher with per-host pacing.
///
/// Each host gets its own limiter: the default quota is 2 requests/second,
/// but a robots.txt Crawl-Delay (already capped by the parser) widens the
/// period for that host.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    limiters: Arc<RwLock<HashMap<String, Arc<HostLimiter>>>>,
}

impl Fetcher {
    pub fn new() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .gzip(true)
            .pool_max_idle_per_host(20)
            .build()
            .expect("Failed to build HTTP client");

        Fetcher {
            client,
            limiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn limiter_for(&self, host: &str, crawl_delay: Option<Duration>) -> Arc<HostLimiter> {
        {
            let limiters = self.limiters.read().await;
            if let Some(limiter) = limiters.get(host) {
                return limiter.clone();
            }
        }

        let mut limiters = self.limiters.write().await;
        limiters
            .entry(host.to_string())
            .or_insert_with(|| {
                let quota = match crawl_delay {
                    Some(delay) if !delay.is_zero() => {
                        Quota::with_period(delay).unwrap_or_else(|| Quota::per_second(nonzero!(2u32)))
                    }
                    _ => Quota::per_second(nonzero!(2u32)),
                };
                Arc::new(RateLimiter::direct(quota))
            })
            .clone()
    }

    /// Fetch one page after rate-limit clearance. Non-2xx responses are
    /// `Http` errors; timeouts and connection flakes map to their kinds.
    pub async fn fetch(
        &self,
        url: &Url,
        timeout: Duration,
        crawl_delay: Option<Duration>,
    ) -> Result<FetchResult> {
        let host = url.host_str().unwrap_or_default().to_lowercase();
        let limiter = self.limiter_for(&host, crawl_delay).await;
        limiter.until_ready().await;

        let response = self
            .client
            .get(url.as_str())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();

        if !response.status().is_success() {
            return Err(CrawlError::Http {
                url: url.to_string(),
                status: status_code,
            });
        }

        let body = response.text().await.map_err(|e| classify(url, e))?;

        Ok(FetchResult {
            status_code,
            body,
            final_url,
        })
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(url: &Url, e: reqwest::Error) -> CrawlError {
    if e.is_timeout() {
        CrawlError::Timeout(format!("fetch {url}: {e}"))
    } else {
        CrawlError::Transient(format!("fetch {url}: {e}"))
    }
}
