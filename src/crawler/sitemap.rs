use async_recursion::async_recursion;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use crate::kv::{keys, SharedKv};

/// Well-known sitemap locations, probed in this order.
const CANDIDATE_PATHS: &[&str] = &[
    "/sitemap.xml",
    "/sitemap_index.xml",
    "/sitemaps.xml",
    "/sitemap/sitemap.xml",
    "/sitemaps/sitemap.xml",
    "/xml/sitemap.xml",
    "/wp-sitemap.xml",
    "/sitemap-index.xml",
];

const SITEMAP_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const SITEMAP_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const MAX_INDEX_DEPTH: u32 = 3;

/// Outcome of one discovery pass for a host.
#[derive(Debug, Clone, Default)]
pub struct SitemapUrls {
    pub urls: Vec<String>,
    pub from_cache: bool,
}

/// Sitemap discovery with a 24h per-host KV memo. Failures never propagate;
/// a host without usable sitemaps just yields an empty list and the crawl
/// proceeds from the seed alone.
pub struct SitemapDiscovery {
    kv: SharedKv,
    client: reqwest::Client,
}

impl SitemapDiscovery {
    pub fn new(kv: SharedKv, client: reqwest::Client) -> Self {
        SitemapDiscovery { kv, client }
    }

    /// Collect candidate page URLs for the seed's host: well-known paths
    /// first, then any `Sitemap:` entries from robots.txt. `max_urls` caps
    /// the accepted total (callers pass maxPages × 2).
    pub async fn discover(
        &self,
        seed: &Url,
        robots_sitemaps: &[String],
        max_urls: usize,
    ) -> SitemapUrls {
        let Some(host) = seed.host_str().map(|h| h.to_lowercase()) else {
            return SitemapUrls::default();
        };

        let cache_key = keys::sitemap_cache(&host);
        if let Ok(Some(cached)) = self.kv.get(&cache_key).await {
            if let Ok(urls) = serde_json::from_str::<Vec<String>>(&cached) {
                return SitemapUrls {
                    urls: urls.into_iter().take(max_urls).collect(),
                    from_cache: true,
                };
            }
        }

        let loc_re = Regex::new(r"<loc>\s*(.*?)\s*</loc>").expect("valid regex");
        let mut fetched: HashSet<String> = HashSet::new();
        let mut out: Vec<String> = Vec::new();

        let candidates: Vec<String> = CANDIDATE_PATHS
            .iter()
            .map(|path| {
                let mut url = seed.clone();
                url.set_path(path);
                url.set_query(None);
                url.set_fragment(None);
                url.to_string()
            })
            .chain(robots_sitemaps.iter().cloned())
            .collect();

        for candidate in candidates {
            if out.len() >= max_urls {
                break;
            }
            self.walk(&candidate, 0, &loc_re, &mut fetched, &mut out, max_urls)
                .await;
        }

        if !out.is_empty() {
            if let Ok(encoded) = serde_json::to_string(&out) {
                if let Err(e) = self.kv.set(&cache_key, &encoded, Some(SITEMAP_CACHE_TTL)).await {
                    tracing::debug!(host = %host, error = %e, "sitemap cache write failed");
                }
            }
        }

        tracing::info!(
            host = %host,
            urls = out.len(),
            sitemaps_fetched = fetched.len(),
            "Sitemap discovery complete"
        );

        SitemapUrls {
            urls: out,
            from_cache: false,
        }
    }

    /// Fetch one sitemap and fold its URLs into `out`, descending into child
    /// sitemaps up to `MAX_INDEX_DEPTH`. Each sitemap URL is fetched at most
    /// once per pass.
    #[async_recursion]
    async fn walk(
        &self,
        sitemap_url: &str,
        depth: u32,
        loc_re: &Regex,
        fetched: &mut HashSet<String>,
        out: &mut Vec<String>,
        max_urls: usize,
    ) {
        if depth > MAX_INDEX_DEPTH || out.len() >= max_urls {
            return;
        }
        if !fetched.insert(sitemap_url.to_string()) {
            return;
        }

        let Some(xml) = self.fetch_xml(sitemap_url).await else {
            return;
        };

        let locs = extract_locs(loc_re, &xml);
        let is_index = xml.contains("<sitemapindex");

        for loc in locs {
            if out.len() >= max_urls {
                return;
            }
            if is_index || is_child_sitemap(&loc) {
                self.walk(&loc, depth + 1, loc_re, fetched, out, max_urls)
                    .await;
            } else {
                out.push(loc);
            }
        }
    }

    async fn fetch_xml(&self, url: &str) -> Option<String> {
        let resp = self
            .client
            .get(url)
            .timeout(SITEMAP_FETCH_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok()
    }
}

/// A `<loc>` that is itself another sitemap rather than a page.
fn is_child_sitemap(loc: &str) -> bool {
    let lower = loc.to_lowercase();
    lower.ends_with(".xml") && (lower.contains("sitemap") || lower.contains("feed"))
}

fn extract_locs(re: &Regex, xml: &str) -> Vec<String> {
    re.captures_iter(xml)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryKv};
    use std::sync::Arc;

    #[test]
    fn test_extract_locs() {
        let re = Regex::new(r"<loc>\s*(.*?)\s*</loc>").unwrap();
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://x.test/</loc></url>
  <url><loc>
    https://x.test/docs
  </loc></url>
</urlset>"#;
        let locs = extract_locs(&re, xml);
        assert_eq!(locs, vec!["https://x.test/", "https://x.test/docs"]);
    }

    #[test]
    fn test_extract_locs_garbage() {
        let re = Regex::new(r"<loc>\s*(.*?)\s*</loc>").unwrap();
        assert!(extract_locs(&re, "not xml").is_empty());
        assert!(extract_locs(&re, "<urlset></urlset>").is_empty());
    }

    #[test]
    fn test_child_sitemap_detection() {
        assert!(is_child_sitemap("https://x.test/sitemap-posts.xml"));
        assert!(is_child_sitemap("https://x.test/feeds/feed.xml"));
        assert!(!is_child_sitemap("https://x.test/page.xml"));
        assert!(!is_child_sitemap("https://x.test/sitemap.html"));
    }

    #[test]
    fn test_candidate_order() {
        assert_eq!(CANDIDATE_PATHS[0], "/sitemap.xml");
        assert_eq!(CANDIDATE_PATHS[1], "/sitemap_index.xml");
        assert_eq!(CANDIDATE_PATHS[7], "/sitemap-index.xml");
        assert_eq!(CANDIDATE_PATHS.len(), 8);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetching() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        kv.set(
            &keys::sitemap_cache("cached.test"),
            r#"["https://cached.test/a","https://cached.test/b"]"#,
            None,
        )
        .await
        .unwrap();

        let discovery = SitemapDiscovery::new(kv, reqwest::Client::new());
        let seed = Url::parse("https://cached.test/").unwrap();
        let result = discovery.discover(&seed, &[], 100).await;
        assert!(result.from_cache);
        assert_eq!(result.urls.len(), 2);

        // The cap applies to cached results too
        let capped = discovery.discover(&seed, &[], 1).await;
        assert_eq!(capped.urls.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_yields_empty() {
        let kv: SharedKv = Arc::new(MemoryKv::new());
        let discovery = SitemapDiscovery::new(kv, reqwest::Client::new());
        let seed = Url::parse("https://unreachable.invalid/").unwrap();
        let result = discovery.discover(&seed, &[], 100).await;
        assert!(result.urls.is_empty());
        assert!(!result.from_cache);
    }
}
