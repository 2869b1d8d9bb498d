use regex::Regex;
use url::Url;

use crate::error::{CrawlError, Result};
use crate::models::JobOptions;

/// Path segments that mark asset URLs, never documentation.
const ASSET_DIRS: &[&str] = &[
    "/assets/", "/images/", "/img/", "/css/", "/js/", "/fonts/", "/static/", "/media/",
];

/// File extensions that are never documentation pages.
const ASSET_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".svg", ".ico", ".css", ".js", ".map", ".mp4", ".webm",
    ".mp3", ".wav", ".ttf", ".woff", ".woff2", ".eot", ".pdf", ".zip", ".tar",
];

/// Tracking query parameters stripped during normalization.
fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || name == "fbclid" || name == "gclid"
}

/// Produce the canonical form of a URL, resolving relative references
/// against `base`: lowercase host, default port dropped, fragment removed,
/// tracking params dropped, path case preserved, one trailing slash stripped
/// off non-root paths.
pub fn normalize(raw: &str, base: Option<&Url>) -> Result<Url> {
    let mut parsed = match base {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    }
    .map_err(|e| CrawlError::InvalidUrl(format!("{raw}: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(CrawlError::InvalidUrl(format!(
            "{raw}: unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(CrawlError::InvalidUrl(format!("{raw}: missing host")));
    }

    parsed.set_fragment(None);

    // The url crate already lowercases scheme and host and drops default
    // ports; tracking params and the trailing slash are on us.
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name.clone()
                } else {
                    format!("{name}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(&path[..path.len() - 1]);
    }

    Ok(parsed)
}

/// The canonical variants treated as one semantic URL for deduplication:
/// `{http,https} × {host, www.host} × {slash, no-slash}` (the slash axis
/// collapses at the root path).
pub fn permutations(canonical: &Url) -> Vec<String> {
    let host = canonical.host_str().unwrap_or_default();
    let bare = host.strip_prefix("www.").unwrap_or(host);
    let hosts = [bare.to_string(), format!("www.{bare}")];

    let port = canonical
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    let query = canonical
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();

    let path = canonical.path();
    let paths = if path == "/" {
        vec![path.to_string()]
    } else {
        vec![path.to_string(), format!("{path}/")]
    };

    let mut variants = Vec::with_capacity(2 * hosts.len() * paths.len());
    for scheme in ["http", "https"] {
        for host in &hosts {
            for path in &paths {
                variants.push(format!("{scheme}://{host}{port}{path}{query}"));
            }
        }
    }
    variants
}

/// Whether the URL plausibly points at a documentation page rather than a
/// site asset.
pub fn is_documentation_url(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    if ASSET_DIRS.iter().any(|dir| path.contains(dir)) {
        return false;
    }
    !ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Origin + include/exclude scope decisions for one job.
#[derive(Debug)]
pub struct ScopeFilter {
    seed_host: String,
    follow_external_links: bool,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl ScopeFilter {
    pub fn new(seed: &Url, options: &JobOptions) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| CrawlError::InvalidUrl(format!("bad path pattern {p}: {e}")))
                })
                .collect()
        };
        Ok(ScopeFilter {
            seed_host: bare_host(seed),
            follow_external_links: options.follow_external_links,
            include: compile(&options.include_paths)?,
            exclude: compile(&options.exclude_paths)?,
        })
    }

    /// Accept iff same-origin (unless external links are allowed), at least
    /// one include pattern matches (when any are set), and no exclude
    /// pattern matches.
    pub fn accepts(&self, url: &Url) -> bool {
        if !self.follow_external_links && bare_host(url) != self.seed_host {
            return false;
        }
        let path = url.path();
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if self.exclude.iter().any(|re| re.is_match(path)) {
            return false;
        }
        true
    }
}

/// Host with any `www.` prefix stripped; `www.x.test` and `x.test` are the
/// same origin for scoping purposes, mirroring the permutation set.
fn bare_host(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(host).to_string()
}
