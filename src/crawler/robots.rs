use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use crate::kv::{keys, SharedKv};

const ROBOTS_CACHE_TTL: Duration = Duration::from_secs(3600);
const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CRAWL_DELAY: Duration = Duration::from_secs(10);

/// Parsed robots.txt rules for one host.
#[derive(Debug, Default)]
pub struct RobotsRules {
    /// Lowercase user-agent -> rule group.
    groups: HashMap<String, Group>,
    /// `Sitemap:` directives, in file order.
    pub sitemaps: Vec<String>,
    /// Whether a robots.txt was actually fetched and parsed.
    pub loaded: bool,
}

#[derive(Debug, Default)]
struct Group {
    rules: Vec<Rule>,
    crawl_delay: Option<f64>,
}

#[derive(Debug)]
struct Rule {
    allow: bool,
    prefix: String,
}

impl RobotsRules {
    /// Everything-allowed rules, used when no robots.txt is reachable.
    pub fn allow_all() -> Self {
        RobotsRules::default()
    }

    pub fn parse(content: &str) -> Self {
        let mut groups: HashMap<String, Group> = HashMap::new();
        let mut sitemaps = Vec::new();
        let mut current_agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for line in content.lines() {
            let line = match line.find('#') {
                Some(idx) => line[..idx].trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                // Blank line closes the current group
                current_agents.clear();
                in_rules = false;
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if in_rules {
                        current_agents.clear();
                        in_rules = false;
                    }
                    current_agents.push(value.to_lowercase());
                }
                "disallow" | "allow" => {
                    in_rules = true;
                    if value.is_empty() && key == "disallow" {
                        // "Disallow:" with no value allows everything
                        continue;
                    }
                    for agent in &current_agents {
                        groups.entry(agent.clone()).or_default().rules.push(Rule {
                            allow: key == "allow",
                            prefix: value.to_string(),
                        });
                    }
                }
                "crawl-delay" => {
                    in_rules = true;
                    if let Ok(secs) = value.parse::<f64>() {
                        for agent in &current_agents {
                            groups.entry(agent.clone()).or_default().crawl_delay = Some(secs);
                        }
                    }
                }
                "sitemap" => {
                    if !value.is_empty() {
                        sitemaps.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        RobotsRules {
            groups,
            sitemaps,
            loaded: true,
        }
    }

    /// Whether `url` may be fetched by `user_agent`. Rules from the specific
    /// agent group and the wildcard group are both consulted; the longest
    /// matching prefix wins, ties going to the more specific group and then
    /// to allow.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let path = match Url::parse(url) {
            Ok(u) => {
                let mut p = u.path().to_string();
                if let Some(q) = u.query() {
                    p.push('?');
                    p.push_str(q);
                }
                p
            }
            Err(_) => return true,
        };

        let ua = user_agent.to_lowercase();
        let mut best: Option<(usize, bool, bool)> = None; // (len, specific, allow)

        for (specific, agent) in [(true, ua.as_str()), (false, "*")] {
            let Some(group) = self.groups.get(agent) else {
                continue;
            };
            for rule in &group.rules {
                if !path.starts_with(&rule.prefix) {
                    continue;
                }
                let candidate = (rule.prefix.len(), specific, rule.allow);
                best = Some(match best {
                    None => candidate,
                    Some(current) => {
                        // Longer prefix wins; then specific group; then allow
                        if (candidate.0, candidate.1, candidate.2)
                            > (current.0, current.1, current.2)
                        {
                            candidate
                        } else {
                            current
                        }
                    }
                });
            }
        }

        best.map(|(_, _, allow)| allow).unwrap_or(true)
    }

    /// Crawl-Delay for the agent (falling back to the wildcard group),
    /// capped at 10 seconds.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        let ua = user_agent.to_lowercase();
        let secs = self
            .groups
            .get(ua.as_str())
            .and_then(|g| g.crawl_delay)
            .or_else(|| self.groups.get("*").and_then(|g| g.crawl_delay))?;
        if secs <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(secs).min(MAX_CRAWL_DELAY))
    }
}

/// Per-host robots gate: fetches once per host, memoizes in the KV store
/// for an hour, and keeps a per-process map as an accelerator.
pub struct RobotsGate {
    kv: SharedKv,
    client: reqwest::Client,
    local: RwLock<HashMap<String, Arc<RobotsRules>>>,
}

impl RobotsGate {
    pub fn new(kv: SharedKv, client: reqwest::Client) -> Self {
        RobotsGate {
            kv,
            client,
            local: RwLock::new(HashMap::new()),
        }
    }

    /// Rules for the host of `url`. Unreachable or missing robots.txt means
    /// everything is allowed; this never fails the caller.
    pub async fn rules_for(&self, url: &Url) -> Arc<RobotsRules> {
        let Some(host) = url.host_str().map(|h| h.to_lowercase()) else {
            return Arc::new(RobotsRules::allow_all());
        };

        if let Some(rules) = self.local.read().await.get(&host) {
            return rules.clone();
        }

        let cache_key = keys::robots_cache(&host);
        let body = match self.kv.get(&cache_key).await {
            Ok(Some(cached)) => cached,
            _ => {
                let fetched = self.fetch_robots(url).await.unwrap_or_default();
                if let Err(e) = self
                    .kv
                    .set(&cache_key, &fetched, Some(ROBOTS_CACHE_TTL))
                    .await
                {
                    tracing::debug!(host = %host, error = %e, "robots cache write failed");
                }
                fetched
            }
        };

        let rules = Arc::new(if body.is_empty() {
            RobotsRules::allow_all()
        } else {
            RobotsRules::parse(&body)
        });
        self.local.write().await.insert(host, rules.clone());
        rules
    }

    async fn fetch_robots(&self, url: &Url) -> Option<String> {
        let mut robots_url = url.clone();
        robots_url.set_path("/robots.txt");
        robots_url.set_query(None);
        robots_url.set_fragment(None);

        let response = self
            .client
            .get(robots_url.as_str())
            .timeout(ROBOTS_FETCH_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}
