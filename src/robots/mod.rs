//! Per-host robots.txt resolution with a single-flight cache.
//!
//! Each host's robots.txt is fetched at most once per crawl. Fetch failures
//! (network, 4xx, 5xx) degrade to allow-all. When the crawl is configured
//! with `respect=false` or `override=true` the resolver still parses and
//! exposes rules, but decisions are forced to allowed with
//! `override_used=true` so the manifest can report the override.

pub mod parser;

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::records::RobotsVerdict;
use parser::RobotsTxt;

pub use parser::{Group, Rule};

/// Cached robots state for one host.
#[derive(Debug)]
enum HostRobots {
    /// Fetched and parsed.
    Rules(RobotsTxt),
    /// Fetch failed or returned an error status; everything is allowed.
    AllowAll,
}

pub struct RobotsResolver {
    client: reqwest::Client,
    cache: DashMap<String, Arc<HostRobots>>,
    /// Per-host fetch locks so concurrent workers trigger one fetch.
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Transport failures pending pickup as error records, one per host.
    fetch_failures: DashMap<String, String>,
    respect: bool,
    override_robots: bool,
    user_agent: String,
    overrides_used: AtomicU64,
}

impl RobotsResolver {
    pub fn new(respect: bool, override_robots: bool, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(Duration::from_secs(15))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            cache: DashMap::new(),
            inflight: DashMap::new(),
            fetch_failures: DashMap::new(),
            respect,
            override_robots,
            user_agent: user_agent.to_string(),
            overrides_used: AtomicU64::new(0),
        })
    }

    /// Decide whether `url` may be fetched. Always resolves; robots fetch
    /// failures mean allow-all.
    pub async fn allows(&self, url: &str) -> RobotsVerdict {
        let Ok(parsed) = Url::parse(url) else {
            return RobotsVerdict::allow_all();
        };
        let Some(host) = parsed.host_str() else {
            return RobotsVerdict::allow_all();
        };
        let host_key = format!(
            "{}://{}{}",
            parsed.scheme(),
            host.to_lowercase(),
            parsed.port().map(|p| format!(":{p}")).unwrap_or_default()
        );

        let robots = self.host_robots(&host_key).await;
        let mut verdict = match robots.as_ref() {
            HostRobots::AllowAll => RobotsVerdict::allow_all(),
            HostRobots::Rules(rules) => {
                let mut path = parsed.path().to_string();
                if let Some(q) = parsed.query() {
                    path.push('?');
                    path.push_str(q);
                }
                rules.check(&self.user_agent, &path)
            }
        };

        if !verdict.allowed && (!self.respect || self.override_robots) {
            verdict.allowed = true;
            verdict.override_used = true;
            self.overrides_used.fetch_add(1, Ordering::Relaxed);
        }
        verdict
    }

    /// Crawl delay declared for this crawl's user agent, if the host set one.
    pub async fn crawl_delay(&self, url: &str) -> Option<f64> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let host_key = format!(
            "{}://{}{}",
            parsed.scheme(),
            host.to_lowercase(),
            parsed.port().map(|p| format!(":{p}")).unwrap_or_default()
        );
        match self.host_robots(&host_key).await.as_ref() {
            HostRobots::Rules(rules) => rules.crawl_delay(&self.user_agent),
            HostRobots::AllowAll => None,
        }
    }

    /// Number of times a disallow rule was overridden; surfaced in the
    /// manifest notes.
    #[must_use]
    pub fn overrides_used(&self) -> u64 {
        self.overrides_used.load(Ordering::Relaxed)
    }

    /// Take the pending robots-fetch transport failure for `url`'s host,
    /// if one happened. Delivered once; the caller records it.
    #[must_use]
    pub fn take_fetch_failure(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let host_key = format!(
            "{}://{}{}",
            parsed.scheme(),
            host.to_lowercase(),
            parsed.port().map(|p| format!(":{p}")).unwrap_or_default()
        );
        self.fetch_failures.remove(&host_key).map(|(_, e)| e)
    }

    async fn host_robots(&self, host_key: &str) -> Arc<HostRobots> {
        if let Some(cached) = self.cache.get(host_key) {
            return Arc::clone(&cached);
        }

        let lock = self
            .inflight
            .entry(host_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another worker may have populated the cache while we waited.
        if let Some(cached) = self.cache.get(host_key) {
            return Arc::clone(&cached);
        }

        let robots = Arc::new(self.fetch_and_parse(host_key).await);
        self.cache.insert(host_key.to_string(), Arc::clone(&robots));
        robots
    }

    async fn fetch_and_parse(&self, host_key: &str) -> HostRobots {
        let robots_url = format!("{host_key}/robots.txt");
        debug!(url = %robots_url, "fetching robots.txt");

        let response = match self.client.get(&robots_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %robots_url, error = %e, "robots fetch failed, allowing all");
                self.fetch_failures
                    .insert(host_key.to_string(), e.to_string());
                return HostRobots::AllowAll;
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(url = %robots_url, status = %status, "robots returned non-success, allowing all");
            return HostRobots::AllowAll;
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                debug!(url = %robots_url, error = %e, "robots body unreadable, allowing all");
                return HostRobots::AllowAll;
            }
        };

        let (rules, warnings) = RobotsTxt::parse(&body);
        for warning in warnings {
            warn!(url = %robots_url, %warning, "skipped malformed robots.txt line");
        }
        HostRobots::Rules(rules)
    }
}
