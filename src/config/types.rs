//! Crawl configuration.
//!
//! Built through [`CrawlConfig::builder`], which validates before any I/O
//! happens; an invalid configuration is a `config` error (exit 1).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::archive::{PrivacyPolicy, RotationPolicy};
use crate::fetcher::FetchLimits;
use crate::records::RenderMode;
use crate::renderer::{RenderLimits, WaitCondition};
use crate::urlnorm::{NormalizeOptions, ParamPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub(crate) seeds: Vec<String>,
    pub(crate) out_path: PathBuf,
    pub(crate) mode: RenderMode,

    pub(crate) rps: f64,
    pub(crate) per_host_rps: f64,
    /// Worker count and the in-flight page bound.
    pub(crate) concurrency: usize,

    pub(crate) respect_robots: bool,
    pub(crate) override_robots: bool,
    pub(crate) user_agent: String,

    /// `<= 0` means unlimited.
    pub(crate) max_pages: i64,
    /// `<= 0` means unlimited.
    pub(crate) max_depth: i64,
    pub(crate) follow_external: bool,
    pub(crate) allow_private_ips: bool,

    pub(crate) param_policy: ParamPolicy,
    pub(crate) param_block_list: Vec<String>,
    pub(crate) normalize: NormalizeOptions,

    /// Regex patterns for URLs that must never be enqueued.
    pub(crate) exclude_patterns: Vec<String>,
    /// Compiled once at build time to keep regex work out of the hot path.
    #[serde(skip)]
    pub(crate) exclude_patterns_compiled: Vec<regex::Regex>,

    /// Checkpoint every N pages; 0 disables the page trigger.
    pub(crate) checkpoint_interval: u64,
    /// Checkpoint at least every N seconds; 0 disables the timer trigger.
    pub(crate) checkpoint_every_seconds: u64,
    /// 0 means unlimited.
    pub(crate) error_budget: u64,

    pub(crate) fetch_timeout_ms: u64,
    pub(crate) fetch_byte_cap: u64,
    pub(crate) max_redirects: u32,

    pub(crate) render_timeout_ms: u64,
    pub(crate) render_wait: WaitCondition,
    pub(crate) max_requests_per_page: u32,
    pub(crate) max_bytes_per_page: u64,
    pub(crate) persist_session: bool,
    /// None derives from the mode (full mode captures).
    pub(crate) capture_subresources: Option<bool>,
    pub(crate) screenshots: bool,
    pub(crate) headless: bool,

    pub(crate) quiet: bool,
    pub(crate) log_file: Option<PathBuf>,
    /// Soft RSS ceiling in MB; 0 disables the memory governor.
    pub(crate) max_rss_mb: u64,

    pub(crate) rotate_max_bytes: u64,
    pub(crate) rotate_max_records: u64,
    pub(crate) zstd_level: i32,

    pub(crate) privacy: PrivacyPolicy,
    pub(crate) owner: String,
    pub(crate) resume_staging: Option<PathBuf>,
    /// How long in-flight work may drain after a cancel.
    pub(crate) grace_period_ms: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            out_path: PathBuf::from("atlas.zip"),
            mode: RenderMode::Raw,
            rps: 2.0,
            per_host_rps: 2.0,
            concurrency: 8,
            respect_robots: true,
            override_robots: false,
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
            max_pages: 0,
            max_depth: 0,
            follow_external: false,
            allow_private_ips: false,
            param_policy: ParamPolicy::Keep,
            param_block_list: Vec::new(),
            normalize: NormalizeOptions::default(),
            exclude_patterns: Vec::new(),
            exclude_patterns_compiled: Vec::new(),
            checkpoint_interval: 25,
            checkpoint_every_seconds: 30,
            error_budget: 0,
            fetch_timeout_ms: 30_000,
            fetch_byte_cap: 10 * 1024 * 1024,
            max_redirects: 10,
            render_timeout_ms: 30_000,
            render_wait: WaitCondition::Load,
            max_requests_per_page: 250,
            max_bytes_per_page: 20 * 1024 * 1024,
            persist_session: false,
            capture_subresources: None,
            screenshots: false,
            headless: true,
            quiet: false,
            log_file: None,
            max_rss_mb: 0,
            rotate_max_bytes: 64 * 1024 * 1024,
            rotate_max_records: 100_000,
            zstd_level: 3,
            privacy: PrivacyPolicy::default(),
            owner: "siteatlas".to_string(),
            resume_staging: None,
            grace_period_ms: 5_000,
        }
    }
}

impl CrawlConfig {
    #[must_use]
    pub fn builder() -> super::builder::CrawlConfigBuilder {
        super::builder::CrawlConfigBuilder::default()
    }

    #[must_use]
    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    #[must_use]
    pub fn out_path(&self) -> &PathBuf {
        &self.out_path
    }

    #[must_use]
    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    #[must_use]
    pub fn respect_robots(&self) -> bool {
        self.respect_robots
    }

    #[must_use]
    pub fn override_robots(&self) -> bool {
        self.override_robots
    }

    #[must_use]
    pub fn follow_external(&self) -> bool {
        self.follow_external
    }

    #[must_use]
    pub fn allow_private_ips(&self) -> bool {
        self.allow_private_ips
    }

    #[must_use]
    pub fn quiet(&self) -> bool {
        self.quiet
    }

    #[must_use]
    pub fn error_budget(&self) -> u64 {
        self.error_budget
    }

    #[must_use]
    pub fn checkpoint_interval(&self) -> u64 {
        self.checkpoint_interval
    }

    #[must_use]
    pub fn checkpoint_every_seconds(&self) -> u64 {
        self.checkpoint_every_seconds
    }

    #[must_use]
    pub fn max_rss_mb(&self) -> u64 {
        self.max_rss_mb
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn privacy(&self) -> &PrivacyPolicy {
        &self.privacy
    }

    #[must_use]
    pub fn resume_staging(&self) -> Option<&PathBuf> {
        self.resume_staging.as_ref()
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub fn zstd_level(&self) -> i32 {
        self.zstd_level
    }

    #[must_use]
    pub fn param_policy(&self) -> ParamPolicy {
        self.param_policy
    }

    #[must_use]
    pub fn param_block_list(&self) -> &[String] {
        &self.param_block_list
    }

    #[must_use]
    pub fn normalize_options(&self) -> &NormalizeOptions {
        &self.normalize
    }

    /// Whether a URL key is excluded from enqueueing by configuration.
    #[must_use]
    pub fn is_excluded(&self, url_key: &str) -> bool {
        self.exclude_patterns_compiled
            .iter()
            .any(|pattern| pattern.is_match(url_key))
    }

    /// `maxPages` with the 0-or-negative-means-unlimited contract applied.
    #[must_use]
    pub fn effective_max_pages(&self) -> Option<u64> {
        (self.max_pages > 0).then_some(self.max_pages as u64)
    }

    /// `maxDepth` with the same unlimited contract.
    #[must_use]
    pub fn effective_max_depth(&self) -> Option<u32> {
        (self.max_depth > 0).then_some(self.max_depth as u32)
    }

    #[must_use]
    pub fn capture_subresources(&self) -> bool {
        self.capture_subresources
            .unwrap_or(self.mode == RenderMode::Full)
    }

    #[must_use]
    pub fn rps(&self) -> f64 {
        self.rps
    }

    #[must_use]
    pub fn per_host_rps(&self) -> f64 {
        self.per_host_rps
    }

    #[must_use]
    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            timeout: Duration::from_millis(self.fetch_timeout_ms),
            byte_cap: self.fetch_byte_cap,
            max_redirects: self.max_redirects,
            user_agent: self.user_agent.clone(),
            strip_cookies: self.privacy.strip_cookies,
            strip_auth_headers: self.privacy.strip_auth_headers,
        }
    }

    #[must_use]
    pub fn render_limits(&self) -> RenderLimits {
        RenderLimits {
            timeout: Duration::from_millis(self.render_timeout_ms),
            wait: self.render_wait,
            max_requests: self.max_requests_per_page,
            max_total_bytes: self.max_bytes_per_page,
            capture_subresources: self.capture_subresources(),
            persist_session: self.persist_session,
            screenshots: self.screenshots,
        }
    }

    #[must_use]
    pub fn headless(&self) -> bool {
        self.headless
    }

    #[must_use]
    pub fn rotation(&self) -> RotationPolicy {
        RotationPolicy { max_bytes: self.rotate_max_bytes, max_records: self.rotate_max_records }
    }

    /// Event log destination for this crawl.
    #[must_use]
    pub fn log_file_for(&self, crawl_id: &str) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("logs").join(format!("crawl-{crawl_id}.jsonl")))
    }
}
