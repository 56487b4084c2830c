//! Validating builder for [`CrawlConfig`].

use std::path::PathBuf;
use url::Url;

use super::types::CrawlConfig;
use crate::archive::PrivacyPolicy;
use crate::error::CrawlError;
use crate::records::RenderMode;
use crate::renderer::WaitCondition;
use crate::urlnorm::{self, NormalizeOptions, ParamPolicy};

#[derive(Debug, Default)]
pub struct CrawlConfigBuilder {
    config: CrawlConfig,
}

impl CrawlConfigBuilder {
    #[must_use]
    pub fn seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn out_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.out_path = path.into();
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: RenderMode) -> Self {
        self.config.mode = mode;
        self
    }

    #[must_use]
    pub fn rps(mut self, rps: f64) -> Self {
        self.config.rps = rps;
        self
    }

    #[must_use]
    pub fn per_host_rps(mut self, rps: f64) -> Self {
        self.config.per_host_rps = rps;
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn respect_robots(mut self, respect: bool) -> Self {
        self.config.respect_robots = respect;
        self
    }

    #[must_use]
    pub fn override_robots(mut self, override_robots: bool) -> Self {
        self.config.override_robots = override_robots;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn max_pages(mut self, max_pages: i64) -> Self {
        self.config.max_pages = max_pages;
        self
    }

    #[must_use]
    pub fn max_depth(mut self, max_depth: i64) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    #[must_use]
    pub fn follow_external(mut self, follow: bool) -> Self {
        self.config.follow_external = follow;
        self
    }

    #[must_use]
    pub fn allow_private_ips(mut self, allow: bool) -> Self {
        self.config.allow_private_ips = allow;
        self
    }

    #[must_use]
    pub fn param_policy(mut self, policy: ParamPolicy) -> Self {
        self.config.param_policy = policy;
        self
    }

    #[must_use]
    pub fn param_block_list<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.param_block_list = entries.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn normalize_options(mut self, options: NormalizeOptions) -> Self {
        self.config.normalize = options;
        self
    }

    #[must_use]
    pub fn exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exclude_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn checkpoint_interval(mut self, pages: u64) -> Self {
        self.config.checkpoint_interval = pages;
        self
    }

    #[must_use]
    pub fn checkpoint_every_seconds(mut self, seconds: u64) -> Self {
        self.config.checkpoint_every_seconds = seconds;
        self
    }

    #[must_use]
    pub fn error_budget(mut self, budget: u64) -> Self {
        self.config.error_budget = budget;
        self
    }

    #[must_use]
    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn fetch_byte_cap(mut self, bytes: u64) -> Self {
        self.config.fetch_byte_cap = bytes;
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, redirects: u32) -> Self {
        self.config.max_redirects = redirects;
        self
    }

    #[must_use]
    pub fn render_timeout_ms(mut self, ms: u64) -> Self {
        self.config.render_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn render_wait(mut self, wait: WaitCondition) -> Self {
        self.config.render_wait = wait;
        self
    }

    #[must_use]
    pub fn max_requests_per_page(mut self, requests: u32) -> Self {
        self.config.max_requests_per_page = requests;
        self
    }

    #[must_use]
    pub fn max_bytes_per_page(mut self, bytes: u64) -> Self {
        self.config.max_bytes_per_page = bytes;
        self
    }

    #[must_use]
    pub fn persist_session(mut self, persist: bool) -> Self {
        self.config.persist_session = persist;
        self
    }

    #[must_use]
    pub fn capture_subresources(mut self, capture: bool) -> Self {
        self.config.capture_subresources = Some(capture);
        self
    }

    #[must_use]
    pub fn screenshots(mut self, screenshots: bool) -> Self {
        self.config.screenshots = screenshots;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.config.quiet = quiet;
        self
    }

    #[must_use]
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn max_rss_mb(mut self, mb: u64) -> Self {
        self.config.max_rss_mb = mb;
        self
    }

    #[must_use]
    pub fn rotate_max_bytes(mut self, bytes: u64) -> Self {
        self.config.rotate_max_bytes = bytes;
        self
    }

    #[must_use]
    pub fn rotate_max_records(mut self, records: u64) -> Self {
        self.config.rotate_max_records = records;
        self
    }

    #[must_use]
    pub fn zstd_level(mut self, level: i32) -> Self {
        self.config.zstd_level = level;
        self
    }

    #[must_use]
    pub fn privacy(mut self, privacy: PrivacyPolicy) -> Self {
        self.config.privacy = privacy;
        self
    }

    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.config.owner = owner.into();
        self
    }

    #[must_use]
    pub fn resume_staging(mut self, staging: impl Into<PathBuf>) -> Self {
        self.config.resume_staging = Some(staging.into());
        self
    }

    #[must_use]
    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.config.grace_period_ms = ms;
        self
    }

    /// Validate and produce the configuration. Fails fast with a `config`
    /// error before any I/O.
    pub fn build(self) -> Result<CrawlConfig, CrawlError> {
        let mut config = self.config;

        config.exclude_patterns_compiled = config
            .exclude_patterns
            .iter()
            .map(|pattern| {
                regex::Regex::new(pattern).map_err(|e| {
                    CrawlError::Config(format!("invalid exclude pattern {pattern:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if config.seeds.is_empty() {
            return Err(CrawlError::Config("at least one seed URL is required".into()));
        }
        for seed in &config.seeds {
            let parsed = Url::parse(seed)
                .map_err(|e| CrawlError::Config(format!("invalid seed {seed:?}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(CrawlError::Config(format!(
                    "seed {seed:?} must be http or https"
                )));
            }
            if parsed.host_str().is_none() {
                return Err(CrawlError::Config(format!("seed {seed:?} has no host")));
            }
            if !config.allow_private_ips && urlnorm::is_private_ip(seed) {
                return Err(CrawlError::Config(format!(
                    "seed {seed:?} targets a private address; enable allow_private_ips to crawl it"
                )));
            }
        }

        if !(config.rps > 0.0) {
            return Err(CrawlError::Config("rps must be positive".into()));
        }
        if !(config.per_host_rps > 0.0) {
            return Err(CrawlError::Config("perHostRps must be positive".into()));
        }
        if config.concurrency == 0 || config.concurrency > 256 {
            return Err(CrawlError::Config("concurrency must be in 1..=256".into()));
        }
        if !(1..=19).contains(&config.zstd_level) {
            return Err(CrawlError::Config("zstd level must be in 1..=19".into()));
        }
        if config.out_path.as_os_str().is_empty() {
            return Err(CrawlError::Config("output path must not be empty".into()));
        }
        if let Some(staging) = &config.resume_staging
            && !staging.is_dir()
        {
            return Err(CrawlError::Config(format!(
                "resume staging directory {} does not exist",
                staging.display()
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_seeds() {
        let err = CrawlConfig::builder().build().unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn rejects_bad_scheme_and_private_seeds() {
        let err = CrawlConfig::builder()
            .seeds(["ftp://example.com/"])
            .build()
            .unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));

        let err = CrawlConfig::builder()
            .seeds(["http://127.0.0.1/"])
            .build()
            .unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));

        // Explicitly allowed private targets pass (test servers).
        CrawlConfig::builder()
            .seeds(["http://127.0.0.1:8080/"])
            .allow_private_ips(true)
            .build()
            .unwrap();
    }

    #[test]
    fn rejects_non_positive_rates() {
        let err = CrawlConfig::builder()
            .seeds(["https://example.com/"])
            .rps(0.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));
    }

    #[test]
    fn defaults_are_buildable() {
        let config = CrawlConfig::builder()
            .seeds(["https://example.com/"])
            .build()
            .unwrap();
        assert_eq!(config.effective_max_pages(), None);
        assert!(config.respect_robots());
        assert!(!config.capture_subresources());
    }

    #[test]
    fn exclude_patterns_are_compiled_and_validated() {
        let config = CrawlConfig::builder()
            .seeds(["https://example.com/"])
            .exclude_patterns([r"\.pdf$", "/admin/"])
            .build()
            .unwrap();
        assert!(config.is_excluded("https://example.com/file.pdf"));
        assert!(config.is_excluded("https://example.com/admin/users"));
        assert!(!config.is_excluded("https://example.com/blog/"));

        let err = CrawlConfig::builder()
            .seeds(["https://example.com/"])
            .exclude_patterns(["("])
            .build()
            .unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));
    }

    #[test]
    fn negative_max_pages_means_unlimited() {
        let config = CrawlConfig::builder()
            .seeds(["https://example.com/"])
            .max_pages(-5)
            .build()
            .unwrap();
        assert_eq!(config.effective_max_pages(), None);
        let config = CrawlConfig::builder()
            .seeds(["https://example.com/"])
            .max_pages(7)
            .build()
            .unwrap();
        assert_eq!(config.effective_max_pages(), Some(7));
    }
}
