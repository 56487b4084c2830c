//! Crawl error taxonomy and exit-code mapping.
//!
//! Every failure in the engine is classified into an [`ErrorKind`]; only a
//! handful of kinds terminate the crawl (see [`CrawlError`]), the rest become
//! error records in the archive and the crawl continues.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a recorded (non-fatal) crawl error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid seeds or options. Fails fast before any I/O.
    Config,
    /// DNS, TCP, TLS or HTTP-level failure.
    Network,
    /// A fetch, render or navigation deadline expired.
    Timeout,
    /// Per-page byte or request cap exceeded.
    CapExceeded,
    /// Browser-level failure during rendering.
    Render,
    /// A single extractor failed; the page itself survives.
    Extract,
    /// Dataset or blob I/O failure.
    Write,
    /// robots.txt disallowed the URL and the policy was respected.
    RobotsBlocked,
    /// A record was rejected by the dataset schema gate.
    Validation,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::CapExceeded => "cap_exceeded",
            Self::Render => "render",
            Self::Extract => "extract",
            Self::Write => "write",
            Self::RobotsBlocked => "robots_blocked",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase an error record is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    Fetch,
    Render,
    Extract,
    Write,
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::Render => "render",
            Self::Extract => "extract",
            Self::Write => "write",
        };
        f.write_str(s)
    }
}

/// Terminal error of a crawl run.
///
/// The variants mirror the exit codes the external CLI maps to:
/// `1` invalid arguments, `2` error budget exceeded, `4` cannot write
/// output, `5` archive validation failed, `10` generic error.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("error budget exceeded: {total_errors} errors > budget {budget}")]
    ErrorBudgetExceeded { total_errors: u64, budget: u64 },

    #[error("cannot write output: {0}")]
    OutputUnwritable(String),

    #[error("archive validation failed: {0}")]
    ArchiveValidation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// Exit code the external CLI front-end should return for this error.
    /// A successful run is `0`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::ErrorBudgetExceeded { .. } => 2,
            Self::OutputUnwritable(_) => 4,
            Self::ArchiveValidation(_) => 5,
            Self::Other(_) => 10,
        }
    }
}

/// Classify a renderer failure to decide whether the single in-page retry
/// is worth attempting. Network and browser failures are usually transient;
/// content failures are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Browser,
    Content,
    Unknown,
}

impl FailureClass {
    #[must_use]
    pub fn classify(error: &anyhow::Error) -> Self {
        let msg = error.to_string().to_lowercase();

        if msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("connection refused")
            || msg.contains("connection reset")
            || msg.contains("dns")
            || msg.contains("unreachable")
        {
            return Self::Network;
        }
        if msg.contains("browser")
            || msg.contains("chrome")
            || msg.contains("cdp")
            || msg.contains("target")
            || msg.contains("session")
        {
            return Self::Browser;
        }
        if msg.contains("parse") || msg.contains("content") || msg.contains("selector") {
            return Self::Content;
        }
        Self::Unknown
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Browser | Self::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(CrawlError::Config("x".into()).exit_code(), 1);
        assert_eq!(
            CrawlError::ErrorBudgetExceeded { total_errors: 2, budget: 1 }.exit_code(),
            2
        );
        assert_eq!(CrawlError::OutputUnwritable("x".into()).exit_code(), 4);
        assert_eq!(CrawlError::ArchiveValidation("x".into()).exit_code(), 5);
        assert_eq!(CrawlError::Other(anyhow::anyhow!("x")).exit_code(), 10);
    }

    #[test]
    fn content_failures_are_not_retried() {
        let err = anyhow::anyhow!("failed to parse selector");
        assert!(!FailureClass::classify(&err).is_retryable());
        let err = anyhow::anyhow!("connection refused by peer");
        assert!(FailureClass::classify(&err).is_retryable());
    }
}
