//! siteatlas: a site crawler that produces self-describing,
//! content-addressed atlas archives.
//!
//! An atlas is a single ZIP-based file holding NDJSON datasets (pages,
//! edges, assets, errors, accessibility), a content-addressed blob store
//! of page bodies, per-dataset schemas, and a manifest describing
//! integrity and capabilities. The crawl engine is a BFS frontier driven
//! by rate-governed workers that fetch raw HTTP or render in a headless
//! browser, run the extractor suite, and stream records into the archive
//! writer with checkpoint/resume support.
//!
//! The command-line front-end, viewers and reader SDKs are external
//! consumers of this crate's API and of the archive format.
//!
//! ```no_run
//! use siteatlas::{CrawlConfig, crawl};
//!
//! # async fn run() -> Result<(), siteatlas::CrawlError> {
//! let config = CrawlConfig::builder()
//!     .seeds(["https://example.com/"])
//!     .out_path("example.atlas.zip")
//!     .max_pages(100)
//!     .build()?;
//! let report = crawl(config).await?;
//! println!("{} pages archived", report.summary.pages);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod extractors;
pub mod fetcher;
pub mod frontier;
pub mod governor;
pub mod records;
pub mod renderer;
pub mod robots;
pub mod runtime;
pub mod scheduler;
pub mod urlnorm;

pub use archive::{
    ArchiveSummary, BlobStore, BlobStoreStats, Capability, DatasetWriter, Manifest,
    PrivacyPolicy,
};
pub use config::{CrawlConfig, CrawlConfigBuilder};
pub use error::{CrawlError, ErrorKind, ErrorPhase};
pub use events::{CompletionReason, CrawlEvent, EventBus, EventStream, EventType};
pub use frontier::{Frontier, FrontierEntry};
pub use records::{
    AccessibilityRecord, AssetRecord, Dataset, EdgeRecord, ErrorRecord, PageRecord, RenderMode,
};
pub use scheduler::{CrawlReport, CrawlScheduler, CrawlState};

/// Default User-Agent presented to crawled hosts and robots.txt.
pub const DEFAULT_USER_AGENT: &str =
    concat!("siteatlas/", env!("CARGO_PKG_VERSION"), " (+https://github.com/siteatlas/siteatlas)");

/// Run a crawl to completion: build the scheduler, drive it, and return
/// the final report. See [`CrawlScheduler::run`] for the exit-code
/// semantics of `Ok` reports.
pub async fn crawl(config: CrawlConfig) -> Result<CrawlReport, CrawlError> {
    let scheduler = CrawlScheduler::start(config).await?;
    scheduler.run().await
}

/// Install a process-wide tracing subscriber for embedders that have none
/// (the external CLI maps its `--logLevel` flag here). `filter` takes an
/// env-filter directive such as `"siteatlas=debug"`; defaults to
/// `RUST_LOG`, then `info`. A no-op when a subscriber is already set.
pub fn init_logging(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;
    let filter = match filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
