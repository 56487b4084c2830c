//! Crawl event bus, typed events, and metrics.

pub mod bus;
pub mod metrics;
pub mod types;

pub use bus::{BusMetricsSnapshot, EventBus, EventStream};
pub use metrics::{CrawlMetrics, MetricsSnapshot, Stage, StageTimings};
pub use types::{
    CompletionReason, CrawlEvent, EventPayload, EventType, PageFetchMetadata,
};
