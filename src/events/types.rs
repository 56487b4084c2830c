//! Typed events published during a crawl.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ErrorPhase};
use crate::events::metrics::MetricsSnapshot;
use crate::records::RenderMode;

/// Why the crawl stopped. Ranked: `error_budget` > `capped` > `manual` >
/// `finished`; when several conditions hold the highest-ranked wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Finished,
    Capped,
    Manual,
    ErrorBudget,
}

impl CompletionReason {
    /// Higher outranks lower when stop conditions race.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Finished => 0,
            Self::Manual => 1,
            Self::Capped => 2,
            Self::ErrorBudget => 3,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Capped => "capped",
            Self::Manual => "manual",
            Self::ErrorBudget => "error_budget",
        }
    }
}

/// The closed set of event types on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    CrawlStarted,
    PageFetched,
    ErrorOccurred,
    CheckpointSaved,
    Heartbeat,
    Shutdown,
    Finished,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::CrawlStarted,
        EventType::PageFetched,
        EventType::ErrorOccurred,
        EventType::CheckpointSaved,
        EventType::Heartbeat,
        EventType::Shutdown,
        EventType::Finished,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrawlStarted => "crawl.started",
            Self::PageFetched => "page.fetched",
            Self::ErrorOccurred => "error.occurred",
            Self::CheckpointSaved => "checkpoint.saved",
            Self::Heartbeat => "crawl.heartbeat",
            Self::Shutdown => "crawl.shutdown",
            Self::Finished => "crawl.finished",
        }
    }
}

/// Per-page metadata carried on `page.fetched`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFetchMetadata {
    pub html_size: usize,
    pub links_found: usize,
    pub fetch_ms: u64,
    pub render_ms: u64,
    pub extract_ms: u64,
    pub write_ms: u64,
}

/// Event payloads, tagged with the wire event-type string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    #[serde(rename = "crawl.started")]
    CrawlStarted {
        seeds: Vec<String>,
        mode: RenderMode,
        out_path: String,
    },
    #[serde(rename = "page.fetched")]
    PageFetched {
        url: String,
        host: String,
        status_code: u16,
        depth: u32,
        metadata: PageFetchMetadata,
    },
    #[serde(rename = "error.occurred")]
    ErrorOccurred {
        url: String,
        kind: ErrorKind,
        phase: ErrorPhase,
        message: String,
    },
    #[serde(rename = "checkpoint.saved")]
    CheckpointSaved {
        pages_crawled: u64,
        frontier_remaining: u64,
    },
    #[serde(rename = "crawl.heartbeat")]
    Heartbeat {
        metrics: MetricsSnapshot,
        memory_paused: bool,
    },
    #[serde(rename = "crawl.shutdown")]
    Shutdown { reason: CompletionReason },
    #[serde(rename = "crawl.finished")]
    Finished {
        pages: u64,
        edges: u64,
        errors: u64,
        duration_ms: u64,
    },
}

impl EventPayload {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::CrawlStarted { .. } => EventType::CrawlStarted,
            Self::PageFetched { .. } => EventType::PageFetched,
            Self::ErrorOccurred { .. } => EventType::ErrorOccurred,
            Self::CheckpointSaved { .. } => EventType::CheckpointSaved,
            Self::Heartbeat { .. } => EventType::Heartbeat,
            Self::Shutdown { .. } => EventType::Shutdown,
            Self::Finished { .. } => EventType::Finished,
        }
    }
}

/// An event as published: payload plus the bus-assigned envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlEvent {
    pub crawl_id: String,
    /// Monotonic per-crawl sequence number.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl CrawlEvent {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
