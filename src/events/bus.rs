//! The per-crawl event bus.
//!
//! A `tokio::sync::broadcast` channel carries live events; a bounded ring
//! per event type backs `on_with_replay` so late subscribers still see what
//! already happened. The bus is a leaf: it holds no references back into
//! the scheduler or the writers.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::types::{CrawlEvent, EventPayload, EventType};

/// Events retained per type for replay.
const REPLAY_RING_CAPACITY: usize = 1024;

/// Live + replay subscription to one event type.
pub struct EventStream {
    filter: EventType,
    backlog: VecDeque<CrawlEvent>,
    last_replayed_seq: u64,
    rx: tokio::sync::broadcast::Receiver<CrawlEvent>,
}

impl EventStream {
    /// Next event of the subscribed type: replayed backlog first, then live
    /// events. Returns `None` once the bus is dropped and the backlog is
    /// drained.
    pub async fn recv(&mut self) -> Option<CrawlEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.event_type() == self.filter && event.seq > self.last_replayed_seq {
                        return Some(event);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking drain of whatever is immediately available.
    pub fn try_drain(&mut self) -> Vec<CrawlEvent> {
        let mut events: Vec<CrawlEvent> = self.backlog.drain(..).collect();
        while let Ok(event) = self.rx.try_recv() {
            if event.event_type() == self.filter && event.seq > self.last_replayed_seq {
                events.push(event);
            }
        }
        events
    }
}

/// Counters for bus health, reported in the final summary.
#[derive(Debug, Default)]
pub struct BusMetrics {
    pub published: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub dropped: u64,
}

pub struct EventBus {
    crawl_id: String,
    seq: AtomicU64,
    tx: tokio::sync::broadcast::Sender<CrawlEvent>,
    replay: Mutex<HashMap<EventType, VecDeque<CrawlEvent>>>,
    metrics: BusMetrics,
    /// NDJSON event log sink, one serialized event per line.
    log_sink: Option<tokio::sync::Mutex<tokio::fs::File>>,
    log_path: Option<PathBuf>,
}

impl EventBus {
    #[must_use]
    pub fn new(crawl_id: &str, capacity: usize) -> Arc<Self> {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(16));
        Arc::new(Self {
            crawl_id: crawl_id.to_string(),
            seq: AtomicU64::new(0),
            tx,
            replay: Mutex::new(HashMap::new()),
            metrics: BusMetrics::default(),
            log_sink: None,
            log_path: None,
        })
    }

    /// Create a bus that also appends every event to an NDJSON log file.
    pub async fn with_log_file(
        crawl_id: &str,
        capacity: usize,
        log_path: PathBuf,
    ) -> anyhow::Result<Arc<Self>> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(16));
        Ok(Arc::new(Self {
            crawl_id: crawl_id.to_string(),
            seq: AtomicU64::new(0),
            tx,
            replay: Mutex::new(HashMap::new()),
            metrics: BusMetrics::default(),
            log_sink: Some(tokio::sync::Mutex::new(file)),
            log_path: Some(log_path),
        }))
    }

    #[must_use]
    pub fn crawl_id(&self) -> &str {
        &self.crawl_id
    }

    #[must_use]
    pub fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }

    /// Publish a payload: assigns the envelope, records it for replay,
    /// broadcasts to live subscribers, and appends to the log sink.
    pub async fn publish(&self, payload: EventPayload) -> CrawlEvent {
        let event = CrawlEvent {
            crawl_id: self.crawl_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: chrono::Utc::now(),
            payload,
        };

        {
            let mut replay = self.replay.lock();
            let ring = replay.entry(event.event_type()).or_default();
            if ring.len() >= REPLAY_RING_CAPACITY {
                ring.pop_front();
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
            ring.push_back(event.clone());
        }

        // A send error only means there are no live subscribers.
        let _ = self.tx.send(event.clone());
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &self.log_sink {
            match serde_json::to_string(&event) {
                Ok(mut line) => {
                    line.push('\n');
                    let mut file = sink.lock().await;
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        warn!(error = %e, "failed to append event to log file");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize event for log file"),
            }
        }

        event
    }

    /// Subscribe to future events of one type.
    #[must_use]
    pub fn on(&self, event_type: EventType) -> EventStream {
        EventStream {
            filter: event_type,
            backlog: VecDeque::new(),
            last_replayed_seq: 0,
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to one type, first replaying events of that type already
    /// published this crawl. The live stream skips anything with a sequence
    /// number at or below the replayed tail, so nothing is delivered twice.
    #[must_use]
    pub fn on_with_replay(&self, event_type: EventType) -> EventStream {
        // Subscribe before snapshotting the ring so no event can fall in
        // the gap between the two.
        let rx = self.tx.subscribe();
        let backlog: VecDeque<CrawlEvent> = self
            .replay
            .lock()
            .get(&event_type)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default();
        let last_replayed_seq = backlog.back().map_or(0, |e| e.seq);
        EventStream { filter: event_type, backlog, last_replayed_seq, rx }
    }

    #[must_use]
    pub fn metrics(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.metrics.published.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
        }
    }
}
