//! The crawl scheduler: worker lifecycle, ranked stop conditions,
//! checkpointing, cancellation with a drain grace period, and archive
//! finalization.
//!
//! State machine: `idle → starting → running ↔ paused → canceling →
//! finalizing → done | failed`. Cancellation is two-level: a soft flag
//! stops new dispatches and unblocks token acquisitions (which re-queue
//! their entry), while in-flight fetch/render work drains until a grace
//! timer trips the hard abort.

mod dispatch;
mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::archive::{
    ArchiveSummary, ArchiveWriter, BlobStoreStats, Capability, FinalizeError, FinalizeOptions,
    RobotsPolicyInfo,
};
use crate::checkpoint::{CheckpointManager, CursorFile, DatasetCursor};
use crate::config::CrawlConfig;
use crate::error::CrawlError;
use crate::events::{
    BusMetricsSnapshot, CompletionReason, CrawlMetrics, EventBus, EventPayload, MetricsSnapshot,
};
use crate::fetcher::RawFetcher;
use crate::frontier::{Frontier, FrontierEntry};
use crate::governor::RateGovernor;
use crate::records::Dataset;
use crate::renderer::Renderer;
use crate::robots::RobotsResolver;
use crate::runtime::{CancelHandle, PauseGate};
use crate::urlnorm::{self, ParamSampler};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Crawl lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    Idle,
    Starting,
    Running,
    Paused,
    Canceling,
    Finalizing,
    Done,
    Failed,
}

/// Performance block of the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfReport {
    pub metrics: MetricsSnapshot,
    pub bus: BusMetricsSnapshot,
    pub blobs: BlobStoreStats,
}

/// Outcome handed back to the caller (and serialized to stdout by the
/// external CLI when `--json` is set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlReport {
    pub crawl_id: String,
    pub out_file: PathBuf,
    pub summary: ArchiveSummary,
    pub perf: PerfReport,
    pub notes: Vec<String>,
    /// 0 on success; 2 when the error budget tripped (the archive still
    /// finalizes in that case).
    pub exit_code: i32,
}

/// Shared state of one crawl. Workers, background tasks and the dispatch
/// pipeline all hang off this.
pub(crate) struct SchedulerCore {
    pub(crate) config: CrawlConfig,
    pub(crate) crawl_id: String,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) metrics: Arc<CrawlMetrics>,
    pub(crate) frontier: Arc<Frontier>,
    pub(crate) governor: RateGovernor,
    pub(crate) robots: RobotsResolver,
    pub(crate) archive: ArchiveWriter,
    pub(crate) fetcher: RawFetcher,
    pub(crate) renderer: tokio::sync::OnceCell<Renderer>,
    pub(crate) sampler: ParamSampler,
    /// Soft cancel: stop new dispatches, unblock acquisitions.
    pub(crate) cancel: CancelHandle,
    /// Hard abort: fired after the grace period; kills in-flight I/O.
    pub(crate) abort: CancelHandle,
    pub(crate) pause: PauseGate,
    pub(crate) mem_pause: PauseGate,
    pub(crate) seed_origins: Vec<url::Origin>,
    pub(crate) poisoned: AtomicBool,
    in_flight: AtomicUsize,
    pages_dispatched: AtomicU64,
    completion: parking_lot::Mutex<Option<CompletionReason>>,
    state: parking_lot::Mutex<CrawlState>,
    grace_armed: AtomicBool,
    checkpoints: CheckpointManager,
    checkpoint_lock: tokio::sync::Mutex<()>,
    last_checkpoint: parking_lot::Mutex<Instant>,
    pages_since_checkpoint: AtomicU64,
    started_at: DateTime<Utc>,
    started_instant: Instant,
}

impl SchedulerCore {
    fn set_state(&self, state: CrawlState) {
        *self.state.lock() = state;
    }

    pub(crate) fn state(&self) -> CrawlState {
        *self.state.lock()
    }

    /// Record a stop reason; the highest-ranked reason wins when several
    /// conditions race.
    fn set_reason(&self, reason: CompletionReason) {
        let mut slot = self.completion.lock();
        match *slot {
            Some(current) if current.rank() >= reason.rank() => {}
            _ => *slot = Some(reason),
        }
    }

    fn completion_reason(&self) -> CompletionReason {
        self.completion.lock().unwrap_or(CompletionReason::Finished)
    }

    /// Begin the cancel transition: rank the reason, stop new dispatches,
    /// and arm the grace timer that hard-aborts stragglers.
    fn begin_cancel(&self, reason: CompletionReason) {
        self.set_reason(reason);
        if self.state() == CrawlState::Running || self.state() == CrawlState::Paused {
            self.set_state(CrawlState::Canceling);
        }
        self.cancel.cancel();
        self.frontier.wake_all();

        if !self.grace_armed.swap(true, Ordering::SeqCst) {
            let abort = self.abort.clone();
            let grace = self.config.grace_period();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                abort.cancel();
            });
        }
    }

    async fn maybe_checkpoint(&self) {
        let interval = self.config.checkpoint_interval();
        let every = self.config.checkpoint_every_seconds();

        let due_pages = interval > 0
            && self.pages_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1 >= interval;
        let due_time = every > 0
            && self.last_checkpoint.lock().elapsed() >= Duration::from_secs(every);
        if !due_pages && !due_time {
            return;
        }

        // One checkpoint at a time; losers skip rather than queue.
        let Ok(_guard) = self.checkpoint_lock.try_lock() else {
            return;
        };
        if let Err(e) = self.checkpoint_now().await {
            warn!(error = %e, "checkpoint failed");
        }
    }

    async fn checkpoint_now(&self) -> anyhow::Result<()> {
        let snapshot = self.frontier.snapshot().await;
        let mut cursors = CursorFile {
            pages_crawled: self.metrics.total_pages(),
            ..Default::default()
        };
        for dataset in Dataset::ALL {
            let total = self.archive.writer(dataset).total_records().await;
            cursors
                .datasets
                .insert(dataset.name().to_string(), DatasetCursor { total_records: total });
        }
        let frontier_remaining = snapshot.pending.len() as u64;
        self.checkpoints.save(&snapshot, &cursors).await?;

        self.pages_since_checkpoint.store(0, Ordering::SeqCst);
        *self.last_checkpoint.lock() = Instant::now();

        self.bus
            .publish(EventPayload::CheckpointSaved {
                pages_crawled: cursors.pages_crawled,
                frontier_remaining,
            })
            .await;
        Ok(())
    }
}

/// Orchestrates one crawl. Cheap to clone; clones share the same crawl.
#[derive(Clone)]
pub struct CrawlScheduler {
    core: Arc<SchedulerCore>,
}

impl CrawlScheduler {
    /// Set up the crawl: staging, event bus, robots, governor, renderer,
    /// seeds (or resume state). Fails fast on configuration and output
    /// problems without fetching anything.
    pub async fn start(config: CrawlConfig) -> Result<Self, CrawlError> {
        let resume_staging = config.resume_staging().cloned();
        let crawl_id = match &resume_staging {
            Some(staging) => staging
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    CrawlError::Config("resume staging path has no crawl id component".into())
                })?
                .to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let bus = match EventBus::with_log_file(
            &crawl_id,
            4096,
            config.log_file_for(&crawl_id),
        )
        .await
        {
            Ok(bus) => bus,
            Err(e) => {
                warn!(error = %e, "event log file unavailable, continuing without it");
                EventBus::new(&crawl_id, 4096)
            }
        };

        let archive = match &resume_staging {
            Some(staging) => ArchiveWriter::resume(
                config.out_path().clone(),
                staging.clone(),
                config.rotation(),
                config.zstd_level(),
            )
            .await,
            None => {
                ArchiveWriter::init(
                    config.out_path().clone(),
                    &crawl_id,
                    config.rotation(),
                    config.zstd_level(),
                )
                .await
            }
        }
        .map_err(|e| CrawlError::OutputUnwritable(e.to_string()))?;

        let robots = RobotsResolver::new(
            config.respect_robots(),
            config.override_robots(),
            config.user_agent(),
        )
        .map_err(CrawlError::Other)?;
        let fetcher = RawFetcher::new(config.fetch_limits()).map_err(CrawlError::Other)?;
        let governor =
            RateGovernor::new(config.rps(), config.per_host_rps(), config.concurrency());
        let frontier = Frontier::new();
        let sampler = ParamSampler::new();

        let mut seed_origins = Vec::new();
        let mut seed_entries = Vec::new();
        for seed in config.seeds() {
            let key = urlnorm::url_key(
                seed,
                config.normalize_options(),
                config.param_policy(),
                config.param_block_list(),
                &sampler,
            );
            if let Ok(parsed) = url::Url::parse(&key) {
                let origin = parsed.origin();
                if !seed_origins.contains(&origin) {
                    seed_origins.push(origin);
                }
            }
            seed_entries.push(FrontierEntry {
                url_key: key,
                original_url: seed.clone(),
                depth: 0,
                discovered_from: None,
                discovered_in_mode: config.mode(),
            });
        }

        let checkpoints = CheckpointManager::new(archive.staging());
        if resume_staging.is_some() && checkpoints.exists() {
            let (snapshot, cursors) = checkpoints
                .load()
                .await
                .map_err(|e| CrawlError::Config(format!("unreadable checkpoint: {e}")))?;
            frontier.restore(snapshot).await;
            info!(pages = cursors.pages_crawled, "resuming from checkpoint");
        }
        // Seeds are deduplicated against the seen set, so this is a no-op
        // for keys a resumed crawl already visited.
        for entry in seed_entries {
            frontier.enqueue(entry).await;
        }

        let core = Arc::new(SchedulerCore {
            crawl_id: crawl_id.clone(),
            bus,
            metrics: Arc::new(CrawlMetrics::new()),
            frontier,
            governor,
            robots,
            archive,
            fetcher,
            renderer: tokio::sync::OnceCell::new(),
            sampler,
            cancel: CancelHandle::new(),
            abort: CancelHandle::new(),
            pause: PauseGate::new(),
            mem_pause: PauseGate::new(),
            seed_origins,
            poisoned: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            pages_dispatched: AtomicU64::new(0),
            completion: parking_lot::Mutex::new(None),
            state: parking_lot::Mutex::new(CrawlState::Starting),
            grace_armed: AtomicBool::new(false),
            checkpoints,
            checkpoint_lock: tokio::sync::Mutex::new(()),
            last_checkpoint: parking_lot::Mutex::new(Instant::now()),
            pages_since_checkpoint: AtomicU64::new(0),
            started_at: Utc::now(),
            started_instant: Instant::now(),
            config,
        });

        if core.config.mode().uses_browser() {
            let renderer = Renderer::open(
                core.config.render_limits(),
                core.config.headless(),
                core.config.user_agent(),
                None,
            )
            .await
            .map_err(CrawlError::Other)?;
            let _ = core.renderer.set(renderer);
        }

        core.bus
            .publish(EventPayload::CrawlStarted {
                seeds: core.config.seeds().to_vec(),
                mode: core.config.mode(),
                out_path: core.config.out_path().display().to_string(),
            })
            .await;

        Ok(Self { core })
    }

    #[must_use]
    pub fn crawl_id(&self) -> &str {
        &self.core.crawl_id
    }

    #[must_use]
    pub fn state(&self) -> CrawlState {
        self.core.state()
    }

    /// The crawl's event bus, for `on` / `on_with_replay` subscriptions.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.core.bus)
    }

    /// Stop new dispatches; in-flight work continues. Pending acquisitions
    /// unblock and their entries re-queue.
    pub fn pause(&self) {
        if self.core.pause.set_paused(true) {
            self.core.set_state(CrawlState::Paused);
            info!("crawl paused");
        }
    }

    pub fn resume(&self) {
        if self.core.pause.set_paused(false) {
            self.core.set_state(CrawlState::Running);
            info!("crawl resumed");
        }
    }

    /// Request a graceful shutdown (`manual` completion reason).
    pub fn shutdown(&self) {
        self.core.begin_cancel(CompletionReason::Manual);
    }

    /// Drive the crawl to completion and finalize the archive.
    ///
    /// `Ok` reports carry exit code 0, or 2 when the error budget tripped
    /// (the archive is still sealed). Fatal conditions (unwritable output,
    /// archive validation, poisoned writers) return `Err`.
    pub async fn run(&self) -> Result<CrawlReport, CrawlError> {
        let core = &self.core;
        core.set_state(CrawlState::Running);

        let memwatch = tokio::spawn(
            memory::MemoryWatcher {
                metrics: Arc::clone(&core.metrics),
                bus: Arc::clone(&core.bus),
                gate: core.mem_pause.clone(),
                max_rss_mb: core.config.max_rss_mb(),
            }
            .run(core.cancel.clone()),
        );
        let heartbeat = if core.config.quiet() {
            None
        } else {
            let hb_core = Arc::clone(core);
            Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                        _ = hb_core.cancel.cancelled() => return,
                    }
                    hb_core
                        .bus
                        .publish(EventPayload::Heartbeat {
                            metrics: hb_core.metrics.snapshot(),
                            memory_paused: hb_core.mem_pause.is_paused(),
                        })
                        .await;
                }
            }))
        };

        let mut workers = Vec::with_capacity(core.config.concurrency());
        for worker_id in 0..core.config.concurrency() {
            let worker_core = Arc::clone(core);
            workers.push(tokio::spawn(worker_loop(worker_core, worker_id)));
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task panicked");
            }
        }

        memwatch.abort();
        if let Some(task) = heartbeat {
            task.abort();
        }
        // Make sure the hard abort fires for anything still hanging.
        core.abort.cancel();

        core.set_state(CrawlState::Finalizing);
        let reason = core.completion_reason();
        let finished_at = Utc::now();
        let duration_ms = core.started_instant.elapsed().as_millis() as u64;

        if let Some(renderer) = core.renderer.get() {
            renderer.close().await;
        }

        let mut notes = Vec::new();
        let overrides = core.robots.overrides_used();
        if overrides > 0 {
            notes.push(format!("robots.txt disallow overridden {overrides} times"));
        }
        let total_errors = core.metrics.total_errors();
        if reason == CompletionReason::ErrorBudget {
            notes.push(format!(
                "error budget exceeded: {total_errors} errors > budget {}",
                core.config.error_budget()
            ));
        }
        if reason == CompletionReason::Manual {
            notes.push("graceful shutdown requested".to_string());
        }
        if core.poisoned.load(Ordering::SeqCst) {
            notes.push("a dataset writer was poisoned; output aborted".to_string());
        }

        core.bus
            .publish(EventPayload::Shutdown { reason })
            .await;

        let snapshot = core.metrics.snapshot();
        core.bus
            .publish(EventPayload::Finished {
                pages: snapshot.pages,
                edges: snapshot.edges,
                errors: snapshot.errors,
                duration_ms,
            })
            .await;

        if core.poisoned.load(Ordering::SeqCst) {
            core.archive.mark_incomplete().await;
            core.set_state(CrawlState::Failed);
            return Err(CrawlError::OutputUnwritable(
                "dataset writer poisoned after repeated I/O failure".to_string(),
            ));
        }

        let summary = ArchiveSummary {
            crawl_id: core.crawl_id.clone(),
            mode: core.config.mode(),
            seeds: core.config.seeds().to_vec(),
            pages: snapshot.pages,
            edges: snapshot.edges,
            assets: snapshot.assets,
            errors: snapshot.errors,
            accessibility_records: core
                .archive
                .writer(Dataset::Accessibility)
                .total_records()
                .await,
            bytes_written: snapshot.bytes_written,
            completion_reason: reason,
            started_at: core.started_at,
            finished_at,
            duration_ms,
            notes: notes.clone(),
        };

        let options = FinalizeOptions {
            mode: core.config.mode(),
            seeds: core.config.seeds().to_vec(),
            capabilities: Capability::for_mode(
                core.config.mode(),
                core.config.capture_subresources(),
            ),
            robots_policy: RobotsPolicyInfo {
                respect: core.config.respect_robots() && !core.config.override_robots(),
                overrides_used: overrides,
            },
            privacy_policy: core.config.privacy().clone(),
            owner: core.config.owner().to_string(),
            notes: notes.clone(),
            incomplete: false,
        };

        match core.archive.finalize(&summary, options).await {
            Ok(_manifest) => {
                core.set_state(CrawlState::Done);
                let report = CrawlReport {
                    crawl_id: core.crawl_id.clone(),
                    out_file: core.config.out_path().clone(),
                    summary,
                    perf: PerfReport {
                        metrics: snapshot,
                        bus: core.bus.metrics(),
                        blobs: core.archive.blobs().stats(),
                    },
                    notes,
                    exit_code: if reason == CompletionReason::ErrorBudget { 2 } else { 0 },
                };
                info!(
                    crawl_id = %report.crawl_id,
                    pages = report.summary.pages,
                    reason = reason.as_str(),
                    "crawl complete"
                );
                Ok(report)
            }
            Err(e) => {
                core.archive.mark_incomplete().await;
                core.set_state(CrawlState::Failed);
                match e {
                    FinalizeError::Validation(msg) => Err(CrawlError::ArchiveValidation(msg)),
                    FinalizeError::Io(e) => Err(CrawlError::OutputUnwritable(e.to_string())),
                }
            }
        }
    }
}

async fn worker_loop(core: Arc<SchedulerCore>, worker_id: usize) {
    loop {
        if core.cancel.is_cancelled() {
            break;
        }
        core.pause.wait_if_paused(&core.cancel).await;
        core.mem_pause.wait_if_paused(&core.cancel).await;
        if core.cancel.is_cancelled() {
            break;
        }

        // Stop condition: page cap. Completed pages trip the cancel;
        // reservations held by in-flight pages only park this worker, so a
        // page mid-dispatch is never yanked out from under the cap check.
        if let Some(max) = core.config.effective_max_pages() {
            if core.metrics.total_pages() >= max {
                core.begin_cancel(CompletionReason::Capped);
                break;
            }
            if core.pages_dispatched.load(Ordering::SeqCst) >= max {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                    _ = core.cancel.cancelled() => {}
                }
                continue;
            }
        }

        // (1) concurrency token.
        let Some(_permit) = core.governor.acquire_slot(&core.cancel).await else {
            break;
        };

        // (2) next frontier entry, or detect natural completion.
        core.in_flight.fetch_add(1, Ordering::SeqCst);
        let entry = 'pop: loop {
            match core.frontier.dequeue().await {
                Some(entry) => break 'pop Some(entry),
                None => {
                    let remaining = core.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                    if remaining == 0 && core.frontier.is_empty().await {
                        core.begin_cancel(CompletionReason::Finished);
                        break 'pop None;
                    }
                    tokio::select! {
                        _ = core.frontier.wait_for_work() => {}
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = core.cancel.cancelled() => break 'pop None,
                    }
                    if core.cancel.is_cancelled() {
                        break 'pop None;
                    }
                    core.in_flight.fetch_add(1, Ordering::SeqCst);
                }
            }
        };
        let Some(entry) = entry else {
            break;
        };

        // A worker parked in the pop wait can race the cap: re-check with
        // the entry in hand and put it back if the budget is spoken for.
        if let Some(max) = core.config.effective_max_pages()
            && core.pages_dispatched.load(Ordering::SeqCst) >= max
        {
            core.frontier.requeue(entry).await;
            core.in_flight.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        // Reserve the page slot up front so concurrent workers cannot
        // overshoot maxPages, then release it if no page was emitted.
        core.pages_dispatched.fetch_add(1, Ordering::SeqCst);
        let page_emitted = dispatch::process_entry(&core, entry).await;
        if !page_emitted {
            core.pages_dispatched.fetch_sub(1, Ordering::SeqCst);
        }
        core.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Post-dispatch stop conditions, ranked.
        let budget = core.config.error_budget();
        if budget > 0 && core.metrics.total_errors() > budget {
            core.begin_cancel(CompletionReason::ErrorBudget);
        }
        if let Some(max) = core.config.effective_max_pages()
            && core.metrics.total_pages() >= max
        {
            core.begin_cancel(CompletionReason::Capped);
        }
        if core.poisoned.load(Ordering::SeqCst) {
            core.begin_cancel(CompletionReason::Manual);
        }

        core.maybe_checkpoint().await;
    }
    tracing::debug!(worker_id, "worker exited");
}
