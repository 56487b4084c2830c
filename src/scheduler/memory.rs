//! Soft RSS ceiling: monitors the process and pauses dispatch while memory
//! is above the configured ceiling, resuming below the low-water mark.

use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{info, warn};

use crate::events::{CrawlMetrics, EventBus, EventPayload};
use crate::runtime::{CancelHandle, PauseGate};

/// Resume dispatch once RSS drops below this fraction of the ceiling.
const LOW_WATER_FRACTION: f64 = 0.9;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct MemoryWatcher {
    pub metrics: Arc<CrawlMetrics>,
    pub bus: Arc<EventBus>,
    pub gate: PauseGate,
    pub max_rss_mb: u64,
}

impl MemoryWatcher {
    /// Poll RSS until cancelled. With a zero ceiling only the metrics gauge
    /// is maintained.
    pub async fn run(self, cancel: CancelHandle) {
        let Ok(pid) = sysinfo::get_current_pid() else {
            warn!("cannot determine own pid; memory governor disabled");
            return;
        };
        let mut system = System::new();

        loop {
            if cancel.is_cancelled() {
                return;
            }
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            let rss_mb = system
                .process(pid)
                .map(|p| p.memory() / (1024 * 1024))
                .unwrap_or(0);
            self.metrics.set_rss_mb(rss_mb);

            if self.max_rss_mb > 0 {
                let low_water = (self.max_rss_mb as f64 * LOW_WATER_FRACTION) as u64;
                if rss_mb > self.max_rss_mb && !self.gate.is_paused() {
                    self.gate.set_paused(true);
                    info!(rss_mb, ceiling = self.max_rss_mb, "memory ceiling hit, pausing dispatch");
                    self.emit(true).await;
                } else if rss_mb < low_water && self.gate.is_paused() {
                    self.gate.set_paused(false);
                    info!(rss_mb, "memory pressure cleared, resuming dispatch");
                    self.emit(false).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn emit(&self, memory_paused: bool) {
        self.bus
            .publish(EventPayload::Heartbeat {
                metrics: self.metrics.snapshot(),
                memory_paused,
            })
            .await;
    }
}
