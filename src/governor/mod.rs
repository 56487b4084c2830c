//! Crawl rate governance: global RPS, per-host RPS, and the concurrency gate.
//!
//! Token buckets use fixed-point arithmetic for sub-token precision. The
//! bucket only advances its refill timestamp by the time that actually
//! produced tokens, so fractional accrual is never discarded.
//!
//! Acquisition order per dispatch is concurrency → global → per-host; all
//! three waits are cancellable.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::runtime::CancelHandle;

/// Scaling factor for fixed-point token arithmetic (1000x precision).
const TOKEN_SCALE: u64 = 1000;

/// Outcome of a non-blocking bucket probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    Deny { retry_after: Duration },
}

#[derive(Debug)]
struct BucketState {
    /// Tokens scaled by `TOKEN_SCALE`.
    tokens: u64,
    last_refill: Instant,
}

/// A single token bucket: capacity `ceil(rate)` tokens, refilled at `rate`
/// tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    max_tokens: u64,
}

impl TokenBucket {
    /// Bucket with capacity `ceil(rate)` tokens.
    #[must_use]
    pub fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec.max(1.0).ceil() as u64;
        Self::with_capacity(rate_per_sec, capacity)
    }

    /// Bucket with an explicit token capacity. A capacity of one enforces a
    /// strict minimum spacing of `1/rate` between grants, burst-free.
    #[must_use]
    pub fn with_capacity(rate_per_sec: f64, capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity * TOKEN_SCALE,
                last_refill: Instant::now(),
            }),
            rate_per_sec,
            max_tokens: capacity * TOKEN_SCALE,
        }
    }

    /// Try to consume one token; on failure report how long until one
    /// accrues.
    pub fn try_consume(&self) -> RateDecision {
        let mut state = self.state.lock();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_refill);
        let earned = (elapsed.as_secs_f64() * self.rate_per_sec * TOKEN_SCALE as f64) as u64;
        if earned > 0 {
            state.tokens = state.tokens.saturating_add(earned).min(self.max_tokens);
            // Advance only by the time those tokens cost, preserving the
            // fractional remainder.
            let credited =
                Duration::from_secs_f64(earned as f64 / (self.rate_per_sec * TOKEN_SCALE as f64));
            state.last_refill += credited;
            if state.tokens == self.max_tokens {
                state.last_refill = now;
            }
        }

        if state.tokens >= TOKEN_SCALE {
            state.tokens -= TOKEN_SCALE;
            RateDecision::Allow
        } else {
            let deficit = TOKEN_SCALE - state.tokens;
            let wait = deficit as f64 / (self.rate_per_sec * TOKEN_SCALE as f64);
            RateDecision::Deny { retry_after: Duration::from_secs_f64(wait.max(0.001)) }
        }
    }

    /// Consume one token, sleeping as needed. Returns false if cancelled.
    pub async fn acquire(&self, cancel: &CancelHandle) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.try_consume() {
                RateDecision::Allow => return true,
                RateDecision::Deny { retry_after } => {
                    tokio::select! {
                        _ = tokio::time::sleep(retry_after) => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }
}

/// The crawl's coupled rate gates.
pub struct RateGovernor {
    global: TokenBucket,
    per_host: DashMap<String, Arc<TokenBucket>>,
    per_host_rps: f64,
    concurrency: Arc<Semaphore>,
}

impl RateGovernor {
    #[must_use]
    pub fn new(rps: f64, per_host_rps: f64, concurrency: usize) -> Self {
        Self {
            global: TokenBucket::new(rps),
            per_host: DashMap::new(),
            per_host_rps,
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Step 1 of dispatch: bound the number of in-flight pages. The permit
    /// is held for the whole page lifecycle and released on drop regardless
    /// of outcome.
    pub async fn acquire_slot(&self, cancel: &CancelHandle) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.concurrency).acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        }
    }

    /// Steps 2 and 3 of dispatch: global bucket, then the host's bucket.
    /// Returns false if cancelled mid-wait.
    ///
    /// Host buckets are clamped to one token so consecutive fetches to a
    /// host are always spaced by at least `1/perHostRps`, including the
    /// first pair after the bucket is created or after idle time.
    pub async fn acquire_rate(&self, host: &str, cancel: &CancelHandle) -> bool {
        if !self.global.acquire(cancel).await {
            return false;
        }
        let bucket = Arc::clone(
            self.per_host
                .entry(host.to_lowercase())
                .or_insert_with(|| Arc::new(TokenBucket::with_capacity(self.per_host_rps, 1)))
                .value(),
        );
        bucket.acquire(cancel).await
    }

    /// Number of hosts with an active bucket.
    #[must_use]
    pub fn tracked_hosts(&self) -> usize {
        self.per_host.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full_then_denies() {
        let bucket = TokenBucket::new(2.0);
        assert_eq!(bucket.try_consume(), RateDecision::Allow);
        assert_eq!(bucket.try_consume(), RateDecision::Allow);
        assert!(matches!(bucket.try_consume(), RateDecision::Deny { .. }));
    }

    #[test]
    fn retry_after_reflects_rate() {
        let bucket = TokenBucket::new(10.0);
        for _ in 0..10 {
            assert_eq!(bucket.try_consume(), RateDecision::Allow);
        }
        match bucket.try_consume() {
            RateDecision::Deny { retry_after } => {
                assert!(retry_after <= Duration::from_millis(110), "{retry_after:?}");
            }
            RateDecision::Allow => panic!("bucket should be empty"),
        }
    }

    #[tokio::test]
    async fn acquisition_is_cancellable() {
        let bucket = TokenBucket::new(0.1);
        let cancel = CancelHandle::new();
        // Drain the single capacity token.
        assert_eq!(bucket.try_consume(), RateDecision::Allow);
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let start = Instant::now();
        assert!(!bucket.acquire(&cancel).await);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn per_host_spacing_holds() {
        let governor = RateGovernor::new(100.0, 4.0, 8);
        let cancel = CancelHandle::new();

        let mut stamps = Vec::new();
        for _ in 0..5 {
            assert!(governor.acquire_rate("example.com", &cancel).await);
            stamps.push(Instant::now());
        }
        // Host buckets are burst-free: every consecutive pair respects
        // 1/perHostRps with the 10% tolerance.
        for pair in stamps.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(225), "gap {gap:?}");
        }
    }

    #[tokio::test]
    async fn hosts_are_independent() {
        let governor = RateGovernor::new(1000.0, 1.0, 8);
        let cancel = CancelHandle::new();
        assert!(governor.acquire_rate("a.test", &cancel).await);
        let start = Instant::now();
        assert!(governor.acquire_rate("b.test", &cancel).await);
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(governor.tracked_hosts(), 2);
    }
}
