use siteatlas::governor::RateGovernor;
use siteatlas::runtime::CancelHandle;
use std::time::{Duration, Instant};

/// Invariant: two consecutive acquisitions for one host are spaced by at
/// least 0.9 / perHostRps once the initial burst capacity is spent.
#[tokio::test]
async fn per_host_spacing_meets_the_contract() {
    let per_host_rps = 2.0;
    let governor = RateGovernor::new(100.0, per_host_rps, 8);
    let cancel = CancelHandle::new();

    let mut stamps = Vec::new();
    for _ in 0..6 {
        assert!(governor.acquire_rate("spacing.test", &cancel).await);
        stamps.push(Instant::now());
    }

    let min_gap = Duration::from_secs_f64(0.9 / per_host_rps);
    for pair in stamps.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= min_gap, "gap {gap:?} under contract {min_gap:?}");
    }
}

#[tokio::test]
async fn global_bucket_throttles_across_hosts() {
    let governor = RateGovernor::new(4.0, 100.0, 8);
    let cancel = CancelHandle::new();

    let start = Instant::now();
    for i in 0..8 {
        let host = format!("host-{i}.test");
        assert!(governor.acquire_rate(&host, &cancel).await);
    }
    // 8 acquisitions at 4 rps with a burst of 4 needs about a second.
    assert!(start.elapsed() >= Duration::from_millis(800));
}

#[tokio::test]
async fn concurrency_slots_bound_in_flight_pages() {
    let governor = RateGovernor::new(1000.0, 1000.0, 2);
    let cancel = CancelHandle::new();

    let first = governor.acquire_slot(&cancel).await.unwrap();
    let _second = governor.acquire_slot(&cancel).await.unwrap();

    // Third slot only frees up when a permit drops.
    let pending = tokio::time::timeout(Duration::from_millis(100), governor.acquire_slot(&cancel));
    assert!(pending.await.is_err(), "third slot should still be blocked");

    drop(first);
    tokio::time::timeout(Duration::from_secs(1), governor.acquire_slot(&cancel))
        .await
        .expect("slot freed")
        .unwrap();
}

#[tokio::test]
async fn cancellation_unblocks_rate_waits() {
    let governor = RateGovernor::new(0.2, 0.2, 1);
    let cancel = CancelHandle::new();
    // Drain the single token.
    assert!(governor.acquire_rate("slow.test", &cancel).await);

    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.cancel();
    });
    let start = Instant::now();
    assert!(!governor.acquire_rate("slow.test", &cancel).await);
    assert!(start.elapsed() < Duration::from_secs(2));
}
