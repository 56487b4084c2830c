//! The BFS frontier: pending queue plus the crawl-lifetime seen set.
//!
//! One mutex guards both structures so a seen-set check and the matching
//! enqueue are atomic. A URL key enters the queue at most once per crawl;
//! if a pending entry is rediscovered at a lower depth the depth is
//! lowered in place while the first discovery's provenance is kept.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::records::RenderMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierEntry {
    pub url_key: String,
    pub original_url: String,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered_from: Option<String>,
    pub discovered_in_mode: RenderMode,
}

#[derive(Debug, Default)]
struct FrontierState {
    queue: VecDeque<String>,
    pending: HashMap<String, FrontierEntry>,
    seen: HashSet<String>,
}

/// Serializable snapshot for checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierSnapshot {
    pub pending: Vec<FrontierEntry>,
    pub seen: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Frontier {
    state: Mutex<FrontierState>,
    work_available: Notify,
}

impl Frontier {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue an entry. Returns true when the URL key was newly added;
    /// false when it was seen before (in which case only a pending entry's
    /// depth may be lowered).
    pub async fn enqueue(&self, entry: FrontierEntry) -> bool {
        let mut state = self.state.lock().await;
        if state.seen.contains(&entry.url_key) {
            // Minimum depth wins; provenance of the first discovery stays.
            if let Some(pending) = state.pending.get_mut(&entry.url_key)
                && entry.depth < pending.depth
            {
                pending.depth = entry.depth;
            }
            return false;
        }
        state.seen.insert(entry.url_key.clone());
        state.queue.push_back(entry.url_key.clone());
        state.pending.insert(entry.url_key.clone(), entry);
        drop(state);
        self.work_available.notify_one();
        true
    }

    /// Put a dequeued entry back (cancelled mid-acquisition) so a later
    /// checkpoint still covers it. The key is already in the seen set.
    pub async fn requeue(&self, entry: FrontierEntry) {
        let mut state = self.state.lock().await;
        state.seen.insert(entry.url_key.clone());
        state.queue.push_front(entry.url_key.clone());
        state.pending.insert(entry.url_key.clone(), entry);
        drop(state);
        self.work_available.notify_one();
    }

    pub async fn dequeue(&self) -> Option<FrontierEntry> {
        let mut state = self.state.lock().await;
        while let Some(key) = state.queue.pop_front() {
            if let Some(entry) = state.pending.remove(&key) {
                return Some(entry);
            }
        }
        None
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    pub async fn seen_count(&self) -> usize {
        self.state.lock().await.seen.len()
    }

    /// Park until an enqueue happens. Used with a timeout by idle workers.
    pub async fn wait_for_work(&self) {
        self.work_available.notified().await;
    }

    /// Wake all parked workers (shutdown path).
    pub fn wake_all(&self) {
        self.work_available.notify_waiters();
    }

    /// Consistent snapshot of pending entries and the seen set.
    pub async fn snapshot(&self) -> FrontierSnapshot {
        let state = self.state.lock().await;
        let pending = state
            .queue
            .iter()
            .filter_map(|key| state.pending.get(key).cloned())
            .collect();
        let mut seen: Vec<String> = state.seen.iter().cloned().collect();
        seen.sort();
        FrontierSnapshot { pending, seen }
    }

    /// Restore from a checkpoint snapshot; replaces current state.
    pub async fn restore(&self, snapshot: FrontierSnapshot) {
        let mut state = self.state.lock().await;
        state.queue.clear();
        state.pending.clear();
        state.seen = snapshot.seen.into_iter().collect();
        for entry in snapshot.pending {
            state.seen.insert(entry.url_key.clone());
            state.queue.push_back(entry.url_key.clone());
            state.pending.insert(entry.url_key.clone(), entry);
        }
        drop(state);
        self.work_available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, depth: u32) -> FrontierEntry {
        FrontierEntry {
            url_key: key.to_string(),
            original_url: key.to_string(),
            depth,
            discovered_from: None,
            discovered_in_mode: RenderMode::Raw,
        }
    }

    #[tokio::test]
    async fn enqueue_is_once_per_key() {
        let frontier = Frontier::new();
        assert!(frontier.enqueue(entry("https://a/", 0)).await);
        assert!(!frontier.enqueue(entry("https://a/", 1)).await);
        assert_eq!(frontier.len().await, 1);
        // Even after dequeue the key stays seen.
        assert!(frontier.dequeue().await.is_some());
        assert!(!frontier.enqueue(entry("https://a/", 0)).await);
        assert!(frontier.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn minimum_depth_wins_for_pending_entries() {
        let frontier = Frontier::new();
        let mut first = entry("https://a/", 3);
        first.discovered_from = Some("https://root/".to_string());
        frontier.enqueue(first).await;
        frontier.enqueue(entry("https://a/", 1)).await;
        let got = frontier.dequeue().await.unwrap();
        assert_eq!(got.depth, 1);
        // Provenance of the first discovery survives the depth update.
        assert_eq!(got.discovered_from.as_deref(), Some("https://root/"));
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let frontier = Frontier::new();
        for i in 0..5 {
            frontier.enqueue(entry(&format!("https://a/{i}"), 0)).await;
        }
        for i in 0..5 {
            assert_eq!(
                frontier.dequeue().await.unwrap().url_key,
                format!("https://a/{i}")
            );
        }
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let frontier = Frontier::new();
        frontier.enqueue(entry("https://a/", 0)).await;
        frontier.enqueue(entry("https://b/", 1)).await;
        frontier.dequeue().await.unwrap();

        let snapshot = frontier.snapshot().await;
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.seen.len(), 2);

        let restored = Frontier::new();
        restored.restore(snapshot).await;
        assert_eq!(restored.len().await, 1);
        // A key consumed before the snapshot stays deduplicated after restore.
        assert!(!restored.enqueue(entry("https://a/", 0)).await);
    }
}
