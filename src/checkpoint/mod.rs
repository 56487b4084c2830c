//! Durable crawl checkpoints and the resume path.
//!
//! A checkpoint is three JSON files in staging: `frontier.json` (pending
//! entries), `seen.json` (URL keys), and `cursors.json` (per-dataset
//! record counts used as a cross-check). All three are written atomically
//! via temp-file + rename. Dataset part repair itself lives with the
//! writers; resume here only restores frontier state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::frontier::{FrontierEntry, FrontierSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetCursor {
    pub total_records: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorFile {
    pub pages_crawled: u64,
    pub datasets: BTreeMap<String, DatasetCursor>,
}

pub struct CheckpointManager {
    staging: PathBuf,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(staging: &Path) -> Self {
        Self { staging: staging.to_path_buf() }
    }

    /// Persist a frontier snapshot and dataset cursors.
    pub async fn save(
        &self,
        snapshot: &FrontierSnapshot,
        cursors: &CursorFile,
    ) -> anyhow::Result<()> {
        let staging = self.staging.clone();
        let frontier_json = serde_json::to_vec(&snapshot.pending)?;
        let seen_json = serde_json::to_vec(&snapshot.seen)?;
        let cursors_json = serde_json::to_vec(cursors)?;

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            write_atomic(&staging.join("frontier.json"), &frontier_json)?;
            write_atomic(&staging.join("seen.json"), &seen_json)?;
            write_atomic(&staging.join("cursors.json"), &cursors_json)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Load the latest checkpoint from a staging directory.
    pub async fn load(&self) -> anyhow::Result<(FrontierSnapshot, CursorFile)> {
        let pending: Vec<FrontierEntry> =
            serde_json::from_slice(&tokio::fs::read(self.staging.join("frontier.json")).await?)?;
        let seen: Vec<String> =
            serde_json::from_slice(&tokio::fs::read(self.staging.join("seen.json")).await?)?;
        let cursors: CursorFile = match tokio::fs::read(self.staging.join("cursors.json")).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            // Older checkpoints without cursors still resume.
            Err(_) => CursorFile::default(),
        };
        info!(
            pending = pending.len(),
            seen = seen.len(),
            "loaded checkpoint"
        );
        Ok((FrontierSnapshot { pending, seen }, cursors))
    }

    /// Whether the staging directory contains a resumable checkpoint.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.staging.join("frontier.json").exists() && self.staging.join("seen.json").exists()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("checkpoint path has no parent"))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RenderMode;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        assert!(!manager.exists());

        let snapshot = FrontierSnapshot {
            pending: vec![FrontierEntry {
                url_key: "https://a/".to_string(),
                original_url: "https://a/".to_string(),
                depth: 2,
                discovered_from: Some("https://root/".to_string()),
                discovered_in_mode: RenderMode::Raw,
            }],
            seen: vec!["https://a/".to_string(), "https://root/".to_string()],
        };
        let mut cursors = CursorFile { pages_crawled: 1, ..Default::default() };
        cursors
            .datasets
            .insert("pages".to_string(), DatasetCursor { total_records: 1 });

        manager.save(&snapshot, &cursors).await.unwrap();
        assert!(manager.exists());

        let (loaded, loaded_cursors) = manager.load().await.unwrap();
        assert_eq!(loaded.pending.len(), 1);
        assert_eq!(loaded.pending[0].depth, 2);
        assert_eq!(loaded.seen.len(), 2);
        assert_eq!(loaded_cursors.pages_crawled, 1);
        assert_eq!(loaded_cursors.datasets["pages"].total_records, 1);
    }

    #[tokio::test]
    async fn checkpoints_overwrite_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        for round in 0..3u64 {
            let snapshot = FrontierSnapshot { pending: vec![], seen: vec![format!("k{round}")] };
            let cursors = CursorFile { pages_crawled: round, ..Default::default() };
            manager.save(&snapshot, &cursors).await.unwrap();
        }
        let (snapshot, cursors) = manager.load().await.unwrap();
        assert_eq!(snapshot.seen, vec!["k2"]);
        assert_eq!(cursors.pages_crawled, 2);
    }
}
