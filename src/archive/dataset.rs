//! Streaming NDJSON dataset writers.
//!
//! One writer per dataset. Records append to `part-NNN.jsonl`; a part is
//! zstd-compressed and sealed with a `part-NNN.meta.json` sidecar when it
//! rotates. Writers serialize concurrent callers internally, validate every
//! record against the dataset schema, and never silently drop: an invalid
//! record is returned to the caller as a validation error.
//!
//! Write failures are retried once with backoff; a second failure poisons
//! the writer, which the scheduler escalates to a cancel with exit code 4.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::manifest::DatasetMetadata;
use super::schema;
use crate::records::Dataset;

/// Part rotation thresholds; zero disables a bound.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub max_records: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self { max_bytes: 64 * 1024 * 1024, max_records: 100_000 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("record rejected by schema: {0}")]
    Validation(String),
    #[error("dataset writer is poisoned after repeated I/O failure")]
    Poisoned,
    #[error("dataset I/O error: {0}")]
    Io(String),
}

/// Sidecar metadata for one sealed part.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartMeta {
    pub index: u32,
    pub records: u64,
    pub bytes_uncompressed: u64,
    pub bytes_compressed: u64,
    pub sha256: String,
}

#[derive(Debug, Default)]
struct WriterState {
    part_index: u32,
    file: Option<tokio::fs::File>,
    records_in_part: u64,
    bytes_in_part: u64,
    total_records: u64,
    sealed: Vec<PartMeta>,
}

pub struct DatasetWriter {
    dataset: Dataset,
    dir: PathBuf,
    state: tokio::sync::Mutex<WriterState>,
    poisoned: AtomicBool,
    rotation: RotationPolicy,
    zstd_level: i32,
}

impl DatasetWriter {
    /// Create the dataset directory and an empty writer.
    pub async fn init(
        dataset: Dataset,
        staging_root: &Path,
        rotation: RotationPolicy,
        zstd_level: i32,
    ) -> anyhow::Result<Self> {
        let dir = staging_root.join(dataset.name());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dataset,
            dir,
            state: tokio::sync::Mutex::new(WriterState::default()),
            poisoned: AtomicBool::new(false),
            rotation,
            zstd_level,
        })
    }

    /// Reopen a writer over an existing staging directory: sealed parts are
    /// inventoried, a trailing open part is repaired (truncated at its last
    /// LF) and positioned for append.
    pub async fn resume(
        dataset: Dataset,
        staging_root: &Path,
        rotation: RotationPolicy,
        zstd_level: i32,
    ) -> anyhow::Result<Self> {
        let writer = Self::init(dataset, staging_root, rotation, zstd_level).await?;
        let dir = writer.dir.clone();

        let recovered =
            tokio::task::spawn_blocking(move || recover_state(&dir)).await??;

        let mut state = writer.state.lock().await;
        *state = recovered;
        drop(state);
        Ok(writer)
    }

    #[must_use]
    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub async fn total_records(&self) -> u64 {
        self.state.lock().await.total_records
    }

    /// Validate and append one record.
    pub async fn write<T: Serialize>(&self, record: &T) -> Result<(), WriteError> {
        if self.is_poisoned() {
            return Err(WriteError::Poisoned);
        }
        let value = serde_json::to_value(record)
            .map_err(|e| WriteError::Validation(format!("unserializable record: {e}")))?;
        schema::validate(self.dataset, &value).map_err(WriteError::Validation)?;

        // serde_json escapes control characters, so the line itself can
        // never contain a raw LF.
        let mut line = serde_json::to_string(&value)
            .map_err(|e| WriteError::Validation(format!("unserializable record: {e}")))?;
        line.push('\n');

        let mut state = self.state.lock().await;
        match self.append_line(&mut state, line.as_bytes()).await {
            Ok(()) => {}
            Err(first) => {
                warn!(
                    dataset = %self.dataset,
                    error = %first,
                    "dataset write failed, retrying once"
                );
                tokio::time::sleep(Duration::from_millis(250)).await;
                // Reopen the part in case the file handle itself went bad.
                state.file = None;
                if let Err(second) = self.append_line(&mut state, line.as_bytes()).await {
                    self.poisoned.store(true, Ordering::SeqCst);
                    warn!(dataset = %self.dataset, error = %second, "dataset writer poisoned");
                    return Err(WriteError::Poisoned);
                }
            }
        }

        state.records_in_part += 1;
        state.total_records += 1;
        state.bytes_in_part += line.len() as u64;

        let over_bytes =
            self.rotation.max_bytes > 0 && state.bytes_in_part >= self.rotation.max_bytes;
        let over_records =
            self.rotation.max_records > 0 && state.records_in_part >= self.rotation.max_records;
        if over_bytes || over_records {
            self.rotate_locked(&mut state)
                .await
                .map_err(|e| WriteError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Seal the current part regardless of thresholds.
    pub async fn rotate(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.rotate_locked(&mut state).await
    }

    /// Flush, seal the open part, and summarize the dataset for the
    /// manifest.
    pub async fn finalize(&self) -> anyhow::Result<DatasetMetadata> {
        let mut state = self.state.lock().await;
        self.rotate_locked(&mut state).await?;

        let present = !state.sealed.is_empty();
        let bytes_compressed: u64 = state.sealed.iter().map(|p| p.bytes_compressed).sum();
        // Dataset hash: SHA-256 over the concatenated part digests, stable
        // across part boundaries.
        let hash_sha256 = if present {
            let mut hasher = Sha256::new();
            for part in &state.sealed {
                hasher.update(part.sha256.as_bytes());
            }
            hex::encode(hasher.finalize())
        } else {
            String::new()
        };

        Ok(DatasetMetadata {
            present,
            parts: state.sealed.len() as u32,
            record_count: state.total_records,
            bytes_compressed,
            hash_sha256,
            schema_uri: self.dataset.schema_uri(),
        })
    }

    async fn append_line(&self, state: &mut WriterState, bytes: &[u8]) -> anyhow::Result<()> {
        if state.file.is_none() {
            let path = self.part_path(state.part_index, "jsonl");
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            state.file = Some(file);
        }
        match state.file.as_mut() {
            Some(file) => file.write_all(bytes).await?,
            None => anyhow::bail!("part file unavailable"),
        }
        Ok(())
    }

    async fn rotate_locked(&self, state: &mut WriterState) -> anyhow::Result<()> {
        if state.records_in_part == 0 {
            state.file = None;
            return Ok(());
        }
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let index = state.part_index;
        let plain = self.part_path(index, "jsonl");
        let compressed = self.part_path(index, "jsonl.zst");
        let level = self.zstd_level;

        let (bytes_uncompressed, bytes_compressed, sha256) =
            tokio::task::spawn_blocking(move || seal_part(&plain, &compressed, level))
                .await??;

        let meta = PartMeta {
            index,
            records: state.records_in_part,
            bytes_uncompressed,
            bytes_compressed,
            sha256,
        };
        let meta_path = self.dir.join(format!("part-{index:03}.meta.json"));
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?).await?;

        debug!(
            dataset = %self.dataset,
            part = index,
            records = meta.records,
            "sealed dataset part"
        );

        state.sealed.push(meta);
        state.part_index += 1;
        state.records_in_part = 0;
        state.bytes_in_part = 0;
        Ok(())
    }

    fn part_path(&self, index: u32, ext: &str) -> PathBuf {
        self.dir.join(format!("part-{index:03}.{ext}"))
    }
}

/// Compress a sealed part, fsync it, delete the plain file, and report
/// `(uncompressed, compressed, sha256)`.
fn seal_part(plain: &Path, compressed: &Path, level: i32) -> anyhow::Result<(u64, u64, String)> {
    let input = std::fs::read(plain)?;
    let payload = zstd::bulk::compress(&input, level)?;

    let parent = compressed
        .parent()
        .ok_or_else(|| anyhow::anyhow!("part path has no parent"))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(&payload)?;
    temp.as_file().sync_all()?;
    temp.persist(compressed)?;

    std::fs::remove_file(plain)?;
    let digest = hex::encode(Sha256::digest(&payload));
    Ok((input.len() as u64, payload.len() as u64, digest))
}

/// Rebuild writer state from a staging directory (resume).
fn recover_state(dir: &Path) -> anyhow::Result<WriterState> {
    let mut state = WriterState::default();
    let mut open_parts: Vec<(u32, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(index) = part_index_of(name, ".jsonl.zst") {
            let meta_path = dir.join(format!("part-{index:03}.meta.json"));
            let meta: PartMeta = if meta_path.exists() {
                serde_json::from_slice(&std::fs::read(&meta_path)?)?
            } else {
                // Sidecar lost; rebuild it from the sealed part.
                let payload = std::fs::read(&path)?;
                let decoded = zstd::stream::decode_all(payload.as_slice())?;
                let records = decoded.iter().filter(|b| **b == b'\n').count() as u64;
                let meta = PartMeta {
                    index,
                    records,
                    bytes_uncompressed: decoded.len() as u64,
                    bytes_compressed: payload.len() as u64,
                    sha256: hex::encode(Sha256::digest(&payload)),
                };
                std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;
                meta
            };
            state.total_records += meta.records;
            state.sealed.push(meta);
        } else if let Some(index) = part_index_of(name, ".jsonl") {
            open_parts.push((index, path));
        }
    }

    state.sealed.sort_by_key(|p| p.index);
    let max_sealed = state.sealed.last().map(|p| p.index);

    // At most one open part can exist; repair it and continue appending.
    open_parts.sort_by_key(|(i, _)| *i);
    if let Some((index, path)) = open_parts.pop() {
        let (records, bytes) = repair_part(&path)?;
        state.part_index = index;
        state.records_in_part = records;
        state.bytes_in_part = bytes;
        state.total_records += records;
    } else {
        state.part_index = max_sealed.map_or(0, |i| i + 1);
    }
    Ok(state)
}

/// Truncate a plain part after its last LF, dropping any torn trailing
/// line, and count what survives.
pub fn repair_part(path: &Path) -> anyhow::Result<(u64, u64)> {
    let content = std::fs::read(path)?;
    let keep = match content.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    if keep != content.len() {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(keep as u64)?;
        file.sync_all()?;
    }
    let records = content[..keep].iter().filter(|b| **b == b'\n').count() as u64;
    Ok((records, keep as u64))
}

fn part_index_of(name: &str, suffix: &str) -> Option<u32> {
    let stem = name.strip_suffix(suffix)?;
    let digits = stem.strip_prefix("part-")?;
    // Avoid matching "part-000.meta" against the ".jsonl" arm.
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Lazily iterate the records of one part file (plain or sealed).
pub fn read_part_file(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read(path)?;
    let bytes = if path.extension().is_some_and(|e| e == "zst") {
        zstd::stream::decode_all(raw.as_slice())?
    } else {
        raw
    };
    let mut records = Vec::new();
    for line in bytes.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Sorted part files of one dataset directory, sealed and open.
pub fn part_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut parts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if part_index_of(name, ".jsonl.zst").is_some() || part_index_of(name, ".jsonl").is_some() {
            parts.push(path);
        }
    }
    parts.sort();
    Ok(parts)
}
