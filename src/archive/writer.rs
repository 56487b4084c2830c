//! The archive writer: staging directory lifecycle, manifest assembly, and
//! atomic finalization into the single ZIP-based atlas file.
//!
//! Staging lives at `<out>.staging/<crawlId>/` next to the output path. On
//! finalize the tree is hashed, described by `manifest.json`, packed member
//! by member (already-compressed members stored, JSON deflated), verified,
//! and renamed into place. If the crawl was incomplete the staging tree is
//! left behind for resume.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::blob_store::BlobStore;
use super::dataset::{DatasetWriter, RotationPolicy};
use super::manifest::{
    ArchiveSummary, Capability, FORMAT_VERSION, GENERATOR, ATLAS_VERSION, Integrity, Manifest,
    PrivacyPolicy, RobotsPolicyInfo, StorageParams,
};
use super::schema;
use crate::records::{Dataset, RenderMode};

/// Checkpoint artifacts that live in staging but are not archive members.
const STAGING_ONLY: &[&str] = &["frontier.json", "seen.json", "cursors.json"];

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("archive validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Everything the manifest needs that the writer does not know itself.
pub struct FinalizeOptions {
    pub mode: RenderMode,
    pub seeds: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub robots_policy: RobotsPolicyInfo,
    pub privacy_policy: PrivacyPolicy,
    pub owner: String,
    pub notes: Vec<String>,
    pub incomplete: bool,
}

pub struct ArchiveWriter {
    crawl_id: String,
    out_path: PathBuf,
    staging: PathBuf,
    writers: HashMap<Dataset, Arc<DatasetWriter>>,
    blobs: Arc<BlobStore>,
    zstd_level: i32,
}

impl ArchiveWriter {
    /// Create a fresh staging tree for a new crawl.
    pub async fn init(
        out_path: PathBuf,
        crawl_id: &str,
        rotation: RotationPolicy,
        zstd_level: i32,
    ) -> anyhow::Result<Self> {
        let staging = staging_root(&out_path).join(crawl_id);
        tokio::fs::create_dir_all(&staging).await?;

        let mut writers = HashMap::new();
        for dataset in Dataset::ALL {
            let writer = DatasetWriter::init(dataset, &staging, rotation, zstd_level).await?;
            writers.insert(dataset, Arc::new(writer));
        }
        let blobs = Arc::new(BlobStore::open(staging.join("blobs"), zstd_level).await?);

        let schemas_dir = staging.join("schemas");
        tokio::fs::create_dir_all(&schemas_dir).await?;
        for dataset in Dataset::ALL {
            let doc = schema::schema_document(dataset);
            let path = schemas_dir.join(format!("{}.schema.json", dataset.name()));
            tokio::fs::write(&path, serde_json::to_vec_pretty(&doc)?).await?;
        }

        info!(crawl_id, staging = %staging.display(), "archive staging initialized");
        Ok(Self {
            crawl_id: crawl_id.to_string(),
            out_path,
            staging,
            writers,
            blobs,
            zstd_level,
        })
    }

    /// Reattach to an interrupted crawl's staging tree.
    pub async fn resume(
        out_path: PathBuf,
        staging: PathBuf,
        rotation: RotationPolicy,
        zstd_level: i32,
    ) -> anyhow::Result<Self> {
        let crawl_id = staging
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("staging path has no crawl id component"))?
            .to_string();

        let mut writers = HashMap::new();
        for dataset in Dataset::ALL {
            let writer = DatasetWriter::resume(dataset, &staging, rotation, zstd_level).await?;
            writers.insert(dataset, Arc::new(writer));
        }
        let blobs = Arc::new(BlobStore::open(staging.join("blobs"), zstd_level).await?);

        info!(crawl_id, staging = %staging.display(), "archive staging resumed");
        Ok(Self { crawl_id, out_path, staging, writers, blobs, zstd_level })
    }

    #[must_use]
    pub fn crawl_id(&self) -> &str {
        &self.crawl_id
    }

    #[must_use]
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    #[must_use]
    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    #[must_use]
    pub fn writer(&self, dataset: Dataset) -> Arc<DatasetWriter> {
        Arc::clone(&self.writers[&dataset])
    }

    #[must_use]
    pub fn blobs(&self) -> Arc<BlobStore> {
        Arc::clone(&self.blobs)
    }

    #[must_use]
    pub fn any_poisoned(&self) -> bool {
        self.writers.values().any(|w| w.is_poisoned())
    }

    /// Mark the staging manifest incomplete so a later resume knows
    /// finalization did not finish. Best-effort; missing manifests are
    /// fine (the crawl never reached finalize).
    pub async fn mark_incomplete(&self) {
        let path = self.staging.join("manifest.json");
        let Ok(bytes) = tokio::fs::read(&path).await else {
            return;
        };
        let Ok(mut manifest) = serde_json::from_slice::<Manifest>(&bytes) else {
            return;
        };
        manifest.incomplete = true;
        if let Ok(serialized) = serde_json::to_vec_pretty(&manifest) {
            let _ = tokio::fs::write(&path, serialized).await;
        }
    }

    /// Seal every dataset, build the manifest, pack, verify, and atomically
    /// move the archive into place. When `options.incomplete` the staging
    /// tree survives for a later resume.
    pub async fn finalize(
        &self,
        summary: &ArchiveSummary,
        options: FinalizeOptions,
    ) -> Result<Manifest, FinalizeError> {
        // 1. Flush and close every dataset writer.
        let mut datasets = BTreeMap::new();
        for dataset in Dataset::ALL {
            let metadata = self.writers[&dataset]
                .finalize()
                .await
                .map_err(FinalizeError::Io)?;
            datasets.insert(dataset.name().to_string(), metadata);
        }

        tokio::fs::write(
            self.staging.join("summary.json"),
            serde_json::to_vec_pretty(summary).map_err(|e| FinalizeError::Io(e.into()))?,
        )
        .await
        .map_err(|e| FinalizeError::Io(e.into()))?;

        // 2. Hash every member-to-be. The manifest cannot embed its own
        // hash, so it is excluded and written afterwards.
        let staging = self.staging.clone();
        let mut integrity = Integrity::default();
        let members = tokio::task::spawn_blocking(move || collect_members(&staging))
            .await
            .map_err(|e| FinalizeError::Io(e.into()))?
            .map_err(FinalizeError::Io)?;
        for (rel, digest) in &members {
            integrity.files.insert(rel.clone(), digest.clone());
        }

        // 3. Build the manifest.
        let manifest = Manifest {
            atlas_version: ATLAS_VERSION.to_string(),
            format_version: FORMAT_VERSION.to_string(),
            created_at: chrono::Utc::now(),
            generator: GENERATOR.to_string(),
            owner: options.owner,
            mode: options.mode,
            seeds: options.seeds,
            datasets,
            storage: StorageParams::zstd(self.zstd_level),
            robots_policy: options.robots_policy,
            privacy_policy: options.privacy_policy,
            capabilities: options.capabilities,
            integrity,
            incomplete: options.incomplete,
            notes: options.notes,
        };

        // 4. Write manifest.json (and the summary is already on disk).
        tokio::fs::write(
            self.staging.join("manifest.json"),
            serde_json::to_vec_pretty(&manifest).map_err(|e| FinalizeError::Io(e.into()))?,
        )
        .await
        .map_err(|e| FinalizeError::Io(e.into()))?;

        // 5. Pack the staging tree into the container.
        let staging = self.staging.clone();
        let out_path = self.out_path.clone();
        let packed_members = tokio::task::spawn_blocking(move || pack_archive(&staging, &out_path))
            .await
            .map_err(|e| FinalizeError::Io(e.into()))?
            .map_err(FinalizeError::Io)?;

        // Verify the container before moving it into place.
        let mut expected: Vec<String> =
            members.iter().map(|(rel, _)| rel.clone()).collect();
        expected.push("manifest.json".to_string());
        expected.sort();
        let mut actual = packed_members;
        actual.sort();
        if expected != actual {
            return Err(FinalizeError::Validation(format!(
                "archive member mismatch: expected {} members, packed {}",
                expected.len(),
                actual.len()
            )));
        }

        // 6. Atomic rename into place; keep staging only for resume.
        let temp = temp_archive_path(&self.out_path);
        let out = self.out_path.clone();
        tokio::task::spawn_blocking(move || std::fs::rename(&temp, &out))
            .await
            .map_err(|e| FinalizeError::Io(e.into()))?
            .map_err(|e| FinalizeError::Io(e.into()))?;

        if !options.incomplete {
            let staging = self.staging.clone();
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                debug!(error = %e, "staging cleanup failed, leaving directory behind");
            } else if let Some(root) = staging.parent() {
                // Remove the `.staging` root too once its last crawl is gone.
                let _ = tokio::fs::remove_dir(root).await;
            }
        }

        info!(out = %self.out_path.display(), "atlas archive sealed");
        Ok(manifest)
    }
}

#[must_use]
pub fn staging_root(out_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.staging", out_path.display()))
}

fn temp_archive_path(out_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", out_path.display()))
}

/// Whether a member is already compressed and should be stored verbatim.
fn is_precompressed(name: &str) -> bool {
    name.ends_with(".zst") || name.ends_with(".png") || name.ends_with(".jpg")
        || name.ends_with(".jpeg")
}

fn is_staging_only(rel: &str) -> bool {
    STAGING_ONLY.contains(&rel) || rel.ends_with(".tmp")
}

/// Walk the staging tree, returning `(relative path, sha256)` for every
/// archive member except `manifest.json`.
fn collect_members(staging: &Path) -> anyhow::Result<Vec<(String, String)>> {
    use sha2::{Digest, Sha256};
    let mut members = Vec::new();
    for path in walk_files(staging)? {
        let rel = path
            .strip_prefix(staging)?
            .to_string_lossy()
            .replace('\\', "/");
        if is_staging_only(&rel) || rel == "manifest.json" {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        members.push((rel, hex::encode(Sha256::digest(&bytes))));
    }
    members.sort();
    Ok(members)
}

/// Pack staging into `<out>.tmp`, storing pre-compressed members and
/// deflating the rest. Returns the packed member names.
fn pack_archive(staging: &Path, out_path: &Path) -> anyhow::Result<Vec<String>> {
    let temp = temp_archive_path(out_path);
    if let Some(parent) = out_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(&temp)?;
    let mut zip = zip::ZipWriter::new(file);
    let mut packed = Vec::new();

    for path in walk_files(staging)? {
        let rel = path
            .strip_prefix(staging)?
            .to_string_lossy()
            .replace('\\', "/");
        if is_staging_only(&rel) {
            continue;
        }
        let method = if is_precompressed(&rel) {
            zip::CompressionMethod::Stored
        } else {
            zip::CompressionMethod::Deflated
        };
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(method)
            .large_file(true);
        zip.start_file(rel.clone(), options)?;
        let mut reader = std::fs::File::open(&path)?;
        std::io::copy(&mut reader, &mut zip)?;
        packed.push(rel);
    }
    let mut file = zip.finish()?;
    file.flush()?;
    file.sync_all()?;

    // Re-open to confirm the container is readable before the rename.
    let file = std::fs::File::open(&temp)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut verified = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        let mut sink = std::io::sink();
        std::io::copy(&mut member, &mut sink)?;
        verified.push(member.name().to_string());
    }
    drop(archive);

    if verified.len() != packed.len() {
        anyhow::bail!("packed {} members but container holds {}", packed.len(), verified.len());
    }
    Ok(packed)
}

fn walk_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
