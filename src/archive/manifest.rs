//! Archive manifest, summary, and the capability vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::events::CompletionReason;
use crate::records::RenderMode;

pub const ATLAS_VERSION: &str = "1.0.0";
pub const FORMAT_VERSION: &str = "1";
pub const GENERATOR: &str = concat!("siteatlas/", env!("CARGO_PKG_VERSION"));

/// Closed capability vocabulary declared by the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "seo.core")]
    SeoCore,
    #[serde(rename = "seo.enhanced")]
    SeoEnhanced,
    #[serde(rename = "a11y.core")]
    A11yCore,
    #[serde(rename = "render.dom")]
    RenderDom,
    #[serde(rename = "render.netlog")]
    RenderNetlog,
    #[serde(rename = "replay.html")]
    ReplayHtml,
    #[serde(rename = "replay.css")]
    ReplayCss,
    #[serde(rename = "replay.js")]
    ReplayJs,
    #[serde(rename = "replay.fonts")]
    ReplayFonts,
    #[serde(rename = "replay.images")]
    ReplayImages,
}

impl Capability {
    /// Capabilities implied by a crawl mode with the default extractor set.
    #[must_use]
    pub fn for_mode(mode: RenderMode, subresources_captured: bool) -> Vec<Capability> {
        let mut caps = vec![Capability::SeoCore, Capability::SeoEnhanced, Capability::A11yCore,
            Capability::ReplayHtml];
        if mode.uses_browser() {
            caps.push(Capability::RenderDom);
        }
        if subresources_captured {
            caps.extend([
                Capability::RenderNetlog,
                Capability::ReplayCss,
                Capability::ReplayJs,
                Capability::ReplayFonts,
                Capability::ReplayImages,
            ]);
        }
        caps.sort();
        caps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionParams {
    pub algorithm: String,
    pub level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageParams {
    pub compression: CompressionParams,
    /// `individual` blobs; `packed` is reserved for future writers.
    pub blob_format: String,
}

impl StorageParams {
    #[must_use]
    pub fn zstd(level: i32) -> Self {
        Self {
            compression: CompressionParams { algorithm: "zstd".to_string(), level },
            blob_format: "individual".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotsPolicyInfo {
    pub respect: bool,
    pub overrides_used: u64,
}

/// What the crawler redacted before anything touched disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyPolicy {
    pub strip_cookies: bool,
    pub strip_auth_headers: bool,
    pub redact_inputs: bool,
    pub redact_pii: bool,
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self {
            strip_cookies: true,
            strip_auth_headers: true,
            redact_inputs: false,
            redact_pii: false,
        }
    }
}

/// Per-dataset entry in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    pub present: bool,
    pub parts: u32,
    pub record_count: u64,
    pub bytes_compressed: u64,
    pub hash_sha256: String,
    pub schema_uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrity {
    /// Archive member path → SHA-256 hex. Covers every member except the
    /// manifest itself, which cannot embed its own hash.
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub atlas_version: String,
    pub format_version: String,
    pub created_at: DateTime<Utc>,
    pub generator: String,
    pub owner: String,
    pub mode: RenderMode,
    pub seeds: Vec<String>,
    pub datasets: BTreeMap<String, DatasetMetadata>,
    pub storage: StorageParams,
    pub robots_policy: RobotsPolicyInfo,
    pub privacy_policy: PrivacyPolicy,
    pub capabilities: Vec<Capability>,
    pub integrity: Integrity,
    pub incomplete: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
}

/// Final crawl summary, written as `summary.json` and returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSummary {
    pub crawl_id: String,
    pub mode: RenderMode,
    pub seeds: Vec<String>,
    pub pages: u64,
    pub edges: u64,
    pub assets: u64,
    pub errors: u64,
    pub accessibility_records: u64,
    pub bytes_written: u64,
    pub completion_reason: CompletionReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_follow_mode() {
        let raw = Capability::for_mode(RenderMode::Raw, false);
        assert!(raw.contains(&Capability::SeoCore));
        assert!(!raw.contains(&Capability::RenderDom));

        let full = Capability::for_mode(RenderMode::Full, true);
        assert!(full.contains(&Capability::RenderDom));
        assert!(full.contains(&Capability::RenderNetlog));
        assert!(full.contains(&Capability::ReplayImages));
    }

    #[test]
    fn capability_wire_strings() {
        let json = serde_json::to_string(&Capability::SeoCore).unwrap();
        assert_eq!(json, "\"seo.core\"");
        let json = serde_json::to_string(&Capability::RenderNetlog).unwrap();
        assert_eq!(json, "\"render.netlog\"");
    }
}
