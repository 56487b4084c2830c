//! Dataset record types written into the atlas archive.
//!
//! One struct per NDJSON dataset (`pages`, `edges`, `assets`, `errors`,
//! `accessibility`) plus the nested extraction payloads a page record
//! carries. Field names are the archive's wire contract and serialize in
//! camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ErrorKind, ErrorPhase};

/// How a page body was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Plain HTTP GET, no browser.
    Raw,
    /// Browser navigation, DOM snapshot only.
    Prerender,
    /// Browser navigation with network capture.
    Full,
}

impl RenderMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Prerender => "prerender",
            Self::Full => "full",
        }
    }

    #[must_use]
    pub fn uses_browser(&self) -> bool {
        !matches!(self, Self::Raw)
    }
}

/// What actually terminated navigation for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavEndReason {
    /// Raw-mode HTTP fetch completed (including HTTP error statuses).
    Fetch,
    /// The browser load event fired.
    Load,
    /// The network went idle before the deadline.
    NetworkIdle,
    /// The navigation deadline expired.
    Timeout,
    /// Transport or browser failure.
    Error,
}

/// Semantic container a link was found under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkLocation {
    Nav,
    Header,
    Footer,
    Aside,
    Main,
    Other,
    /// Raw mode does not attempt ancestor resolution.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Image,
    Video,
}

/// One redirect hop recorded by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectHop {
    pub status: u16,
    pub location: String,
}

/// robots.txt decision recorded on the page that consulted it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotsVerdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    pub override_used: bool,
}

impl RobotsVerdict {
    #[must_use]
    pub fn allow_all() -> Self {
        Self { allowed: true, matched_rule: None, override_used: false }
    }
}

/// hreflang alternate declared by a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HreflangEntry {
    pub lang: String,
    pub url: String,
}

/// First texts and counts for one heading level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadingLevel {
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_text: Option<String>,
}

/// SEO extraction payload embedded in the page record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeoData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_pixel_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_pixel_width: Option<u32>,
    /// Indexed `h1`..`h6`.
    pub headings: [HeadingLevel; 6],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_robots: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_robots_tag: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub hreflang: Vec<HreflangEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub text_html_ratio: f64,
    pub word_count: u32,
}

/// Open Graph / Twitter Card payload. Repeated properties (for example
/// `og:image`) collapse into JSON arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialMetaData {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub open_graph: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub twitter: BTreeMap<String, serde_json::Value>,
    /// Namespaced extensions such as `article:*` and `product:*`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl SocialMetaData {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open_graph.is_empty() && self.twitter.is_empty() && self.extensions.is_empty()
    }
}

/// schema.org JSON-LD payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaOrgData {
    /// Every `@type` value found, including inside `@graph`.
    pub types: Vec<String>,
    /// Raw JSON-LD blocks carried through verbatim.
    pub raw: Vec<serde_json::Value>,
}

/// Counts extracted from a page, denormalized for analyzers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedCounts {
    pub links: u32,
    pub internal_links: u32,
    pub external_links: u32,
    pub assets: u32,
    pub words: u32,
}

/// One archive page. Emitted once per successfully dispatched fetch, even
/// when the HTTP status was an error; `body_blob_ref` is present iff the
/// body was retrieved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    /// Canonical URL key of the page.
    pub url: String,
    /// URL after following redirects.
    pub final_url: String,
    /// HTTP status; 0 when the transport failed before a response.
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub depth: u32,
    pub section: String,
    pub render_mode: RenderMode,
    pub nav_end_reason: NavEndReason,
    pub fetch_ms: u64,
    pub render_ms: u64,
    pub extract_ms: u64,
    pub write_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_html_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_blob_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    pub robots: RobotsVerdict,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub redirect_chain: Vec<RedirectHop>,
    pub counts: ExtractedCounts,
    /// Set when an asset cap, byte cap or request cap clipped the page.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seo: Option<SeoData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub social: Option<SocialMetaData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_org: Option<SchemaOrgData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_sample: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// One observed hyperlink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    pub source_url: String,
    pub target_url: String,
    /// DOM-position hint, `a:nth-of-type(idx)`.
    pub selector_hint: String,
    pub anchor_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    pub nofollow: bool,
    pub sponsored: bool,
    pub ugc: bool,
    pub is_external: bool,
    pub location: LinkLocation,
    pub discovered_in_mode: RenderMode,
}

/// One referenced media asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub page_url: String,
    pub asset_url: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    pub has_alt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loading: Option<String>,
    pub was_lazy_loaded: bool,
}

/// One recorded (non-fatal) crawl error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub url: String,
    pub origin: String,
    pub hostname: String,
    pub phase: ErrorPhase,
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Landmark elements present on a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Landmarks {
    pub header: bool,
    pub nav: bool,
    pub main: bool,
    pub footer: bool,
    pub aside: bool,
}

/// One sampled contrast violation (render mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContrastViolation {
    pub selector: String,
    pub ratio: f64,
    pub required: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_text: Option<String>,
}

/// Skip-link probe results (render mode only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipLinkCheck {
    pub present: bool,
    pub target_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_focusable: Option<String>,
}

/// Media element accessibility findings (render mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAccessibility {
    pub selector: String,
    pub has_captions: bool,
    pub has_subtitles: bool,
    pub has_descriptions: bool,
    pub autoplay: bool,
    pub controls: bool,
}

/// Per-page accessibility dataset record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityRecord {
    pub page_url: String,
    pub landmarks: Landmarks,
    /// Heading levels in document order.
    pub heading_order: Vec<u8>,
    /// False when a heading level is skipped going down.
    pub heading_order_valid: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub role_histogram: BTreeMap<String, u32>,
    pub missing_alt_count: u32,
    /// Sample of offending `src` attributes, capped at 50.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub missing_alt_samples: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contrast_violations: Option<Vec<ContrastViolation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_link: Option<SkipLinkCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyboard_traps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<MediaAccessibility>>,
}

/// The archive datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Pages,
    Edges,
    Assets,
    Errors,
    Accessibility,
}

impl Dataset {
    pub const ALL: [Dataset; 5] = [
        Dataset::Pages,
        Dataset::Edges,
        Dataset::Assets,
        Dataset::Errors,
        Dataset::Accessibility,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pages => "pages",
            Self::Edges => "edges",
            Self::Assets => "assets",
            Self::Errors => "errors",
            Self::Accessibility => "accessibility",
        }
    }

    #[must_use]
    pub fn schema_uri(&self) -> String {
        format!("atlas://schemas/{}/1.0", self.name())
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
