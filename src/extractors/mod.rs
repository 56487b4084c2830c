//! Post-acquisition extraction pipeline.
//!
//! Every extractor is a pure function over `(html, baseUrl, meta)`; no
//! extractor failure can fail the page. [`extract_all`] parses the document
//! once, runs the whole suite, and collects per-extractor issues so the
//! caller can record them as `extract`-phase errors while omitting the
//! failed field.

pub mod accessibility;
pub mod assets;
pub mod dom;
pub mod links;
pub mod schema_org;
pub mod seo;
pub mod social;
pub mod text_sample;

use scraper::Html;
use std::collections::HashMap;
use url::Url;

pub use accessibility::StaticAccessibility;
pub use assets::{AssetExtract, AssetFinding, MAX_ASSETS_PER_PAGE};
pub use links::LinkFinding;

use crate::records::{SchemaOrgData, SeoData, SocialMetaData};

/// Which DOM the HTML came from; raw mode skips ancestor-based location
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomSource {
    Raw,
    Rendered,
}

/// A recorded, non-fatal extractor failure.
#[derive(Debug, Clone)]
pub struct ExtractIssue {
    pub extractor: &'static str,
    pub message: String,
}

/// Merged output of the extractor suite. Absent fields mean the extractor
/// failed (see `issues`) or had nothing to report.
#[derive(Debug, Default)]
pub struct PageExtract {
    pub links: Vec<LinkFinding>,
    pub assets: Vec<AssetFinding>,
    pub assets_truncated: bool,
    pub seo: Option<SeoData>,
    pub social: Option<SocialMetaData>,
    pub schema_org: Option<SchemaOrgData>,
    pub accessibility: Option<StaticAccessibility>,
    pub text_sample: Option<String>,
    pub issues: Vec<ExtractIssue>,
}

/// Run the full extractor suite over one HTML document.
#[must_use]
pub fn extract_all(
    html: &str,
    base_url: &Url,
    dom_source: DomSource,
    headers: Option<&HashMap<String, String>>,
) -> PageExtract {
    let doc = Html::parse_document(html);
    let mut out = PageExtract::default();

    match links::extract_links(&doc, base_url, dom_source) {
        Ok(links) => out.links = links,
        Err(e) => out.issues.push(issue("links", e)),
    }

    match assets::extract_assets(&doc, base_url) {
        Ok(extract) => {
            out.assets = extract.assets;
            out.assets_truncated = extract.truncated;
        }
        Err(e) => out.issues.push(issue("assets", e)),
    }

    match seo::extract_seo(&doc, base_url, html.len(), headers) {
        Ok(seo) => out.seo = Some(seo),
        Err(e) => out.issues.push(issue("seo", e)),
    }

    match social::extract_social(&doc) {
        Ok(social) if !social.is_empty() => out.social = Some(social),
        Ok(_) => {}
        Err(e) => out.issues.push(issue("social", e)),
    }

    match schema_org::extract_schema_org(&doc) {
        Ok((data, warnings)) => {
            for warning in warnings {
                out.issues.push(ExtractIssue { extractor: "schema_org", message: warning });
            }
            if !data.raw.is_empty() {
                out.schema_org = Some(data);
            }
        }
        Err(e) => out.issues.push(issue("schema_org", e)),
    }

    match accessibility::extract_accessibility(&doc) {
        Ok(a11y) => out.accessibility = Some(a11y),
        Err(e) => out.issues.push(issue("accessibility", e)),
    }

    out.text_sample = text_sample::extract_text_sample(&doc);

    out
}

fn issue(extractor: &'static str, error: anyhow::Error) -> ExtractIssue {
    ExtractIssue { extractor, message: error.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_produces_all_sections() {
        let html = r#"<!doctype html><html lang="en"><head>
            <title>T</title>
            <meta name="description" content="d">
            <meta property="og:title" content="OT">
            <script type="application/ld+json">{"@type":"WebSite"}</script>
        </head><body>
            <nav><a href="/in">in</a></nav>
            <a href="https://ext.test/">out</a>
            <img src="/i.png">
            <p>body words here</p>
        </body></html>"#;
        let base = Url::parse("https://site.test/").unwrap();
        let extract = extract_all(html, &base, DomSource::Rendered, None);

        assert_eq!(extract.links.len(), 2);
        assert_eq!(extract.assets.len(), 1);
        assert!(extract.seo.as_ref().unwrap().title.is_some());
        assert!(extract.social.is_some());
        assert_eq!(extract.schema_org.as_ref().unwrap().types, vec!["WebSite"]);
        assert_eq!(extract.accessibility.as_ref().unwrap().missing_alt_count, 1);
        assert!(extract.text_sample.as_deref().unwrap().contains("body words"));
        assert!(extract.issues.is_empty());
    }
}
