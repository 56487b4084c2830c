//! Link graph extraction.

use scraper::Html;
use std::collections::HashSet;
use url::Url;

use super::dom;
use super::DomSource;
use crate::records::LinkLocation;

/// One outgoing link before page assembly attaches source URL and mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFinding {
    pub target_url: String,
    pub selector_hint: String,
    pub anchor_text: String,
    pub rel: Option<String>,
    pub nofollow: bool,
    pub sponsored: bool,
    pub ugc: bool,
    pub is_external: bool,
    pub location: LinkLocation,
}

/// Schemes a crawler can never follow.
fn is_followable(href: &str) -> bool {
    let lowered = href.trim().to_lowercase();
    !(lowered.is_empty()
        || lowered.starts_with("javascript:")
        || lowered.starts_with("mailto:")
        || lowered.starts_with("tel:")
        || lowered.starts_with("data:")
        || lowered.starts_with('#'))
}

/// Find every `a[href]`, resolve against the base, and classify. Duplicate
/// `(target, selectorHint)` pairs collapse to one finding. In raw mode the
/// ancestor walk is skipped and `location` stays `unknown`.
pub fn extract_links(
    doc: &Html,
    base_url: &Url,
    dom_source: DomSource,
) -> anyhow::Result<Vec<LinkFinding>> {
    let anchor = dom::sel("a[href]")?;
    let mut findings = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for (index, element) in doc.select(&anchor).enumerate() {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !is_followable(href) {
            continue;
        }
        let Ok(target) = base_url.join(href.trim()) else {
            continue;
        };
        if !matches!(target.scheme(), "http" | "https") {
            continue;
        }

        let selector_hint = format!("a:nth-of-type({})", index + 1);
        let target_url = target.to_string();
        if !seen.insert((target_url.clone(), selector_hint.clone())) {
            continue;
        }

        let rel_attr = element.value().attr("rel").map(|r| r.trim().to_string());
        let rel_tokens: HashSet<String> = rel_attr
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();

        let location = match dom_source {
            DomSource::Raw => LinkLocation::Unknown,
            DomSource::Rendered => dom::location_of(element),
        };

        findings.push(LinkFinding {
            is_external: base_url.origin() != target.origin(),
            target_url,
            selector_hint,
            anchor_text: dom::element_text(element),
            nofollow: rel_tokens.contains("nofollow"),
            sponsored: rel_tokens.contains("sponsored"),
            ugc: rel_tokens.contains("ugc"),
            rel: rel_attr.filter(|r| !r.is_empty()),
            location,
        });
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://site.test/dir/page.html").unwrap()
    }

    #[test]
    fn resolves_relative_and_flags_external() {
        let doc = Html::parse_document(
            r#"<body><a href="../up">up</a><a href="https://other.test/x">ext</a></body>"#,
        );
        let links = extract_links(&doc, &base(), DomSource::Rendered).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].target_url, "https://site.test/up");
        assert!(!links[0].is_external);
        assert!(links[1].is_external);
    }

    #[test]
    fn rel_tokens_map_to_flags() {
        let doc = Html::parse_document(
            r#"<a href="/a" rel="nofollow sponsored">x</a><a href="/b" rel="UGC">y</a>"#,
        );
        let links = extract_links(&doc, &base(), DomSource::Raw).unwrap();
        assert!(links[0].nofollow && links[0].sponsored && !links[0].ugc);
        assert!(links[1].ugc);
        assert_eq!(links[0].rel.as_deref(), Some("nofollow sponsored"));
    }

    #[test]
    fn raw_mode_never_resolves_location() {
        let doc = Html::parse_document(r#"<nav><a href="/n">n</a></nav>"#);
        let links = extract_links(&doc, &base(), DomSource::Raw).unwrap();
        assert_eq!(links[0].location, LinkLocation::Unknown);
        let links = extract_links(&doc, &base(), DomSource::Rendered).unwrap();
        assert_eq!(links[0].location, LinkLocation::Nav);
    }

    #[test]
    fn skips_unfollowable_schemes_and_dedupes() {
        let doc = Html::parse_document(
            r##"<a href="javascript:void(0)">j</a><a href="mailto:x@y">m</a>
               <a href="#frag">f</a><a href="/p">1</a>"##,
        );
        let links = extract_links(&doc, &base(), DomSource::Raw).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].selector_hint, "a:nth-of-type(4)");
    }
}
