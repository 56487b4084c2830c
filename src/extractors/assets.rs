//! Media asset extraction: `img`, `video` and `source` elements.

use scraper::Html;
use url::Url;

use super::dom;
use crate::records::AssetType;

/// Per-page asset cap; overflow sets the page's `truncated` flag.
pub const MAX_ASSETS_PER_PAGE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFinding {
    pub asset_url: String,
    pub asset_type: AssetType,
    pub alt: Option<String>,
    pub has_alt: bool,
    pub loading: Option<String>,
    pub was_lazy_loaded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AssetExtract {
    pub assets: Vec<AssetFinding>,
    pub truncated: bool,
}

pub fn extract_assets(doc: &Html, base_url: &Url) -> anyhow::Result<AssetExtract> {
    let selector = dom::sel("img, video, source")?;
    let mut out = AssetExtract::default();

    for element in doc.select(&selector) {
        if out.assets.len() >= MAX_ASSETS_PER_PAGE {
            out.truncated = true;
            break;
        }
        let value = element.value();
        let name = value.name();

        let asset_type = match name {
            "img" => AssetType::Image,
            "video" => AssetType::Video,
            "source" => {
                // A <source> takes its kind from the enclosing element.
                let parent = element
                    .parent()
                    .and_then(|p| p.value().as_element().map(|e| e.name().to_string()));
                match parent.as_deref() {
                    Some("video") => AssetType::Video,
                    Some("picture") => AssetType::Image,
                    _ => continue,
                }
            }
            _ => continue,
        };

        let src = value
            .attr("src")
            .or_else(|| value.attr("data-src"))
            .or_else(|| value.attr("srcset").and_then(first_srcset_url));
        let Some(src) = src else {
            continue;
        };
        if src.trim().is_empty() || src.trim_start().starts_with("data:") {
            continue;
        }
        let Ok(resolved) = base_url.join(src.trim()) else {
            continue;
        };

        let alt = if name == "img" { value.attr("alt").map(|a| a.to_string()) } else { None };
        let loading = value.attr("loading").map(|l| l.to_lowercase());
        let was_lazy_loaded = loading.as_deref() == Some("lazy")
            || value.attr("data-src").is_some()
            || value
                .attr("class")
                .is_some_and(|c| c.to_lowercase().contains("lazy"));

        out.assets.push(AssetFinding {
            asset_url: resolved.to_string(),
            asset_type,
            has_alt: alt.is_some(),
            alt: alt.filter(|a| !a.is_empty()),
            loading,
            was_lazy_loaded,
        });
    }
    Ok(out)
}

fn first_srcset_url(srcset: &str) -> Option<&str> {
    srcset
        .split(',')
        .next()
        .map(|candidate| candidate.trim())
        .and_then(|candidate| candidate.split_whitespace().next())
        .filter(|url| !url.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://site.test/").unwrap()
    }

    #[test]
    fn classifies_images_and_video_sources() {
        let doc = Html::parse_document(
            r#"<img src="/a.png" alt="A">
               <video><source src="/v.mp4"></video>
               <picture><source srcset="/p-800.jpg 800w, /p-400.jpg 400w"><img src="/p.jpg" alt=""></picture>
               <audio><source src="/s.mp3"></audio>"#,
        );
        let out = extract_assets(&doc, &base()).unwrap();
        let urls: Vec<_> = out.assets.iter().map(|a| a.asset_url.as_str()).collect();
        assert!(urls.contains(&"https://site.test/a.png"));
        assert!(urls.contains(&"https://site.test/v.mp4"));
        assert!(urls.contains(&"https://site.test/p-800.jpg"));
        // audio sources are neither image nor video assets
        assert!(!urls.iter().any(|u| u.ends_with(".mp3")));
        assert_eq!(out.assets[1].asset_type, AssetType::Video);
    }

    #[test]
    fn alt_presence_distinguishes_empty_from_missing() {
        let doc =
            Html::parse_document(r#"<img src="/a.png" alt=""><img src="/b.png">"#);
        let out = extract_assets(&doc, &base()).unwrap();
        assert!(out.assets[0].has_alt);
        assert_eq!(out.assets[0].alt, None);
        assert!(!out.assets[1].has_alt);
    }

    #[test]
    fn lazy_loading_signals() {
        let doc = Html::parse_document(
            r#"<img src="/a.png" loading="lazy"><img data-src="/b.png" class="lazyload">"#,
        );
        let out = extract_assets(&doc, &base()).unwrap();
        assert!(out.assets.iter().all(|a| a.was_lazy_loaded));
    }

    #[test]
    fn cap_sets_truncated() {
        let mut html = String::from("<body>");
        for i in 0..1005 {
            html.push_str(&format!(r#"<img src="/img-{i}.png">"#));
        }
        html.push_str("</body>");
        let doc = Html::parse_document(&html);
        let out = extract_assets(&doc, &base()).unwrap();
        assert_eq!(out.assets.len(), MAX_ASSETS_PER_PAGE);
        assert!(out.truncated);
    }
}
