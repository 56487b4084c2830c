//! SEO extraction: title and description with pixel widths, headings,
//! canonical, indexability signals, hreflang, viewport/charset/language,
//! text ratio and word count.
//!
//! # Pixel-width model
//!
//! Widths approximate Arial as rendered in desktop search snippets, the
//! same grouped-average model SERP-preview tools use: characters fall into
//! narrow / normal / uppercase / wide / CJK classes with a fixed width per
//! class, scaled by font size (titles 18px, descriptions 13px). The model
//! is deliberately coarse; it exists to compare against the conventional
//! 580px/990px truncation budgets, not to typeset.

use scraper::Html;
use std::collections::HashMap;
use url::Url;

use super::dom;
use crate::records::{HeadingLevel, HreflangEntry, SeoData};

pub const TITLE_FONT_PX: f64 = 18.0;
pub const DESCRIPTION_FONT_PX: f64 = 13.0;

/// Width of one character in ems for the grouped Arial model.
fn char_width_em(ch: char) -> f64 {
    match ch {
        'i' | 'j' | 'l' | '!' | '|' | '\'' | '.' | ',' | ':' | ';' => 0.28,
        'f' | 't' | 'r' | '(' | ')' | '[' | ']' | '-' | ' ' => 0.35,
        'm' | 'w' => 0.85,
        'M' | 'W' => 0.95,
        '@' => 1.0,
        c if c.is_ascii_uppercase() => 0.72,
        c if c.is_ascii_digit() => 0.56,
        c if c.is_ascii() => 0.52,
        // CJK and fullwidth forms occupy a full em.
        c if (0x2E80..=0x9FFF).contains(&(c as u32))
            || (0xAC00..=0xD7AF).contains(&(c as u32))
            || (0xFF00..=0xFFEF).contains(&(c as u32)) =>
        {
            1.0
        }
        _ => 0.6,
    }
}

/// Approximate rendered width of `text` at `font_px`.
#[must_use]
pub fn text_pixel_width(text: &str, font_px: f64) -> u32 {
    let ems: f64 = text.chars().map(char_width_em).sum();
    (ems * font_px).round() as u32
}

pub fn extract_seo(
    doc: &Html,
    base_url: &Url,
    html_len: usize,
    headers: Option<&HashMap<String, String>>,
) -> anyhow::Result<SeoData> {
    let mut seo = SeoData::default();

    if let Some(title_el) = dom::select_first(doc, "head title")?
        .or(dom::select_first(doc, "title")?)
    {
        let title = dom::element_text(title_el);
        if !title.is_empty() {
            seo.title_pixel_width = Some(text_pixel_width(&title, TITLE_FONT_PX));
            seo.title = Some(title);
        }
    }

    if let Some(description) = dom::meta_content(doc, r#"meta[name="description"]"#)? {
        seo.description_pixel_width =
            Some(text_pixel_width(&description, DESCRIPTION_FONT_PX));
        seo.meta_description = Some(description);
    }

    for level in 1..=6u8 {
        let selector = dom::sel(&format!("h{level}"))?;
        let mut count = 0u32;
        let mut first_text = None;
        for heading in doc.select(&selector) {
            if first_text.is_none() {
                let text = dom::element_text(heading);
                if !text.is_empty() {
                    first_text = Some(text);
                }
            }
            count += 1;
        }
        seo.headings[(level - 1) as usize] = HeadingLevel { count, first_text };
    }

    if let Some(canonical) = dom::select_first(doc, r#"link[rel="canonical"]"#)?
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| base_url.join(href.trim()).ok())
    {
        seo.canonical_url = Some(canonical.to_string());
    }

    seo.meta_robots = dom::meta_content(doc, r#"meta[name="robots"]"#)?;
    seo.x_robots_tag = headers
        .and_then(|h| h.get("x-robots-tag"))
        .map(|v| v.to_string());

    let hreflang_sel = dom::sel(r#"link[rel="alternate"][hreflang]"#)?;
    for link in doc.select(&hreflang_sel) {
        let value = link.value();
        if let (Some(lang), Some(href)) = (value.attr("hreflang"), value.attr("href"))
            && let Ok(resolved) = base_url.join(href.trim())
        {
            seo.hreflang.push(HreflangEntry {
                lang: lang.trim().to_string(),
                url: resolved.to_string(),
            });
        }
    }

    seo.viewport = dom::meta_content(doc, r#"meta[name="viewport"]"#)?;
    seo.charset = extract_charset(doc, headers)?;
    seo.language = dom::select_first(doc, "html")?
        .and_then(|el| el.value().attr("lang"))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    let text = dom::visible_text(doc);
    seo.word_count = text.split_whitespace().count() as u32;
    seo.text_html_ratio = if html_len == 0 {
        0.0
    } else {
        text.len() as f64 / html_len as f64
    };

    Ok(seo)
}

fn extract_charset(
    doc: &Html,
    headers: Option<&HashMap<String, String>>,
) -> anyhow::Result<Option<String>> {
    if let Some(meta) = dom::select_first(doc, "meta[charset]")?
        .and_then(|el| el.value().attr("charset"))
    {
        return Ok(Some(meta.trim().to_lowercase()));
    }
    if let Some(content) = dom::meta_content(doc, r#"meta[http-equiv="Content-Type"]"#)?
        && let Some(charset) = charset_of(&content)
    {
        return Ok(Some(charset));
    }
    Ok(headers
        .and_then(|h| h.get("content-type"))
        .and_then(|ct| charset_of(ct)))
}

fn charset_of(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .find_map(|part| part.trim().strip_prefix("charset="))
        .map(|cs| cs.trim_matches('"').trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html lang="en-US"><head>
  <meta charset="UTF-8">
  <title>Rust Crawlers Explained</title>
  <meta name="description" content="A practical look at building crawlers.">
  <meta name="robots" content="noindex, follow">
  <meta name="viewport" content="width=device-width">
  <link rel="canonical" href="/canonical">
  <link rel="alternate" hreflang="de" href="/de/">
</head><body>
  <h1>Crawlers</h1><h2>Frontier</h2><h2>Fetching</h2>
  <p>Some body copy with several words in it.</p>
</body></html>"#;

    #[test]
    fn extracts_core_fields() {
        let doc = Html::parse_document(PAGE);
        let base = Url::parse("https://site.test/post").unwrap();
        let seo = extract_seo(&doc, &base, PAGE.len(), None).unwrap();

        assert_eq!(seo.title.as_deref(), Some("Rust Crawlers Explained"));
        assert!(seo.title_pixel_width.unwrap() > 100);
        assert_eq!(seo.meta_robots.as_deref(), Some("noindex, follow"));
        assert_eq!(seo.canonical_url.as_deref(), Some("https://site.test/canonical"));
        assert_eq!(seo.headings[0].count, 1);
        assert_eq!(seo.headings[1].count, 2);
        assert_eq!(seo.headings[1].first_text.as_deref(), Some("Frontier"));
        assert_eq!(seo.hreflang.len(), 1);
        assert_eq!(seo.hreflang[0].lang, "de");
        assert_eq!(seo.charset.as_deref(), Some("utf-8"));
        assert_eq!(seo.language.as_deref(), Some("en-US"));
        assert!(seo.word_count >= 10);
        assert!(seo.text_html_ratio > 0.0 && seo.text_html_ratio < 1.0);
    }

    #[test]
    fn x_robots_comes_from_headers() {
        let doc = Html::parse_document(PAGE);
        let base = Url::parse("https://site.test/").unwrap();
        let mut headers = HashMap::new();
        headers.insert("x-robots-tag".to_string(), "none".to_string());
        headers.insert(
            "content-type".to_string(),
            "text/html; charset=ISO-8859-1".to_string(),
        );
        let seo = extract_seo(&doc, &base, PAGE.len(), Some(&headers)).unwrap();
        assert_eq!(seo.x_robots_tag.as_deref(), Some("none"));
        // The in-document charset wins over the header.
        assert_eq!(seo.charset.as_deref(), Some("utf-8"));
    }

    #[test]
    fn width_model_orders_sensibly() {
        let narrow = text_pixel_width("iiii", TITLE_FONT_PX);
        let wide = text_pixel_width("WWWW", TITLE_FONT_PX);
        assert!(wide > narrow * 2);
        let cjk = text_pixel_width("\u{6f22}\u{5b57}", TITLE_FONT_PX);
        assert_eq!(cjk, 36);
    }
}
