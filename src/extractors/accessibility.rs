//! Static accessibility extraction (works on raw or rendered DOMs).
//!
//! Rendered-only checks (contrast, skip links, keyboard traps, media
//! tracks) come from the renderer's in-page probe and are merged by page
//! assembly, not computed here.

use scraper::Html;
use std::collections::BTreeMap;

use super::dom;
use crate::records::Landmarks;

/// Sampled `src` attributes for images missing alt text.
pub const MAX_MISSING_ALT_SAMPLES: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct StaticAccessibility {
    pub landmarks: Landmarks,
    pub heading_order: Vec<u8>,
    pub heading_order_valid: bool,
    pub role_histogram: BTreeMap<String, u32>,
    pub missing_alt_count: u32,
    pub missing_alt_samples: Vec<String>,
}

pub fn extract_accessibility(doc: &Html) -> anyhow::Result<StaticAccessibility> {
    let mut out = StaticAccessibility::default();

    out.landmarks = Landmarks {
        header: has_any(doc, "header, [role=\"banner\"]")?,
        nav: has_any(doc, "nav, [role=\"navigation\"]")?,
        main: has_any(doc, "main, [role=\"main\"]")?,
        footer: has_any(doc, "footer, [role=\"contentinfo\"]")?,
        aside: has_any(doc, "aside, [role=\"complementary\"]")?,
    };

    let headings = dom::sel("h1, h2, h3, h4, h5, h6")?;
    for heading in doc.select(&headings) {
        let name = heading.value().name();
        if let Some(level) = name.strip_prefix('h').and_then(|d| d.parse::<u8>().ok()) {
            out.heading_order.push(level);
        }
    }
    // A jump of more than one level downward breaks the outline.
    out.heading_order_valid = out
        .heading_order
        .windows(2)
        .all(|pair| pair[1] <= pair[0] + 1);

    let roles = dom::sel("[role]")?;
    for element in doc.select(&roles) {
        if let Some(role) = element.value().attr("role") {
            let role = role.trim().to_lowercase();
            if !role.is_empty() {
                *out.role_histogram.entry(role).or_insert(0) += 1;
            }
        }
    }

    let images = dom::sel("img")?;
    for image in doc.select(&images) {
        if image.value().attr("alt").is_none() {
            out.missing_alt_count += 1;
            if out.missing_alt_samples.len() < MAX_MISSING_ALT_SAMPLES
                && let Some(src) = image.value().attr("src")
            {
                out.missing_alt_samples.push(src.to_string());
            }
        }
    }

    Ok(out)
}

fn has_any(doc: &Html, selector: &str) -> anyhow::Result<bool> {
    Ok(doc.select(&dom::sel(selector)?).next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landmarks_and_roles() {
        let doc = Html::parse_document(
            r#"<body><header>h</header><nav>n</nav><main>m</main>
               <div role="button">b</div><div role="button">b2</div>
               <div role="dialog">d</div></body>"#,
        );
        let a11y = extract_accessibility(&doc).unwrap();
        assert!(a11y.landmarks.header && a11y.landmarks.nav && a11y.landmarks.main);
        assert!(!a11y.landmarks.footer && !a11y.landmarks.aside);
        assert_eq!(a11y.role_histogram["button"], 2);
        assert_eq!(a11y.role_histogram["dialog"], 1);
    }

    #[test]
    fn heading_order_validity() {
        let ok = Html::parse_document("<h1>a</h1><h2>b</h2><h3>c</h3><h2>d</h2>");
        let a11y = extract_accessibility(&ok).unwrap();
        assert_eq!(a11y.heading_order, vec![1, 2, 3, 2]);
        assert!(a11y.heading_order_valid);

        let skipped = Html::parse_document("<h1>a</h1><h4>b</h4>");
        let a11y = extract_accessibility(&skipped).unwrap();
        assert!(!a11y.heading_order_valid);
    }

    #[test]
    fn missing_alt_counting_and_sampling() {
        let doc = Html::parse_document(
            r#"<img src="/ok.png" alt="fine"><img src="/bad1.png"><img src="/bad2.png" alt="">"#,
        );
        let a11y = extract_accessibility(&doc).unwrap();
        // alt="" is present (decorative); only the attribute-less one counts.
        assert_eq!(a11y.missing_alt_count, 1);
        assert_eq!(a11y.missing_alt_samples, vec!["/bad1.png"]);
    }
}
