//! Shared DOM utilities for the extractors. Free functions only.

use scraper::{ElementRef, Html, Selector};

use crate::records::LinkLocation;

/// Parse a static selector. The inputs are compile-time literals, but the
/// error is propagated rather than unwrapped so a typo cannot panic a
/// worker.
pub fn sel(selector: &str) -> anyhow::Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow::anyhow!("bad selector {selector:?}: {e}"))
}

/// First element matching `selector`, if any.
pub fn select_first<'a>(doc: &'a Html, selector: &str) -> anyhow::Result<Option<ElementRef<'a>>> {
    Ok(doc.select(&sel(selector)?).next())
}

/// Trimmed, whitespace-collapsed text content of one element.
#[must_use]
pub fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

/// `content` attribute of the first matching `<meta>` element.
pub fn meta_content(doc: &Html, selector: &str) -> anyhow::Result<Option<String>> {
    Ok(select_first(doc, selector)?
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Visible text of the document body: script, style, noscript and template
/// subtrees are skipped, whitespace is collapsed.
#[must_use]
pub fn visible_text(doc: &Html) -> String {
    let mut out = String::new();
    let Ok(body_sel) = Selector::parse("body") else {
        return out;
    };
    let Some(body) = doc.select(&body_sel).next() else {
        return out;
    };
    collect_visible(*body, &mut out);
    collapse_whitespace(&out)
}

fn collect_visible(node: ego_tree::NodeRef<'_, scraper::Node>, out: &mut String) {
    for child in node.children() {
        match child.value() {
            scraper::Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            scraper::Node::Element(element) => {
                let name = element.name();
                if matches!(name, "script" | "style" | "noscript" | "template") {
                    continue;
                }
                collect_visible(child, out);
            }
            _ => {}
        }
    }
}

/// Collapse runs of whitespace to single spaces and trim.
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(4096));
    let mut in_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Nearest semantic container of an element, walking ancestors. The walk
/// stays inside the serialized tree; shadow roots are not crossed (the DOM
/// snapshot flattens whatever Chromium exposed).
#[must_use]
pub fn location_of(element: ElementRef<'_>) -> LinkLocation {
    for ancestor in element.ancestors() {
        if let scraper::Node::Element(el) = ancestor.value() {
            match el.name() {
                "nav" => return LinkLocation::Nav,
                "header" => return LinkLocation::Header,
                "footer" => return LinkLocation::Footer,
                "aside" => return LinkLocation::Aside,
                "main" => return LinkLocation::Main,
                _ => match el.attr("role") {
                    Some("navigation") => return LinkLocation::Nav,
                    Some("banner") => return LinkLocation::Header,
                    Some("contentinfo") => return LinkLocation::Footer,
                    Some("complementary") => return LinkLocation::Aside,
                    Some("main") => return LinkLocation::Main,
                    _ => {}
                },
            }
        }
    }
    LinkLocation::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_text_skips_scripts() {
        let doc = Html::parse_document(
            "<body><p>hello   world</p><script>var x=1;</script><style>p{}</style></body>",
        );
        assert_eq!(visible_text(&doc), "hello world");
    }

    #[test]
    fn location_walks_to_nearest_container() {
        let doc = Html::parse_document(
            "<body><nav><ul><li><a id='a1' href='/'>x</a></li></ul></nav>\
             <div role='contentinfo'><a id='a2' href='/'>y</a></div>\
             <p><a id='a3' href='/'>z</a></p></body>",
        );
        let a1 = select_first(&doc, "#a1").unwrap().unwrap();
        assert_eq!(location_of(a1), LinkLocation::Nav);
        let a2 = select_first(&doc, "#a2").unwrap().unwrap();
        assert_eq!(location_of(a2), LinkLocation::Footer);
        let a3 = select_first(&doc, "#a3").unwrap().unwrap();
        assert_eq!(location_of(a3), LinkLocation::Other);
    }
}
