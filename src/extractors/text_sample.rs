//! Body text sample, bounded and boundary-safe.

use scraper::Html;

use super::dom;

/// Sample budget in bytes.
pub const TEXT_SAMPLE_MAX_BYTES: usize = 1500;

/// Whitespace-collapsed body text truncated to at most 1500 bytes, always
/// on a UTF-8 character boundary.
#[must_use]
pub fn extract_text_sample(doc: &Html) -> Option<String> {
    let text = dom::visible_text(doc);
    if text.is_empty() {
        return None;
    }
    Some(truncate_utf8(text, TEXT_SAMPLE_MAX_BYTES))
}

fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundary() {
        // Multi-byte characters straddling the budget must not be split.
        let body = "\u{00e9}".repeat(1000); // 2 bytes each
        let html = format!("<body><p>{body}</p></body>");
        let doc = Html::parse_document(&html);
        let sample = extract_text_sample(&doc).unwrap();
        assert!(sample.len() <= TEXT_SAMPLE_MAX_BYTES);
        assert_eq!(sample.len(), 1500); // 750 two-byte chars
        assert!(sample.chars().all(|c| c == '\u{00e9}'));
    }

    #[test]
    fn short_text_passes_through() {
        let doc = Html::parse_document("<body>  hello\n\n world </body>");
        assert_eq!(extract_text_sample(&doc).unwrap(), "hello world");
    }

    #[test]
    fn empty_body_yields_none() {
        let doc = Html::parse_document("<body><script>x()</script></body>");
        assert_eq!(extract_text_sample(&doc), None);
    }
}
