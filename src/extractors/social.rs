//! Open Graph and Twitter Card extraction.

use scraper::Html;
use serde_json::Value;
use std::collections::BTreeMap;

use super::dom;
use crate::records::SocialMetaData;

/// Collect every `og:*`, `twitter:*` and namespaced extension property.
/// Repeated properties (multiple `og:image` tags) become arrays in
/// document order.
pub fn extract_social(doc: &Html) -> anyhow::Result<SocialMetaData> {
    let selector = dom::sel("meta[property], meta[name]")?;
    let mut social = SocialMetaData::default();

    for element in doc.select(&selector) {
        let value = element.value();
        let Some(content) = value.attr("content") else {
            continue;
        };
        // Twitter cards conventionally use name=, Open Graph property=;
        // in the wild both appear in both places.
        let key = value.attr("property").or_else(|| value.attr("name"));
        let Some(key) = key else {
            continue;
        };
        let key = key.trim().to_lowercase();

        let bucket = if key.starts_with("og:") {
            &mut social.open_graph
        } else if key.starts_with("twitter:") {
            &mut social.twitter
        } else if key.contains(':') && !key.starts_with("http") {
            // article:*, product:*, fb:*, music:* and friends.
            &mut social.extensions
        } else {
            continue;
        };
        push_value(bucket, key, content.to_string());
    }
    Ok(social)
}

fn push_value(bucket: &mut BTreeMap<String, Value>, key: String, content: String) {
    match bucket.get_mut(&key) {
        None => {
            bucket.insert(key, Value::String(content));
        }
        Some(Value::Array(items)) => items.push(Value::String(content)),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(content)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_og_image_becomes_array() {
        let doc = Html::parse_document(
            r#"<head>
              <meta property="og:title" content="T">
              <meta property="og:image" content="https://a/1.png">
              <meta property="og:image" content="https://a/2.png">
              <meta name="twitter:card" content="summary">
              <meta property="article:author" content="Jo">
              <meta name="description" content="not social">
            </head>"#,
        );
        let social = extract_social(&doc).unwrap();
        assert_eq!(social.open_graph["og:title"], "T");
        let images = social.open_graph["og:image"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1], "https://a/2.png");
        assert_eq!(social.twitter["twitter:card"], "summary");
        assert_eq!(social.extensions["article:author"], "Jo");
        assert!(!social.open_graph.contains_key("description"));
    }
}
