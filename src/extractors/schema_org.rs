//! schema.org JSON-LD extraction.

use scraper::Html;
use serde_json::Value;

use super::dom;
use crate::records::SchemaOrgData;

/// Parse every `application/ld+json` block. Unparseable blocks are skipped
/// and reported as warnings; the rest of the page's structured data
/// survives.
pub fn extract_schema_org(doc: &Html) -> anyhow::Result<(SchemaOrgData, Vec<String>)> {
    let selector = dom::sel(r#"script[type="application/ld+json"]"#)?;
    let mut data = SchemaOrgData::default();
    let mut warnings = Vec::new();

    for (index, element) in doc.select(&selector).enumerate() {
        let raw: String = element.text().collect();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                collect_types(&value, &mut data.types);
                data.raw.push(value);
            }
            Err(e) => warnings.push(format!("ld+json block {index}: {e}")),
        }
    }
    data.types.dedup();
    Ok((data, warnings))
}

/// Collect `@type` values recursively, covering `@graph` entries and any
/// nested entities.
fn collect_types(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(type_value) = map.get("@type") {
                match type_value {
                    Value::String(s) => push_unique(out, s),
                    Value::Array(items) => {
                        for item in items {
                            if let Value::String(s) = item {
                                push_unique(out, s);
                            }
                        }
                    }
                    _ => {}
                }
            }
            for nested in map.values() {
                collect_types(nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_types(item, out);
            }
        }
        _ => {}
    }
}

fn push_unique(out: &mut Vec<String>, value: &str) {
    if !out.iter().any(|v| v == value) {
        out.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_types_from_graph() {
        let doc = Html::parse_document(
            r#"<script type="application/ld+json">
            {"@context":"https://schema.org","@graph":[
              {"@type":"Organization","name":"A"},
              {"@type":"WebSite","publisher":{"@type":"Person"}}
            ]}
            </script>
            <script type="application/ld+json">{"@type":["Article","NewsArticle"]}</script>
            <script type="application/ld+json">{bad json</script>"#,
        );
        let (data, warnings) = extract_schema_org(&doc).unwrap();
        assert_eq!(
            data.types,
            vec!["Organization", "WebSite", "Person", "Article", "NewsArticle"]
        );
        assert_eq!(data.raw.len(), 2);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("block 2"), "{warnings:?}");
    }
}
