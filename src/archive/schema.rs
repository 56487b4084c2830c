//! Structural schema gate for dataset records.
//!
//! Validation is structural, not a full JSON Schema engine: required
//! fields, closed enum values, and hash-format strings. The same tables
//! generate the `schemas/<dataset>.schema.json` documents embedded in the
//! archive for downstream readers.

use serde_json::{Value, json};

use crate::records::Dataset;

/// Validation table for one dataset.
pub struct RecordSchema {
    pub required: &'static [&'static str],
    pub enums: &'static [(&'static str, &'static [&'static str])],
    /// Fields that, when present, must be 64 lowercase hex chars.
    pub hash_fields: &'static [&'static str],
}

const RENDER_MODES: &[&str] = &["raw", "prerender", "full"];
const NAV_END_REASONS: &[&str] = &["fetch", "load", "networkidle", "timeout", "error"];
const LOCATIONS: &[&str] = &["nav", "header", "footer", "aside", "main", "other", "unknown"];
const ASSET_TYPES: &[&str] = &["image", "video"];
const PHASES: &[&str] = &["fetch", "render", "extract", "write"];
const ERROR_KINDS: &[&str] = &[
    "config",
    "network",
    "timeout",
    "cap_exceeded",
    "render",
    "extract",
    "write",
    "robots_blocked",
    "validation",
];

static PAGES: RecordSchema = RecordSchema {
    required: &[
        "url",
        "finalUrl",
        "statusCode",
        "depth",
        "section",
        "renderMode",
        "navEndReason",
        "fetchMs",
        "renderMs",
        "extractMs",
        "writeMs",
        "robots",
        "counts",
        "truncated",
        "fetchedAt",
    ],
    enums: &[("renderMode", RENDER_MODES), ("navEndReason", NAV_END_REASONS)],
    hash_fields: &["rawHtmlHash"],
};

static EDGES: RecordSchema = RecordSchema {
    required: &[
        "sourceUrl",
        "targetUrl",
        "selectorHint",
        "anchorText",
        "nofollow",
        "sponsored",
        "ugc",
        "isExternal",
        "location",
        "discoveredInMode",
    ],
    enums: &[("location", LOCATIONS), ("discoveredInMode", RENDER_MODES)],
    hash_fields: &[],
};

static ASSETS: RecordSchema = RecordSchema {
    required: &["pageUrl", "assetUrl", "type", "hasAlt", "wasLazyLoaded"],
    enums: &[("type", ASSET_TYPES)],
    hash_fields: &[],
};

static ERRORS: RecordSchema = RecordSchema {
    required: &["url", "origin", "hostname", "phase", "kind", "code", "message", "occurredAt"],
    enums: &[("phase", PHASES), ("kind", ERROR_KINDS)],
    hash_fields: &[],
};

static ACCESSIBILITY: RecordSchema = RecordSchema {
    required: &["pageUrl", "landmarks", "headingOrder", "headingOrderValid", "missingAltCount"],
    enums: &[],
    hash_fields: &[],
};

#[must_use]
pub fn schema_for(dataset: Dataset) -> &'static RecordSchema {
    match dataset {
        Dataset::Pages => &PAGES,
        Dataset::Edges => &EDGES,
        Dataset::Assets => &ASSETS,
        Dataset::Errors => &ERRORS,
        Dataset::Accessibility => &ACCESSIBILITY,
    }
}

/// Validate one serialized record against its dataset schema.
pub fn validate(dataset: Dataset, record: &Value) -> Result<(), String> {
    let schema = schema_for(dataset);
    let Some(object) = record.as_object() else {
        return Err("record is not a JSON object".to_string());
    };

    for field in schema.required {
        if !object.contains_key(*field) {
            return Err(format!("missing required field {field:?}"));
        }
    }

    for (field, allowed) in schema.enums {
        if let Some(value) = object.get(*field) {
            let Some(s) = value.as_str() else {
                return Err(format!("field {field:?} must be a string"));
            };
            if !allowed.contains(&s) {
                return Err(format!("field {field:?} has invalid value {s:?}"));
            }
        }
    }

    for field in schema.hash_fields {
        if let Some(value) = object.get(*field)
            && !value.is_null()
        {
            let Some(s) = value.as_str() else {
                return Err(format!("field {field:?} must be a hex string"));
            };
            if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
            {
                return Err(format!("field {field:?} is not a sha-256 hex digest"));
            }
        }
    }

    Ok(())
}

/// JSON Schema document for a dataset, written to `schemas/` in the archive.
#[must_use]
pub fn schema_document(dataset: Dataset) -> Value {
    let schema = schema_for(dataset);
    let mut properties = serde_json::Map::new();
    for (field, allowed) in schema.enums {
        properties.insert((*field).to_string(), json!({ "type": "string", "enum": allowed }));
    }
    for field in schema.hash_fields {
        properties.insert(
            (*field).to_string(),
            json!({ "type": "string", "pattern": "^[0-9a-f]{64}$" }),
        );
    }
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": dataset.schema_uri(),
        "title": format!("atlas {} record", dataset.name()),
        "type": "object",
        "required": schema.required,
        "properties": Value::Object(properties),
        "additionalProperties": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_missing_required_field() {
        let record = json!({ "sourceUrl": "https://a/", "targetUrl": "https://b/" });
        let err = validate(Dataset::Edges, &record).unwrap_err();
        assert!(err.contains("selectorHint"), "{err}");
    }

    #[test]
    fn rejects_bad_enum_value() {
        let record = json!({
            "pageUrl": "https://a/",
            "assetUrl": "https://a/x.png",
            "type": "font",
            "hasAlt": false,
            "wasLazyLoaded": false,
        });
        let err = validate(Dataset::Assets, &record).unwrap_err();
        assert!(err.contains("invalid value"), "{err}");
    }

    #[test]
    fn rejects_malformed_hash() {
        let mut record = page_fixture();
        record["rawHtmlHash"] = json!("not-a-hash");
        let err = validate(Dataset::Pages, &record).unwrap_err();
        assert!(err.contains("sha-256"), "{err}");
        record["rawHtmlHash"] = json!("a".repeat(64));
        validate(Dataset::Pages, &record).unwrap();
    }

    #[test]
    fn accepts_real_records() {
        validate(Dataset::Pages, &page_fixture()).unwrap();
    }

    fn page_fixture() -> Value {
        json!({
            "url": "https://e.com/",
            "finalUrl": "https://e.com/",
            "statusCode": 200,
            "depth": 0,
            "section": "/",
            "renderMode": "raw",
            "navEndReason": "fetch",
            "fetchMs": 10, "renderMs": 0, "extractMs": 2, "writeMs": 1,
            "robots": { "allowed": true, "overrideUsed": false },
            "counts": { "links": 0, "internalLinks": 0, "externalLinks": 0, "assets": 0, "words": 0 },
            "truncated": false,
            "fetchedAt": "2026-01-01T00:00:00Z",
        })
    }
}
