use chrono::Utc;
use siteatlas::archive::dataset::{self, RotationPolicy};
use siteatlas::archive::{
    ArchiveSummary, ArchiveWriter, Capability, DatasetWriter, FinalizeOptions, PrivacyPolicy,
    RobotsPolicyInfo, WriteError,
};
use siteatlas::events::CompletionReason;
use siteatlas::records::{Dataset, ErrorRecord, RenderMode};
use siteatlas::error::{ErrorKind, ErrorPhase};
use std::io::Read;

fn error_record(n: u32) -> ErrorRecord {
    ErrorRecord {
        url: format!("https://e.test/{n}"),
        origin: "https://e.test".to_string(),
        hostname: "e.test".to_string(),
        phase: ErrorPhase::Fetch,
        kind: ErrorKind::Network,
        code: "connect".to_string(),
        message: "connection refused".to_string(),
        occurred_at: Utc::now(),
    }
}

fn summary(crawl_id: &str) -> ArchiveSummary {
    ArchiveSummary {
        crawl_id: crawl_id.to_string(),
        mode: RenderMode::Raw,
        seeds: vec!["https://e.test/".to_string()],
        pages: 0,
        edges: 0,
        assets: 0,
        errors: 3,
        accessibility_records: 0,
        bytes_written: 0,
        completion_reason: CompletionReason::Finished,
        started_at: Utc::now(),
        finished_at: Utc::now(),
        duration_ms: 1,
        notes: vec![],
    }
}

fn options() -> FinalizeOptions {
    FinalizeOptions {
        mode: RenderMode::Raw,
        seeds: vec!["https://e.test/".to_string()],
        capabilities: Capability::for_mode(RenderMode::Raw, false),
        robots_policy: RobotsPolicyInfo { respect: true, overrides_used: 0 },
        privacy_policy: PrivacyPolicy::default(),
        owner: "tests".to_string(),
        notes: vec![],
        incomplete: false,
    }
}

#[tokio::test]
async fn dataset_writer_round_trips_records() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DatasetWriter::init(
        Dataset::Errors,
        dir.path(),
        RotationPolicy::default(),
        3,
    )
    .await
    .unwrap();

    let records: Vec<_> = (0..5).map(error_record).collect();
    for record in &records {
        writer.write(record).await.unwrap();
    }
    writer.finalize().await.unwrap();

    let parts = dataset::part_files(&dir.path().join("errors")).unwrap();
    assert_eq!(parts.len(), 1);
    let values = dataset::read_part_file(&parts[0]).unwrap();
    assert_eq!(values.len(), 5);
    let read_back: ErrorRecord = serde_json::from_value(values[2].clone()).unwrap();
    assert_eq!(read_back, records[2]);
}

#[tokio::test]
async fn writer_rejects_invalid_records_without_dropping_silently() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DatasetWriter::init(
        Dataset::Edges,
        dir.path(),
        RotationPolicy::default(),
        3,
    )
    .await
    .unwrap();

    let bogus = serde_json::json!({ "sourceUrl": "https://a/" });
    let err = writer.write(&bogus).await.unwrap_err();
    assert!(matches!(err, WriteError::Validation(_)));
    assert_eq!(writer.total_records().await, 0);
}

#[tokio::test]
async fn record_count_rotation_produces_multiple_parts() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DatasetWriter::init(
        Dataset::Errors,
        dir.path(),
        RotationPolicy { max_bytes: 0, max_records: 2 },
        3,
    )
    .await
    .unwrap();

    for n in 0..5 {
        writer.write(&error_record(n)).await.unwrap();
    }
    let metadata = writer.finalize().await.unwrap();
    assert_eq!(metadata.record_count, 5);
    assert_eq!(metadata.parts, 3);

    let parts = dataset::part_files(&dir.path().join("errors")).unwrap();
    assert_eq!(parts.len(), 3);
    // Parts are sealed, numbered lexicographically, and each holds valid
    // LF-terminated JSON lines.
    for part in &parts {
        assert!(part.to_string_lossy().ends_with(".jsonl.zst"));
        let values = dataset::read_part_file(part).unwrap();
        assert!(!values.is_empty());
    }
}

#[tokio::test]
async fn finalize_packs_a_verifiable_container() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("site.atlas.zip");
    let writer = ArchiveWriter::init(out.clone(), "crawl-test", RotationPolicy::default(), 3)
        .await
        .unwrap();

    for n in 0..3 {
        writer
            .writer(Dataset::Errors)
            .write(&error_record(n))
            .await
            .unwrap();
    }
    let body = b"<html><body>hello</body></html>".to_vec();
    let stored = writer.blobs().store(body.clone()).await.unwrap();

    let manifest = writer
        .finalize(&summary("crawl-test"), options())
        .await
        .unwrap();

    // Staging is cleaned up after a complete finalize.
    assert!(!writer.staging().exists());
    assert!(out.exists());

    // Manifest content checks.
    assert_eq!(manifest.datasets["errors"].record_count, 3);
    assert!(manifest.datasets["errors"].present);
    assert!(!manifest.datasets["pages"].present);
    assert!(manifest.capabilities.contains(&Capability::SeoCore));
    assert!(!manifest.capabilities.contains(&Capability::RenderDom));
    assert!(!manifest.incomplete);
    assert_eq!(manifest.storage.compression.algorithm, "zstd");

    // Open the container and compare members against the integrity map.
    let file = std::fs::File::open(&out).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();

    assert!(names.contains(&"manifest.json".to_string()));
    assert!(names.contains(&"summary.json".to_string()));
    assert!(names.contains(&"errors/part-000.jsonl.zst".to_string()));
    assert!(names.contains(&"schemas/pages.schema.json".to_string()));
    let blob_member = format!("blobs/{}", stored.blob_ref);
    assert!(names.contains(&blob_member));

    // Every member except the manifest appears in integrity.files exactly
    // once, and vice versa.
    let mut expected: Vec<String> = manifest.integrity.files.keys().cloned().collect();
    expected.push("manifest.json".to_string());
    expected.sort();
    assert_eq!(names, expected);

    // The blob member is stored (not recompressed) and round-trips.
    {
        let mut member = archive.by_name(&blob_member).unwrap();
        assert_eq!(member.compression(), zip::CompressionMethod::Stored);
        let mut compressed = Vec::new();
        member.read_to_end(&mut compressed).unwrap();
        let decoded = zstd::stream::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(decoded, body);
    }

    // JSON members are deflated.
    let member = archive.by_name("manifest.json").unwrap();
    assert_eq!(member.compression(), zip::CompressionMethod::Deflated);
}

#[tokio::test]
async fn blob_hash_addresses_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("x.atlas.zip");
    let writer = ArchiveWriter::init(out, "crawl-blob", RotationPolicy::default(), 3)
        .await
        .unwrap();
    let store = writer.blobs();

    let stored = store.store(b"content".to_vec()).await.unwrap();
    assert!(store.has(&stored.hash));
    let loaded = store.load(&stored.blob_ref).await.unwrap();
    assert_eq!(loaded, b"content");

    let again = store.store(b"content".to_vec()).await.unwrap();
    assert!(again.deduplicated);
    assert_eq!(store.stats().total_blobs, 1);
    assert_eq!(store.stats().deduplication_hits, 1);
}
