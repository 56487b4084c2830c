use siteatlas::events::{EventBus, EventPayload, EventType, PageFetchMetadata};
use siteatlas::records::RenderMode;

fn page_fetched(url: &str) -> EventPayload {
    EventPayload::PageFetched {
        url: url.to_string(),
        host: "e.test".to_string(),
        status_code: 200,
        depth: 0,
        metadata: PageFetchMetadata::default(),
    }
}

#[tokio::test]
async fn sequence_numbers_are_monotonic_and_typed_streams_filter() {
    let bus = EventBus::new("crawl-1", 64);
    let mut pages = bus.on(EventType::PageFetched);

    bus.publish(EventPayload::CrawlStarted {
        seeds: vec!["https://e.test/".to_string()],
        mode: RenderMode::Raw,
        out_path: "out.zip".to_string(),
    })
    .await;
    bus.publish(page_fetched("https://e.test/a")).await;
    bus.publish(page_fetched("https://e.test/b")).await;

    let first = pages.recv().await.unwrap();
    let second = pages.recv().await.unwrap();
    assert!(second.seq > first.seq);
    assert_eq!(first.crawl_id, "crawl-1");
    assert_eq!(first.event_type(), EventType::PageFetched);
    match &first.payload {
        EventPayload::PageFetched { url, .. } => assert_eq!(url, "https://e.test/a"),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn late_subscribers_replay_past_events_without_duplicates() {
    let bus = EventBus::new("crawl-2", 64);
    bus.publish(page_fetched("https://e.test/1")).await;
    bus.publish(page_fetched("https://e.test/2")).await;

    // Subscribe after the fact: both events replay, then live events
    // continue with no duplicates in between.
    let mut stream = bus.on_with_replay(EventType::PageFetched);
    bus.publish(page_fetched("https://e.test/3")).await;

    let mut urls = Vec::new();
    for _ in 0..3 {
        let event = stream.recv().await.unwrap();
        if let EventPayload::PageFetched { url, .. } = event.payload {
            urls.push(url);
        }
    }
    assert_eq!(
        urls,
        vec!["https://e.test/1", "https://e.test/2", "https://e.test/3"]
    );

    // A plain subscription sees only what comes after it.
    let mut live_only = bus.on(EventType::PageFetched);
    bus.publish(page_fetched("https://e.test/4")).await;
    let event = live_only.recv().await.unwrap();
    match event.payload {
        EventPayload::PageFetched { url, .. } => assert_eq!(url, "https://e.test/4"),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn replay_is_per_event_type() {
    let bus = EventBus::new("crawl-3", 64);
    bus.publish(page_fetched("https://e.test/a")).await;
    bus.publish(EventPayload::CheckpointSaved { pages_crawled: 1, frontier_remaining: 0 }).await;

    let mut checkpoints = bus.on_with_replay(EventType::CheckpointSaved);
    let event = checkpoints.recv().await.unwrap();
    assert_eq!(event.event_type(), EventType::CheckpointSaved);
    assert!(checkpoints.try_drain().is_empty());
}

#[tokio::test]
async fn events_append_to_the_ndjson_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("logs").join("crawl-x.jsonl");
    let bus = EventBus::with_log_file("crawl-x", 64, log_path.clone())
        .await
        .unwrap();

    bus.publish(page_fetched("https://e.test/a")).await;
    bus.publish(EventPayload::Shutdown {
        reason: siteatlas::CompletionReason::Manual,
    })
    .await;

    let content = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["crawlId"], "crawl-x");
        assert!(value["seq"].as_u64().unwrap() > 0);
        assert!(value["timestamp"].as_str().is_some());
    }
    let last: serde_json::Value =
        serde_json::from_str(content.lines().last().unwrap()).unwrap();
    assert_eq!(last["type"], "crawl.shutdown");
    assert_eq!(last["reason"], "manual");
}
