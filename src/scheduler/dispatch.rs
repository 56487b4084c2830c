//! The per-page dispatch pipeline: robots → rate tokens → fetch/render →
//! hash/blob → extract → write records → enqueue discoveries.
//!
//! Nothing in here fails the crawl directly; failures become error records
//! and best-effort page records. Writer poisoning is flagged on the core
//! for the worker loop to escalate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, warn};

use super::SchedulerCore;
use crate::archive::WriteError;
use crate::error::{ErrorKind, ErrorPhase};
use crate::events::{EventPayload, PageFetchMetadata, Stage};
use crate::extractors::{self, DomSource, PageExtract};
use crate::frontier::FrontierEntry;
use crate::records::{
    AccessibilityRecord, AssetRecord, Dataset, EdgeRecord, ErrorRecord, ExtractedCounts,
    NavEndReason, PageRecord, RedirectHop, RenderMode, RobotsVerdict,
};
use crate::renderer::SubresourceKind;
use crate::urlnorm;

/// Everything acquired for one page before extraction.
struct Acquired {
    final_url: String,
    status: u16,
    body: Option<Vec<u8>>,
    headers: Option<HashMap<String, String>>,
    content_type: Option<String>,
    redirect_chain: Vec<RedirectHop>,
    nav_end_reason: NavEndReason,
    fetch_ms: u64,
    render_ms: u64,
    truncated: bool,
    rendered_a11y: Option<crate::renderer::RenderedAccessibility>,
    subresources: Vec<crate::renderer::CapturedResource>,
    screenshot: Option<Vec<u8>>,
    /// Error to record alongside the page (HTTP/transport/cap failures).
    failure: Option<(ErrorPhase, ErrorKind, String, String)>,
}

/// Process one frontier entry end to end. Returns true when a page record
/// was emitted; robots-blocked and cancel-requeued entries return false so
/// the scheduler's `maxPages` accounting only counts real pages.
pub(super) async fn process_entry(core: &Arc<SchedulerCore>, entry: FrontierEntry) -> bool {
    let url = entry.url_key.clone();
    let host = urlnorm::host_of(&url).unwrap_or_default();

    // (3) robots
    let verdict = core.robots.allows(&url).await;
    if let Some(failure) = core.robots.take_fetch_failure(&url) {
        record_error(
            core,
            &url,
            ErrorPhase::Fetch,
            ErrorKind::Network,
            "robots_fetch",
            &failure,
        )
        .await;
    }
    if !verdict.allowed {
        record_error(
            core,
            &url,
            ErrorPhase::Fetch,
            ErrorKind::RobotsBlocked,
            "robots_disallow",
            &format!(
                "blocked by {}",
                verdict.matched_rule.as_deref().unwrap_or("robots.txt")
            ),
        )
        .await;
        return false;
    }

    // (4) global then per-host tokens; both cancellable.
    if !core.governor.acquire_rate(&host, &core.cancel).await {
        core.frontier.requeue(entry).await;
        return false;
    }

    // (5) fetch or render per mode.
    let acquired = acquire_body(core, &url).await;

    // (6) hash the body and store the blob.
    let (raw_html_hash, body_blob_ref, body_bytes_len) = match &acquired.body {
        Some(body) if !body.is_empty() => {
            match core.archive.blobs().store(body.clone()).await {
                Ok(stored) => {
                    core.metrics.add_bytes_written(stored.compressed_size);
                    (Some(stored.hash), Some(stored.blob_ref), body.len())
                }
                Err(e) => {
                    record_error(
                        core,
                        &url,
                        ErrorPhase::Write,
                        ErrorKind::Write,
                        "blob_store",
                        &e.to_string(),
                    )
                    .await;
                    (None, None, body.len())
                }
            }
        }
        _ => (None, None, 0),
    };

    // (7) extractors, off the async runtime.
    let extract_started = Instant::now();
    let extract = run_extractors(core, &acquired, &url).await;
    let extract_ms = extract_started.elapsed().as_millis() as u64;

    // Capture-side blobs (full mode).
    store_subresources(core, &acquired, &url).await;
    if let Some(png) = &acquired.screenshot {
        if let Err(e) = core.archive.blobs().store_raw(png.clone(), "png").await {
            debug!(url, error = %e, "screenshot blob store failed");
        }
    }

    // (8) write records: derived first, then the page carrying the write
    // timing of everything that preceded it.
    let write_started = Instant::now();

    if let Some((phase, kind, code, message)) = &acquired.failure {
        record_error(core, &url, *phase, *kind, code, message).await;
    }
    for issue in extract.as_ref().map(|e| e.issues.as_slice()).unwrap_or_default() {
        record_error(
            core,
            &url,
            ErrorPhase::Extract,
            ErrorKind::Extract,
            issue.extractor,
            &issue.message,
        )
        .await;
    }

    let (edges, assets, a11y) = build_derived_records(core, &acquired, &extract, &url);

    let edges_writer = core.archive.writer(Dataset::Edges);
    for edge in &edges {
        write_or_escalate(core, &url, &edges_writer, edge).await;
    }
    let assets_writer = core.archive.writer(Dataset::Assets);
    for asset in &assets {
        write_or_escalate(core, &url, &assets_writer, asset).await;
    }
    if let Some(a11y) = &a11y {
        let a11y_writer = core.archive.writer(Dataset::Accessibility);
        write_or_escalate(core, &url, &a11y_writer, a11y).await;
    }

    let write_ms = write_started.elapsed().as_millis() as u64;
    let mut page = build_page_record(
        core,
        &entry,
        &acquired,
        &extract,
        raw_html_hash,
        body_blob_ref,
        extract_ms,
    );
    page.robots = verdict;
    page.write_ms = write_ms;
    let pages_writer = core.archive.writer(Dataset::Pages);
    write_or_escalate(core, &url, &pages_writer, &page).await;

    // (11) metrics and the page event.
    core.metrics.add_page();
    core.metrics.add_edges(edges.len() as u64);
    core.metrics.add_assets(assets.len() as u64);
    core.metrics.record_stage(Stage::Fetch, acquired.fetch_ms);
    if acquired.render_ms > 0 {
        core.metrics.record_stage(Stage::Render, acquired.render_ms);
    }
    core.metrics.record_stage(Stage::Extract, extract_ms);
    core.metrics.record_stage(Stage::Write, write_ms);

    core.bus
        .publish(EventPayload::PageFetched {
            url: url.clone(),
            host,
            status_code: acquired.status,
            depth: entry.depth,
            metadata: PageFetchMetadata {
                html_size: body_bytes_len,
                links_found: edges.len(),
                fetch_ms: acquired.fetch_ms,
                render_ms: acquired.render_ms,
                extract_ms,
                write_ms,
            },
        })
        .await;

    // (9) enqueue discoveries.
    enqueue_discoveries(core, &entry, &edges).await;
    true
}

async fn acquire_body(core: &Arc<SchedulerCore>, url: &str) -> Acquired {
    match core.config.mode() {
        RenderMode::Raw => {
            match core.fetcher.fetch(url, &core.abort).await {
                Ok(outcome) => {
                    let content_type = outcome
                        .headers
                        .get("content-type")
                        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
                    let failure = if outcome.status >= 400 {
                        Some((
                            ErrorPhase::Fetch,
                            ErrorKind::Network,
                            format!("http_{}", outcome.status),
                            format!("HTTP {} for {url}", outcome.status),
                        ))
                    } else if outcome.truncated {
                        Some((
                            ErrorPhase::Fetch,
                            ErrorKind::CapExceeded,
                            "byte_cap".to_string(),
                            "response body exceeded the byte cap".to_string(),
                        ))
                    } else {
                        None
                    };
                    Acquired {
                        final_url: outcome.final_url,
                        status: outcome.status,
                        body: Some(outcome.body),
                        headers: Some(outcome.headers),
                        content_type,
                        redirect_chain: outcome.redirect_chain,
                        nav_end_reason: NavEndReason::Fetch,
                        fetch_ms: outcome.fetch_ms,
                        render_ms: 0,
                        truncated: outcome.truncated,
                        rendered_a11y: None,
                        subresources: Vec::new(),
                        screenshot: None,
                        failure,
                    }
                }
                Err(failure) => Acquired {
                    final_url: url.to_string(),
                    status: 0,
                    body: None,
                    headers: None,
                    content_type: None,
                    redirect_chain: Vec::new(),
                    nav_end_reason: if failure.kind == ErrorKind::Timeout {
                        NavEndReason::Timeout
                    } else {
                        NavEndReason::Error
                    },
                    fetch_ms: failure.fetch_ms,
                    render_ms: 0,
                    truncated: false,
                    rendered_a11y: None,
                    subresources: Vec::new(),
                    screenshot: None,
                    failure: Some((
                        ErrorPhase::Fetch,
                        failure.kind,
                        failure.code,
                        failure.message,
                    )),
                },
            }
        }
        RenderMode::Prerender | RenderMode::Full => {
            let Some(renderer) = core.renderer.get() else {
                return Acquired {
                    final_url: url.to_string(),
                    status: 0,
                    body: None,
                    headers: None,
                    content_type: None,
                    redirect_chain: Vec::new(),
                    nav_end_reason: NavEndReason::Error,
                    fetch_ms: 0,
                    render_ms: 0,
                    truncated: false,
                    rendered_a11y: None,
                    subresources: Vec::new(),
                    screenshot: None,
                    failure: Some((
                        ErrorPhase::Render,
                        ErrorKind::Render,
                        "no_renderer".to_string(),
                        "renderer unavailable".to_string(),
                    )),
                };
            };
            match renderer.render(url, &core.abort).await {
                Ok(outcome) => {
                    for warning in &outcome.warnings {
                        debug!(url, warning = %warning, "render warning");
                    }
                    let failure = if outcome.truncated {
                        Some((
                            ErrorPhase::Render,
                            ErrorKind::CapExceeded,
                            "resource_caps".to_string(),
                            format!(
                                "navigation aborted after {} requests / {} bytes",
                                outcome.requests_seen, outcome.bytes_seen
                            ),
                        ))
                    } else if outcome.status >= 400 {
                        Some((
                            ErrorPhase::Render,
                            ErrorKind::Network,
                            format!("http_{}", outcome.status),
                            format!("HTTP {} for {url}", outcome.status),
                        ))
                    } else {
                        None
                    };
                    Acquired {
                        final_url: outcome.final_url,
                        status: outcome.status,
                        body: (!outcome.html.is_empty())
                            .then(|| outcome.html.clone().into_bytes()),
                        headers: None,
                        content_type: Some("text/html".to_string()),
                        redirect_chain: Vec::new(),
                        nav_end_reason: outcome.nav_end_reason,
                        fetch_ms: 0,
                        render_ms: outcome.render_ms,
                        truncated: outcome.truncated,
                        rendered_a11y: outcome.accessibility,
                        subresources: outcome.subresources,
                        screenshot: outcome.screenshot,
                        failure,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    let timed_out = message.to_lowercase().contains("timeout");
                    Acquired {
                        final_url: url.to_string(),
                        status: 0,
                        body: None,
                        headers: None,
                        content_type: None,
                        redirect_chain: Vec::new(),
                        nav_end_reason: if timed_out {
                            NavEndReason::Timeout
                        } else {
                            NavEndReason::Error
                        },
                        fetch_ms: 0,
                        render_ms: 0,
                        truncated: false,
                        rendered_a11y: None,
                        subresources: Vec::new(),
                        screenshot: None,
                        failure: Some((
                            ErrorPhase::Render,
                            if timed_out { ErrorKind::Timeout } else { ErrorKind::Render },
                            "render_failed".to_string(),
                            message,
                        )),
                    }
                }
            }
        }
    }
}

/// Run the extractor suite off the runtime; returns None when there is no
/// HTML to extract from.
async fn run_extractors(
    core: &Arc<SchedulerCore>,
    acquired: &Acquired,
    url: &str,
) -> Option<PageExtract> {
    let is_html = acquired
        .content_type
        .as_deref()
        .is_none_or(|ct| ct.contains("html"));
    let body = acquired.body.as_ref()?;
    if !is_html || body.is_empty() {
        return None;
    }

    let html = String::from_utf8_lossy(body).into_owned();
    let base = url::Url::parse(&acquired.final_url)
        .or_else(|_| url::Url::parse(url))
        .ok()?;
    let dom_source = match core.config.mode() {
        RenderMode::Raw => DomSource::Raw,
        _ => DomSource::Rendered,
    };
    let headers = acquired.headers.clone();

    match tokio::task::spawn_blocking(move || {
        extractors::extract_all(&html, &base, dom_source, headers.as_ref())
    })
    .await
    {
        Ok(extract) => Some(extract),
        Err(e) => {
            warn!(url, error = %e, "extractor task panicked");
            None
        }
    }
}

fn build_page_record(
    core: &Arc<SchedulerCore>,
    entry: &FrontierEntry,
    acquired: &Acquired,
    extract: &Option<PageExtract>,
    raw_html_hash: Option<String>,
    body_blob_ref: Option<String>,
    extract_ms: u64,
) -> PageRecord {
    let url = &entry.url_key;
    let seo = extract.as_ref().and_then(|e| e.seo.clone());
    let counts = match extract {
        Some(e) => {
            let external = e.links.iter().filter(|l| l.is_external).count() as u32;
            ExtractedCounts {
                links: e.links.len() as u32,
                internal_links: e.links.len() as u32 - external,
                external_links: external,
                assets: e.assets.len() as u32,
                words: seo.as_ref().map_or(0, |s| s.word_count),
            }
        }
        None => ExtractedCounts::default(),
    };
    let assets_truncated = extract.as_ref().is_some_and(|e| e.assets_truncated);

    PageRecord {
        url: url.clone(),
        final_url: acquired.final_url.clone(),
        status_code: acquired.status,
        content_type: acquired.content_type.clone(),
        depth: entry.depth,
        section: urlnorm::section_of(url),
        render_mode: core.config.mode(),
        nav_end_reason: acquired.nav_end_reason,
        fetch_ms: acquired.fetch_ms,
        render_ms: acquired.render_ms,
        extract_ms,
        write_ms: 0,
        raw_html_hash,
        body_blob_ref,
        title: seo.as_ref().and_then(|s| s.title.clone()),
        meta_description: seo.as_ref().and_then(|s| s.meta_description.clone()),
        h1: seo.as_ref().and_then(|s| s.headings[0].first_text.clone()),
        canonical_url: seo.as_ref().and_then(|s| s.canonical_url.clone()),
        robots: RobotsVerdict::allow_all(),
        redirect_chain: acquired.redirect_chain.clone(),
        counts,
        truncated: acquired.truncated || assets_truncated,
        discovered_from: entry.discovered_from.clone(),
        seo,
        social: extract.as_ref().and_then(|e| e.social.clone()),
        schema_org: extract.as_ref().and_then(|e| e.schema_org.clone()),
        text_sample: extract.as_ref().and_then(|e| e.text_sample.clone()),
        fetched_at: chrono::Utc::now(),
    }
}

fn build_derived_records(
    core: &Arc<SchedulerCore>,
    acquired: &Acquired,
    extract: &Option<PageExtract>,
    url: &str,
) -> (Vec<EdgeRecord>, Vec<AssetRecord>, Option<AccessibilityRecord>) {
    let Some(extract) = extract else {
        return (Vec::new(), Vec::new(), None);
    };
    let mode = core.config.mode();

    let edges = extract
        .links
        .iter()
        .map(|link| EdgeRecord {
            source_url: url.to_string(),
            target_url: link.target_url.clone(),
            selector_hint: link.selector_hint.clone(),
            anchor_text: link.anchor_text.clone(),
            rel: link.rel.clone(),
            nofollow: link.nofollow,
            sponsored: link.sponsored,
            ugc: link.ugc,
            is_external: link.is_external,
            location: link.location,
            discovered_in_mode: mode,
        })
        .collect();

    let assets = extract
        .assets
        .iter()
        .map(|asset| AssetRecord {
            page_url: url.to_string(),
            asset_url: asset.asset_url.clone(),
            asset_type: asset.asset_type,
            alt: asset.alt.clone(),
            has_alt: asset.has_alt,
            loading: asset.loading.clone(),
            was_lazy_loaded: asset.was_lazy_loaded,
        })
        .collect();

    let a11y = extract.accessibility.as_ref().map(|a| {
        let rendered = acquired.rendered_a11y.as_ref();
        AccessibilityRecord {
            page_url: url.to_string(),
            landmarks: a.landmarks,
            heading_order: a.heading_order.clone(),
            heading_order_valid: a.heading_order_valid,
            role_histogram: a.role_histogram.clone(),
            missing_alt_count: a.missing_alt_count,
            missing_alt_samples: a.missing_alt_samples.clone(),
            contrast_violations: rendered.map(|r| r.contrast_violations.clone()),
            skip_link: rendered.map(|r| r.skip_link.clone()),
            keyboard_traps: rendered.map(|r| r.keyboard_traps.clone()),
            media: rendered.map(|r| r.media.clone()),
        }
    });

    (edges, assets, a11y)
}

async fn store_subresources(core: &Arc<SchedulerCore>, acquired: &Acquired, url: &str) {
    for resource in &acquired.subresources {
        let result = match resource.kind {
            SubresourceKind::Image => {
                let ext = match resource.mime_type.as_str() {
                    "image/png" => "png",
                    "image/jpeg" => "jpg",
                    "image/gif" => "gif",
                    "image/webp" => "webp",
                    "image/svg+xml" => "svg",
                    _ => "bin",
                };
                core.archive.blobs().store_raw(resource.body.clone(), ext).await
            }
            _ => core.archive.blobs().store(resource.body.clone()).await,
        };
        match result {
            Ok(stored) => core.metrics.add_bytes_written(stored.compressed_size),
            Err(e) => {
                debug!(url, resource = %resource.url, error = %e, "subresource blob store failed");
            }
        }
    }
}

async fn enqueue_discoveries(
    core: &Arc<SchedulerCore>,
    entry: &FrontierEntry,
    edges: &[EdgeRecord],
) {
    let next_depth = entry.depth + 1;
    if let Some(max_depth) = core.config.effective_max_depth()
        && next_depth > max_depth
    {
        return;
    }

    for edge in edges {
        if edge.nofollow {
            continue;
        }
        let key = urlnorm::url_key(
            &edge.target_url,
            core.config.normalize_options(),
            core.config.param_policy(),
            core.config.param_block_list(),
            &core.sampler,
        );
        if !core.config.allow_private_ips() && urlnorm::is_private_ip(&key) {
            continue;
        }
        if core.config.is_excluded(&key) {
            continue;
        }
        // Edges are recorded for external targets; enqueueing is gated on
        // the crawl roots.
        let internal_to_roots = url::Url::parse(&key)
            .map(|u| core.seed_origins.contains(&u.origin()))
            .unwrap_or(false);
        if !internal_to_roots && !core.config.follow_external() {
            continue;
        }

        core.frontier
            .enqueue(FrontierEntry {
                url_key: key,
                original_url: edge.target_url.clone(),
                depth: next_depth,
                discovered_from: Some(entry.url_key.clone()),
                discovered_in_mode: core.config.mode(),
            })
            .await;
    }
}

pub(super) async fn record_error(
    core: &Arc<SchedulerCore>,
    url: &str,
    phase: ErrorPhase,
    kind: ErrorKind,
    code: &str,
    message: &str,
) {
    let record = ErrorRecord {
        url: url.to_string(),
        origin: origin_of(url),
        hostname: urlnorm::host_of(url).unwrap_or_default(),
        phase,
        kind,
        code: code.to_string(),
        message: message.to_string(),
        occurred_at: chrono::Utc::now(),
    };
    let writer = core.archive.writer(Dataset::Errors);
    if let Err(e) = writer.write(&record).await {
        match e {
            WriteError::Poisoned => {
                core.poisoned.store(true, Ordering::SeqCst);
                core.cancel.cancel();
            }
            other => warn!(url, error = %other, "failed to write error record"),
        }
    }
    core.metrics.add_error();
    core.bus
        .publish(EventPayload::ErrorOccurred {
            url: url.to_string(),
            kind,
            phase,
            message: message.to_string(),
        })
        .await;
}

async fn write_or_escalate<T: serde::Serialize>(
    core: &Arc<SchedulerCore>,
    url: &str,
    writer: &Arc<crate::archive::DatasetWriter>,
    record: &T,
) {
    match writer.write(record).await {
        Ok(()) => {}
        Err(WriteError::Validation(reason)) => {
            record_error(
                core,
                url,
                ErrorPhase::Write,
                ErrorKind::Validation,
                writer.dataset().name(),
                &reason,
            )
            .await;
        }
        Err(WriteError::Poisoned) => {
            core.poisoned.store(true, Ordering::SeqCst);
            core.cancel.cancel();
        }
        Err(WriteError::Io(message)) => {
            warn!(url, error = %message, "dataset write I/O error");
            core.poisoned.store(true, Ordering::SeqCst);
            core.cancel.cancel();
        }
    }
}

fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => {
            let host = u.host_str().unwrap_or_default();
            match u.port() {
                Some(port) => format!("{}://{host}:{port}", u.scheme()),
                None => format!("{}://{host}", u.scheme()),
            }
        }
        Err(_) => String::new(),
    }
}
