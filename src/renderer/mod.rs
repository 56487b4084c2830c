//! Headless-browser renderer for prerender/full modes.
//!
//! One browser process serves the whole crawl; each navigation gets a fresh
//! page that is closed on every exit path. Per-page request/byte caps are
//! enforced while waiting for the configured condition; exceeding them
//! stops loading and marks the page truncated. Browser-level failures are
//! retried once before surfacing.

pub mod browser;

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCookiesParams, EventResponseReceived, GetResponseBodyParams, RequestId,
    ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, StopLoadingParams,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FailureClass;
use crate::records::{ContrastViolation, MediaAccessibility, NavEndReason, SkipLinkCheck};
use crate::runtime::CancelHandle;

/// Network considered idle after this long without a response event.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitCondition {
    #[default]
    Load,
    NetworkIdle,
}

#[derive(Debug, Clone)]
pub struct RenderLimits {
    pub timeout: Duration,
    pub wait: WaitCondition,
    pub max_requests: u32,
    pub max_total_bytes: u64,
    pub capture_subresources: bool,
    pub persist_session: bool,
    pub screenshots: bool,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            wait: WaitCondition::Load,
            max_requests: 250,
            max_total_bytes: 20 * 1024 * 1024,
            capture_subresources: false,
            persist_session: false,
            screenshots: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubresourceKind {
    Css,
    Js,
    Font,
    Image,
}

/// A captured subresource body (full mode).
#[derive(Debug, Clone)]
pub struct CapturedResource {
    pub url: String,
    pub kind: SubresourceKind,
    pub mime_type: String,
    pub body: Vec<u8>,
}

/// Results of the in-page accessibility probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderedAccessibility {
    pub contrast_violations: Vec<ContrastViolation>,
    pub skip_link: SkipLinkCheck,
    pub keyboard_traps: Vec<String>,
    pub media: Vec<MediaAccessibility>,
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub final_url: String,
    /// 0 when no document response was observed.
    pub status: u16,
    pub html: String,
    pub nav_end_reason: NavEndReason,
    pub render_ms: u64,
    pub truncated: bool,
    pub requests_seen: u32,
    pub bytes_seen: u64,
    pub subresources: Vec<CapturedResource>,
    pub accessibility: Option<RenderedAccessibility>,
    pub screenshot: Option<Vec<u8>>,
    /// Non-fatal problems encountered along the way.
    pub warnings: Vec<String>,
}

struct NetWatch {
    requests: AtomicU32,
    bytes: AtomicU64,
    last_activity: Mutex<Instant>,
    main_response: Mutex<Option<(u16, String)>>,
    resources: Mutex<Vec<(RequestId, String, String, ResourceType)>>,
}

impl NetWatch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            main_response: Mutex::new(None),
            resources: Mutex::new(Vec::new()),
        })
    }

    fn over_caps(&self, limits: &RenderLimits) -> bool {
        self.requests.load(Ordering::Relaxed) > limits.max_requests
            || self.bytes.load(Ordering::Relaxed) > limits.max_total_bytes
    }
}

pub struct Renderer {
    browser: tokio::sync::Mutex<chromiumoxide::Browser>,
    handler_task: JoinHandle<()>,
    limits: RenderLimits,
}

impl Renderer {
    /// Launch the browser this crawl will render with.
    pub async fn open(
        limits: RenderLimits,
        headless: bool,
        user_agent: &str,
        user_data_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let (browser, handler_task) =
            browser::launch_browser(headless, user_data_dir, user_agent).await?;
        Ok(Self { browser: tokio::sync::Mutex::new(browser), handler_task, limits })
    }

    /// Navigate and capture one page. Browser-level failures are retried
    /// once when the classification says a retry can help.
    pub async fn render(
        &self,
        url: &str,
        cancel: &CancelHandle,
    ) -> anyhow::Result<RenderOutcome> {
        match self.render_once(url, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(first) => {
                if cancel.is_cancelled() || !FailureClass::classify(&first).is_retryable() {
                    return Err(first);
                }
                debug!(url, error = %first, "render failed, retrying once");
                self.render_once(url, cancel).await
            }
        }
    }

    async fn render_once(
        &self,
        url: &str,
        cancel: &CancelHandle,
    ) -> anyhow::Result<RenderOutcome> {
        let started = Instant::now();
        let page = {
            let browser = self.browser.lock().await;
            browser.new_page("about:blank").await?
        };

        let result = self.drive_page(&page, url, cancel, &started).await;

        // Dispose the context on every exit path.
        if !self.limits.persist_session
            && let Err(e) = page.execute(ClearBrowserCookiesParams::default()).await
        {
            debug!(error = %e, "failed to clear cookies after navigation");
        }
        if let Err(e) = page.clone().close().await {
            debug!(error = %e, "failed to close page");
        }

        result
    }

    async fn drive_page(
        &self,
        page: &Page,
        url: &str,
        cancel: &CancelHandle,
        started: &Instant,
    ) -> anyhow::Result<RenderOutcome> {
        let limits = &self.limits;
        let watch = NetWatch::new();
        let mut warnings = Vec::new();

        // Attach the response listener before navigation starts so the
        // document response cannot be missed.
        let mut events = page.event_listener::<EventResponseReceived>().await?;
        let listener = Arc::clone(&watch);
        let listen_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                listener.requests.fetch_add(1, Ordering::Relaxed);
                let encoded = event.response.encoded_data_length.max(0.0) as u64;
                listener.bytes.fetch_add(encoded, Ordering::Relaxed);
                *listener.last_activity.lock() = Instant::now();

                if event.r#type == ResourceType::Document {
                    let mut main = listener.main_response.lock();
                    if main.is_none() {
                        *main = Some((
                            event.response.status as u16,
                            event.response.url.clone(),
                        ));
                    }
                }
                listener.resources.lock().push((
                    event.request_id.clone(),
                    event.response.url.clone(),
                    event.response.mime_type.clone(),
                    event.r#type.clone(),
                ));
            }
        });

        let deadline = *started + limits.timeout;
        let mut truncated = false;

        let nav_end_reason = 'nav: {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let goto = tokio::time::timeout(remaining, page.goto(url));
            match goto.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    listen_task.abort();
                    return Err(anyhow::anyhow!("navigation failed: {e}"));
                }
                Err(_) => break 'nav NavEndReason::Timeout,
            }

            // Wait for the configured condition, policing caps as we go.
            let caps_watch = Arc::clone(&watch);
            let caps_exceeded = async {
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if caps_watch.over_caps(limits) {
                        return;
                    }
                }
            };
            let remaining = deadline.saturating_duration_since(Instant::now());

            match limits.wait {
                WaitCondition::Load => {
                    tokio::select! {
                        result = page.wait_for_navigation() => {
                            if let Err(e) = result {
                                warnings.push(format!("load wait: {e}"));
                            }
                            NavEndReason::Load
                        }
                        _ = tokio::time::sleep(remaining) => NavEndReason::Timeout,
                        _ = caps_exceeded => {
                            truncated = true;
                            NavEndReason::Error
                        }
                        _ = cancel.cancelled() => NavEndReason::Timeout,
                    }
                }
                WaitCondition::NetworkIdle => {
                    let idle_watch = Arc::clone(&watch);
                    let idle = async {
                        loop {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            let last = *idle_watch.last_activity.lock();
                            if last.elapsed() >= NETWORK_IDLE_WINDOW {
                                return;
                            }
                        }
                    };
                    tokio::select! {
                        _ = idle => NavEndReason::NetworkIdle,
                        _ = tokio::time::sleep(remaining) => NavEndReason::Timeout,
                        _ = caps_exceeded => {
                            truncated = true;
                            NavEndReason::Error
                        }
                        _ = cancel.cancelled() => NavEndReason::Timeout,
                    }
                }
            }
        };

        if truncated {
            // Abort whatever is still loading; the snapshot below is
            // best-effort over what arrived.
            if let Err(e) = page.execute(StopLoadingParams::default()).await {
                warnings.push(format!("stop loading: {e}"));
            }
        }

        // DOM snapshot, best-effort even after timeout.
        let html = match tokio::time::timeout(Duration::from_secs(5), page.content()).await {
            Ok(Ok(html)) => html,
            Ok(Err(e)) => {
                warnings.push(format!("dom snapshot: {e}"));
                String::new()
            }
            Err(_) => {
                warnings.push("dom snapshot timed out".to_string());
                String::new()
            }
        };

        let final_url = match page.url().await {
            Ok(Some(u)) => u,
            _ => url.to_string(),
        };
        let (status, _) = watch
            .main_response
            .lock()
            .clone()
            .unwrap_or((0, final_url.clone()));

        let accessibility = match self.probe_accessibility(page).await {
            Ok(a11y) => Some(a11y),
            Err(e) => {
                warnings.push(format!("a11y probe: {e}"));
                None
            }
        };

        let subresources = if limits.capture_subresources && !html.is_empty() {
            self.capture_subresources(page, &watch, &mut warnings).await
        } else {
            Vec::new()
        };

        let screenshot = if limits.screenshots {
            match page
                .screenshot(CaptureScreenshotParams {
                    format: Some(CaptureScreenshotFormat::Png),
                    capture_beyond_viewport: Some(true),
                    ..Default::default()
                })
                .await
            {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warnings.push(format!("screenshot: {e}"));
                    None
                }
            }
        } else {
            None
        };

        listen_task.abort();

        Ok(RenderOutcome {
            final_url,
            status,
            html,
            nav_end_reason,
            render_ms: started.elapsed().as_millis() as u64,
            truncated,
            requests_seen: watch.requests.load(Ordering::Relaxed),
            bytes_seen: watch.bytes.load(Ordering::Relaxed),
            subresources,
            accessibility,
            screenshot,
            warnings,
        })
    }

    async fn capture_subresources(
        &self,
        page: &Page,
        watch: &NetWatch,
        warnings: &mut Vec<String>,
    ) -> Vec<CapturedResource> {
        let resources = watch.resources.lock().clone();
        let mut captured = Vec::new();

        for (request_id, url, mime_type, resource_type) in resources {
            let kind = match resource_type {
                ResourceType::Stylesheet => SubresourceKind::Css,
                ResourceType::Script => SubresourceKind::Js,
                ResourceType::Font => SubresourceKind::Font,
                ResourceType::Image => SubresourceKind::Image,
                _ => continue,
            };
            if captured.len() as u32 >= self.limits.max_requests {
                break;
            }
            match page.execute(GetResponseBodyParams::new(request_id)).await {
                Ok(response) => {
                    let body = if response.base64_encoded {
                        use base64::Engine as _;
                        match base64::engine::general_purpose::STANDARD.decode(&response.body) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warnings.push(format!("subresource decode {url}: {e}"));
                                continue;
                            }
                        }
                    } else {
                        response.body.clone().into_bytes()
                    };
                    captured.push(CapturedResource { url, kind, mime_type, body });
                }
                Err(e) => {
                    debug!(url, error = %e, "subresource body unavailable");
                }
            }
        }
        captured
    }

    async fn probe_accessibility(&self, page: &Page) -> anyhow::Result<RenderedAccessibility> {
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            page.evaluate(A11Y_PROBE_SCRIPT),
        )
        .await
        .map_err(|_| anyhow::anyhow!("probe timed out"))??;
        let value: serde_json::Value = result
            .into_value()
            .map_err(|e| anyhow::anyhow!("probe returned no value: {e}"))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Close the browser and its handler task. Idempotent enough for the
    /// shutdown path; later renders would fail and surface as errors.
    pub async fn close(&self) {
        {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed");
            }
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
    }
}

/// In-page accessibility probe: WCAG 2.1 AA contrast sampling over visible
/// text, skip-link detection, a positive-tabindex keyboard-trap heuristic,
/// and media-element track/autoplay checks. Bounded: samples at most 200
/// elements and reports at most 50 violations.
const A11Y_PROBE_SCRIPT: &str = r#"
    (() => {
        const toLinear = (c) => {
            c /= 255;
            return c <= 0.03928 ? c / 12.92 : Math.pow((c + 0.055) / 1.055, 2.4);
        };
        const luminance = (rgb) =>
            0.2126 * toLinear(rgb[0]) + 0.7152 * toLinear(rgb[1]) + 0.0722 * toLinear(rgb[2]);
        const parseColor = (value) => {
            const m = value && value.match(/rgba?\(([^)]+)\)/);
            if (!m) return null;
            const parts = m[1].split(',').map(parseFloat);
            if (parts.length === 4 && parts[3] === 0) return null;
            return parts.slice(0, 3);
        };
        const cssPath = (el) => {
            if (el.id) return '#' + el.id;
            let path = el.tagName.toLowerCase();
            if (el.className && typeof el.className === 'string') {
                const cls = el.className.trim().split(/\s+/)[0];
                if (cls) path += '.' + cls;
            }
            return path;
        };

        const contrastViolations = [];
        const candidates = document.querySelectorAll('p, span, a, li, h1, h2, h3, h4, h5, h6, td, label, button');
        let sampled = 0;
        for (const el of candidates) {
            if (sampled >= 200 || contrastViolations.length >= 50) break;
            const text = (el.textContent || '').trim();
            if (!text) continue;
            const rect = el.getBoundingClientRect();
            if (rect.width === 0 || rect.height === 0) continue;
            const style = getComputedStyle(el);
            if (style.visibility === 'hidden' || style.display === 'none') continue;
            sampled++;
            const fg = parseColor(style.color);
            let bgEl = el, bg = null;
            while (bgEl && !bg) {
                bg = parseColor(getComputedStyle(bgEl).backgroundColor);
                bgEl = bgEl.parentElement;
            }
            if (!fg || !bg) continue;
            const l1 = luminance(fg), l2 = luminance(bg);
            const ratio = (Math.max(l1, l2) + 0.05) / (Math.min(l1, l2) + 0.05);
            const fontSize = parseFloat(style.fontSize) || 16;
            const bold = parseInt(style.fontWeight, 10) >= 700;
            const large = fontSize >= 24 || (bold && fontSize >= 18.66);
            const required = large ? 3.0 : 4.5;
            if (ratio < required) {
                contrastViolations.push({
                    selector: cssPath(el),
                    ratio: Math.round(ratio * 100) / 100,
                    required: required,
                    sampleText: text.slice(0, 80),
                });
            }
        }

        const anchors = Array.from(document.querySelectorAll('a[href]')).slice(0, 3);
        const skip = anchors.find(a => {
            const href = a.getAttribute('href') || '';
            return href.startsWith('#') && href.length > 1;
        });
        const focusableSel = 'a[href], button, input, select, textarea, [tabindex]';
        const firstFocusable = document.querySelector(focusableSel);
        const skipLink = {
            present: !!skip,
            targetExists: !!(skip && document.getElementById(skip.getAttribute('href').slice(1))),
            firstFocusable: firstFocusable ? firstFocusable.tagName.toLowerCase() : null,
        };

        const keyboardTraps = [];
        for (const el of document.querySelectorAll('[tabindex]')) {
            const idx = parseInt(el.getAttribute('tabindex'), 10);
            if (idx > 0 && keyboardTraps.length < 25) keyboardTraps.push(cssPath(el));
        }

        const media = [];
        for (const el of document.querySelectorAll('video, audio')) {
            if (media.length >= 50) break;
            const tracks = Array.from(el.querySelectorAll('track'));
            const kinds = tracks.map(t => (t.getAttribute('kind') || '').toLowerCase());
            media.push({
                selector: cssPath(el),
                hasCaptions: kinds.includes('captions'),
                hasSubtitles: kinds.includes('subtitles'),
                hasDescriptions: kinds.includes('descriptions'),
                autoplay: el.hasAttribute('autoplay'),
                controls: el.hasAttribute('controls'),
            });
        }

        return { contrastViolations, skipLink, keyboardTraps, media };
    })()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_accessibility_deserializes_probe_shape() {
        let payload = serde_json::json!({
            "contrastViolations": [
                { "selector": "p.intro", "ratio": 2.1, "required": 4.5, "sampleText": "dim" }
            ],
            "skipLink": { "present": true, "targetExists": true, "firstFocusable": "a" },
            "keyboardTraps": ["div.modal"],
            "media": [{
                "selector": "video", "hasCaptions": false, "hasSubtitles": false,
                "hasDescriptions": false, "autoplay": true, "controls": false
            }],
        });
        let a11y: RenderedAccessibility = serde_json::from_value(payload).unwrap();
        assert_eq!(a11y.contrast_violations.len(), 1);
        assert!(a11y.skip_link.present);
        assert_eq!(a11y.keyboard_traps, vec!["div.modal"]);
        assert!(a11y.media[0].autoplay);
    }

    #[test]
    fn default_limits_are_bounded() {
        let limits = RenderLimits::default();
        assert!(limits.max_requests > 0);
        assert!(limits.max_total_bytes > 0);
        assert_eq!(limits.wait, WaitCondition::Load);
    }
}
