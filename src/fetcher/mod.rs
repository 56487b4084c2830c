//! Raw-mode HTTP fetcher.
//!
//! A plain GET with explicit redirect following (so the chain can be
//! recorded), a hard byte cap enforced while streaming, and a total
//! deadline. Redirect policy is disabled on the client; the loop here owns
//! hop accounting.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use url::Url;

use crate::error::ErrorKind;
use crate::records::RedirectHop;
use crate::runtime::CancelHandle;

#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub byte_cap: u64,
    pub max_redirects: u32,
    pub user_agent: String,
    /// Drop `set-cookie` from recorded headers.
    pub strip_cookies: bool,
    /// Drop auth-bearing headers from recorded headers.
    pub strip_auth_headers: bool,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            byte_cap: 10 * 1024 * 1024,
            max_redirects: 10,
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
            strip_cookies: true,
            strip_auth_headers: true,
        }
    }
}

/// Result of a completed HTTP exchange, error statuses included.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: u16,
    /// Response headers of the final hop, lowercased names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub final_url: String,
    pub redirect_chain: Vec<RedirectHop>,
    /// True when the byte cap clipped the body.
    pub truncated: bool,
    pub fetch_ms: u64,
}

/// Transport-level failure: no HTTP response to record.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct FetchFailure {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub fetch_ms: u64,
}

pub struct RawFetcher {
    client: reqwest::Client,
    limits: FetchLimits,
}

impl RawFetcher {
    pub fn new(limits: FetchLimits) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(limits.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(limits.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, limits })
    }

    /// GET `url`, following up to `max_redirects` hops. HTTP error statuses
    /// are successful outcomes here; only transport failures error.
    pub async fn fetch(
        &self,
        url: &str,
        cancel: &CancelHandle,
    ) -> Result<FetchOutcome, FetchFailure> {
        let started = Instant::now();
        let work = self.fetch_inner(url, &started);
        tokio::select! {
            outcome = work => outcome,
            _ = cancel.cancelled() => Err(FetchFailure {
                kind: ErrorKind::Timeout,
                code: "cancelled".to_string(),
                message: "fetch cancelled by scheduler".to_string(),
                fetch_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn fetch_inner(
        &self,
        url: &str,
        started: &Instant,
    ) -> Result<FetchOutcome, FetchFailure> {
        let deadline = *started + self.limits.timeout;
        let mut current = url.to_string();
        let mut redirect_chain = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.failure(ErrorKind::Timeout, "deadline", "total fetch deadline expired", started));
            }

            let response = match tokio::time::timeout(
                remaining,
                self.client.get(&current).send(),
            )
            .await
            {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => return Err(self.classify(e, started)),
                Err(_) => {
                    return Err(self.failure(
                        ErrorKind::Timeout,
                        "deadline",
                        "total fetch deadline expired",
                        started,
                    ));
                }
            };

            let status = response.status();
            if status.is_redirection()
                && redirect_chain.len() < self.limits.max_redirects as usize
                && let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
            {
                let next = match Url::parse(&current)
                    .ok()
                    .and_then(|base| base.join(location).ok())
                {
                    Some(u) => u.to_string(),
                    None => {
                        return Err(self.failure(
                            ErrorKind::Network,
                            "bad_redirect",
                            &format!("unresolvable Location header {location:?}"),
                            started,
                        ));
                    }
                };
                redirect_chain.push(RedirectHop {
                    status: status.as_u16(),
                    location: next.clone(),
                });
                current = next;
                continue;
            }

            // Final hop: record headers, stream the body under the cap.
            let headers = self.record_headers(&response);
            let final_url = response.url().to_string();
            let status_code = status.as_u16();

            let mut body: Vec<u8> = Vec::new();
            let mut truncated = false;
            let mut response = response;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    truncated = true;
                    break;
                }
                match tokio::time::timeout(remaining, response.chunk()).await {
                    Ok(Ok(Some(chunk))) => {
                        if body.len() as u64 + chunk.len() as u64 > self.limits.byte_cap {
                            let keep = (self.limits.byte_cap as usize).saturating_sub(body.len());
                            body.extend_from_slice(&chunk[..keep]);
                            truncated = true;
                            break;
                        }
                        body.extend_from_slice(&chunk);
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => return Err(self.classify(e, started)),
                    Err(_) => {
                        truncated = true;
                        break;
                    }
                }
            }

            return Ok(FetchOutcome {
                status: status_code,
                headers,
                body,
                final_url,
                redirect_chain,
                truncated,
                fetch_ms: started.elapsed().as_millis() as u64,
            });
        }
    }

    fn record_headers(&self, response: &reqwest::Response) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            let name = name.as_str().to_lowercase();
            if self.limits.strip_cookies && name == "set-cookie" {
                continue;
            }
            if self.limits.strip_auth_headers
                && matches!(name.as_str(), "authorization" | "proxy-authorization" | "www-authenticate")
            {
                continue;
            }
            if let Ok(v) = value.to_str() {
                // Repeated headers collapse comma-separated.
                headers
                    .entry(name)
                    .and_modify(|existing: &mut String| {
                        existing.push_str(", ");
                        existing.push_str(v);
                    })
                    .or_insert_with(|| v.to_string());
            }
        }
        headers
    }

    fn classify(&self, error: reqwest::Error, started: &Instant) -> FetchFailure {
        let (kind, code) = if error.is_timeout() {
            (ErrorKind::Timeout, "timeout")
        } else if error.is_connect() {
            (ErrorKind::Network, "connect")
        } else if error.is_decode() || error.is_body() {
            (ErrorKind::Network, "decode")
        } else {
            (ErrorKind::Network, "network")
        };
        FetchFailure {
            kind,
            code: code.to_string(),
            message: error.to_string(),
            fetch_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failure(
        &self,
        kind: ErrorKind,
        code: &str,
        message: &str,
        started: &Instant,
    ) -> FetchFailure {
        FetchFailure {
            kind,
            code: code.to_string(),
            message: message.to_string(),
            fetch_ms: started.elapsed().as_millis() as u64,
        }
    }
}
