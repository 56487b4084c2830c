//! Deterministic URL canonicalization, classification and filtering.
//!
//! Everything the frontier and the extractors treat as a URL identity goes
//! through [`normalize`]. Normalization never fails; unparseable input is
//! returned lowercased so the caller can still record it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::Url;

/// Trailing-slash handling for [`normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingSlash {
    /// Leave paths as found.
    #[default]
    Keep,
    /// Append a slash to extension-less paths.
    Always,
    /// Strip the trailing slash from non-root paths.
    Never,
}

/// Options for [`normalize`].
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizeOptions {
    /// Upgrade `http://` to `https://` before anything else.
    pub upgrade_http: bool,
    /// Lowercase the path as well as the host.
    pub lowercase_path: bool,
    pub trailing_slash: TrailingSlash,
}

/// Tracking-parameter policy applied when building URL keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamPolicy {
    /// No filtering.
    #[default]
    Keep,
    /// Drop the entire query string.
    Strip,
    /// Keep the first value seen for each key during this crawl; drop
    /// parameters whose value differs from it.
    Sample,
}

/// Per-crawl state for [`ParamPolicy::Sample`]: the first value observed
/// for each query key.
#[derive(Debug, Default)]
pub struct ParamSampler {
    first_seen: Mutex<HashMap<String, String>>,
}

impl ParamSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `key=value` pair survives sampling. The first value
    /// observed for a key is retained for the whole crawl.
    fn admit(&self, key: &str, value: &str) -> bool {
        let mut seen = self.first_seen.lock();
        match seen.get(key) {
            Some(first) => first == value,
            None => {
                seen.insert(key.to_string(), value.to_string());
                true
            }
        }
    }
}

/// Canonicalize a URL string. Never fails: on parse failure the input is
/// returned lowercased.
///
/// Order: parse; optional http→https upgrade; punycode + lowercase host
/// (the `url` crate does both during parsing); strip default port; strip
/// fragment; sort query pairs by key then value (stable, repeated keys
/// preserved); optional path lowercasing and trailing-slash normalization.
#[must_use]
pub fn normalize(input: &str, opts: &NormalizeOptions) -> String {
    let mut url = match Url::parse(input.trim()) {
        Ok(u) => u,
        Err(_) => return input.trim().to_lowercase(),
    };

    if !matches!(url.scheme(), "http" | "https") {
        return input.trim().to_lowercase();
    }

    if opts.upgrade_http && url.scheme() == "http" {
        // set_scheme only fails for special-scheme mismatches; http→https is fine.
        let _ = url.set_scheme("https");
    }

    url.set_fragment(None);

    let sorted = sorted_query(&url);
    match sorted {
        Some(q) if !q.is_empty() => url.set_query(Some(&q)),
        _ => url.set_query(None),
    }

    if opts.lowercase_path {
        let lowered = url.path().to_lowercase();
        url.set_path(&lowered);
    }

    match opts.trailing_slash {
        TrailingSlash::Keep => {}
        TrailingSlash::Always => {
            let path = url.path().to_string();
            if !path.ends_with('/') {
                let last = path.rsplit('/').next().unwrap_or("");
                if !last.contains('.') {
                    url.set_path(&format!("{path}/"));
                }
            }
        }
        TrailingSlash::Never => {
            let path = url.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                url.set_path(path.trim_end_matches('/'));
            }
        }
    }

    url.to_string()
}

fn sorted_query(url: &Url) -> Option<String> {
    if url.query().is_none() {
        return None;
    }
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    // Stable sort keeps repeated (key, value) pairs in document order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        serializer.append_pair(k, v);
    }
    Some(serializer.finish())
}

/// Remove blocked and policy-filtered query parameters, then return the URL
/// re-serialized. `block_list` entries are literal names or `prefix_*`
/// globs and are removed before sampling.
#[must_use]
pub fn apply_param_policy(
    input: &str,
    policy: ParamPolicy,
    block_list: &[String],
    sampler: &ParamSampler,
) -> String {
    let mut url = match Url::parse(input.trim()) {
        Ok(u) => u,
        Err(_) => return input.trim().to_lowercase(),
    };

    if url.query().is_none() {
        return url.to_string();
    }

    if policy == ParamPolicy::Strip {
        url.set_query(None);
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut kept: Vec<(String, String)> = Vec::with_capacity(pairs.len());
    for (k, v) in pairs {
        if is_blocked_param(&k, block_list) {
            continue;
        }
        if policy == ParamPolicy::Sample && !sampler.admit(&k, &v) {
            continue;
        }
        kept.push((k, v));
    }

    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &kept {
            serializer.append_pair(k, v);
        }
        let q = serializer.finish();
        url.set_query(Some(&q));
    }
    url.to_string()
}

fn is_blocked_param(name: &str, block_list: &[String]) -> bool {
    block_list.iter().any(|entry| {
        if let Some(prefix) = entry.strip_suffix('*') {
            name.starts_with(prefix)
        } else {
            name == entry
        }
    })
}

/// Build the canonical URL key: parameter policy first, then structural
/// normalization. Idempotent by construction.
#[must_use]
pub fn url_key(
    input: &str,
    opts: &NormalizeOptions,
    policy: ParamPolicy,
    block_list: &[String],
    sampler: &ParamSampler,
) -> String {
    let filtered = apply_param_policy(input, policy, block_list, sampler);
    normalize(&filtered, opts)
}

/// Scheme + host + effective port equality.
#[must_use]
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

/// Whether `to` belongs to the same origin as `from`.
#[must_use]
pub fn is_internal(from: &str, to: &str) -> bool {
    same_origin(from, to)
}

/// First-segment section of a URL path: `/` for the root, otherwise
/// `/<first-segment>/`.
#[must_use]
pub fn section_of(input: &str) -> String {
    let Ok(url) = Url::parse(input) else {
        return "/".to_string();
    };
    let mut segments = url.path().split('/').filter(|s| !s.is_empty());
    match segments.next() {
        Some(first) => format!("/{first}/"),
        None => "/".to_string(),
    }
}

/// Flag URLs whose host is a loopback, RFC1918, link-local, unique-local or
/// multicast address (v4 and v6, including zone-id literals), or
/// `localhost`.
#[must_use]
pub fn is_private_ip(input: &str) -> bool {
    let Ok(url) = Url::parse(input.trim()) else {
        return false;
    };
    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_v4(v4),
        Some(url::Host::Ipv6(v6)) => is_private_v6(v6),
        Some(url::Host::Domain(domain)) => {
            let domain = domain.to_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return true;
            }
            // Zone-id literals ("fe80::1%eth0") do not parse as Ipv6 hosts;
            // strip the zone and retry.
            let stripped = domain.trim_start_matches('[').trim_end_matches(']');
            if let Some((addr, _zone)) = stripped.split_once('%')
                && let Ok(v6) = addr.parse::<Ipv6Addr>()
            {
                return is_private_v6(v6);
            }
            false
        }
        None => false,
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_unspecified()
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    let segments = addr.segments();
    addr.is_loopback()
        || addr.is_multicast()
        || addr.is_unspecified()
        // unique local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
}

/// Cyrillic and Greek codepoints that render close to Latin letters.
const CONFUSABLE_RANGES: [(u32, u32); 4] = [
    (0x0400, 0x04FF), // Cyrillic
    (0x0500, 0x052F), // Cyrillic supplement
    (0x0370, 0x03FF), // Greek and Coptic
    (0x1F00, 0x1FFF), // Greek extended
];

/// Flag hosts mixing Latin letters with Cyrillic/Greek lookalikes. Must be
/// called on the original (pre-punycode) URL string; once a host is
/// punycoded the script information is gone.
#[must_use]
pub fn is_homograph_attack(input: &str) -> bool {
    let host = raw_host_of(input);
    let mut has_latin = false;
    let mut has_confusable = false;
    for ch in host.chars() {
        if ch.is_ascii_alphabetic() {
            has_latin = true;
        } else {
            let cp = ch as u32;
            if CONFUSABLE_RANGES.iter().any(|(lo, hi)| cp >= *lo && cp <= *hi) {
                has_confusable = true;
            }
        }
        if has_latin && has_confusable {
            return true;
        }
    }
    false
}

/// Authority section of a URL string without going through the parser
/// (which would punycode non-ASCII hosts).
fn raw_host_of(input: &str) -> &str {
    let rest = match input.find("://") {
        Some(idx) => &input[idx + 3..],
        None => input,
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    // Drop userinfo and port.
    let host = authority.rsplit('@').next().unwrap_or(authority);
    host.split(':').next().unwrap_or(host)
}

/// Lowercased registrable host of a URL, used as the per-host rate key.
#[must_use]
pub fn host_of(input: &str) -> Option<String> {
    Url::parse(input).ok()?.host_str().map(|h| h.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(u: &str) -> String {
        normalize(u, &NormalizeOptions::default())
    }

    #[test]
    fn normalization_is_idempotent() {
        let cases = [
            "HTTP://Example.COM:80/Path/?b=2&a=1#frag",
            "https://example.com:443/",
            "https://example.com/a?z=1&z=0&a=x",
            "not a url at all",
        ];
        for case in cases {
            let once = norm(case);
            assert_eq!(norm(&once), once, "input: {case}");
        }
    }

    #[test]
    fn default_port_and_fragment_are_stripped() {
        assert_eq!(norm("http://example.com:80/a#x"), "http://example.com/a");
        assert_eq!(norm("https://example.com:443/"), "https://example.com/");
        assert_eq!(norm("https://example.com:8443/"), "https://example.com:8443/");
    }

    #[test]
    fn query_sorted_by_key_then_value() {
        assert_eq!(
            norm("https://e.com/?b=2&a=9&a=1"),
            "https://e.com/?a=1&a=9&b=2"
        );
    }

    #[test]
    fn idn_hosts_are_punycoded() {
        let n = norm("https://bücher.example/");
        assert!(n.contains("xn--bcher-kva.example"), "{n}");
    }

    #[test]
    fn upgrade_and_trailing_slash_options() {
        let opts = NormalizeOptions {
            upgrade_http: true,
            trailing_slash: TrailingSlash::Always,
            ..Default::default()
        };
        assert_eq!(normalize("http://e.com/docs", &opts), "https://e.com/docs/");
        assert_eq!(
            normalize("http://e.com/img/logo.png", &opts),
            "https://e.com/img/logo.png"
        );
    }

    #[test]
    fn block_list_supports_prefix_globs() {
        let sampler = ParamSampler::new();
        let blocked = vec!["utm_*".to_string(), "fbclid".to_string()];
        let out = apply_param_policy(
            "https://e.com/?utm_source=x&fbclid=1&q=rust",
            ParamPolicy::Keep,
            &blocked,
            &sampler,
        );
        assert_eq!(out, "https://e.com/?q=rust");
    }

    #[test]
    fn sample_policy_keeps_first_value_per_key() {
        let sampler = ParamSampler::new();
        let first = apply_param_policy(
            "https://e.com/?sess=abc&q=1",
            ParamPolicy::Sample,
            &[],
            &sampler,
        );
        assert_eq!(first, "https://e.com/?sess=abc&q=1");
        let second = apply_param_policy(
            "https://e.com/?sess=def&q=1",
            ParamPolicy::Sample,
            &[],
            &sampler,
        );
        assert_eq!(second, "https://e.com/?q=1");
        // The retained first value keeps passing.
        let third = apply_param_policy(
            "https://e.com/?sess=abc&q=1",
            ParamPolicy::Sample,
            &[],
            &sampler,
        );
        assert_eq!(third, "https://e.com/?sess=abc&q=1");
    }

    #[test]
    fn strip_policy_drops_entire_query() {
        let sampler = ParamSampler::new();
        let out = apply_param_policy("https://e.com/p?a=1&b=2", ParamPolicy::Strip, &[], &sampler);
        assert_eq!(out, "https://e.com/p");
    }

    #[test]
    fn section_of_first_segment() {
        assert_eq!(section_of("https://e.com/"), "/");
        assert_eq!(section_of("https://e.com"), "/");
        assert_eq!(section_of("https://e.com/blog/post-1"), "/blog/");
        assert_eq!(section_of("https://e.com/docs/"), "/docs/");
    }

    #[test]
    fn private_ip_detection() {
        assert!(is_private_ip("http://127.0.0.1/"));
        assert!(is_private_ip("http://10.1.2.3/"));
        assert!(is_private_ip("http://192.168.0.1:8080/"));
        assert!(is_private_ip("http://169.254.1.1/"));
        assert!(is_private_ip("http://[::1]/"));
        assert!(is_private_ip("http://[fe80::1]/"));
        assert!(is_private_ip("http://[fc00::1]/"));
        assert!(is_private_ip("http://localhost/"));
        assert!(!is_private_ip("https://example.com/"));
        assert!(!is_private_ip("http://8.8.8.8/"));
    }

    #[test]
    fn homograph_detection_mixed_scripts() {
        // "аpple.com" with a Cyrillic а.
        assert!(is_homograph_attack("https://\u{0430}pple.com/"));
        assert!(!is_homograph_attack("https://apple.com/"));
        // Pure Cyrillic domains are not homographs.
        assert!(!is_homograph_attack("https://\u{043f}\u{043e}\u{0447}\u{0442}\u{0430}.\u{0440}\u{0444}/"));
    }

    #[test]
    fn same_origin_rules() {
        assert!(same_origin("https://e.com/a", "https://e.com/b?x=1"));
        assert!(!same_origin("https://e.com/", "http://e.com/"));
        assert!(!same_origin("https://e.com/", "https://sub.e.com/"));
    }
}
