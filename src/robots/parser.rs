//! robots.txt parsing and rule matching.
//!
//! Group selection follows the robots exclusion protocol: the group whose
//! user-agent token is the longest substring of the caller's agent wins,
//! falling back to `*`. Rule matching is longest-pattern-wins with Allow
//! winning ties; patterns support `*` wildcards and the `$` end anchor.

use crate::records::RobotsVerdict;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub allow: bool,
    pub pattern: String,
}

#[derive(Debug, Clone, Default)]
pub struct Group {
    pub agents: Vec<String>,
    pub rules: Vec<Rule>,
    pub crawl_delay: Option<f64>,
}

/// Parsed robots.txt for one host.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    pub groups: Vec<Group>,
    pub sitemaps: Vec<String>,
}

impl RobotsTxt {
    /// Parse robots.txt text. Malformed lines are skipped and reported as
    /// warnings rather than failing the parse.
    pub fn parse(body: &str) -> (Self, Vec<String>) {
        let mut robots = RobotsTxt::default();
        let mut warnings = Vec::new();
        let mut current: Option<Group> = None;
        // Consecutive user-agent lines share one group; a rule line closes
        // the agent run.
        let mut agents_open = false;

        for (line_no, raw_line) in body.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                warnings.push(format!("line {}: missing ':' separator", line_no + 1));
                continue;
            };
            let field = field.trim().to_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    if !agents_open {
                        if let Some(group) = current.take() {
                            robots.groups.push(group);
                        }
                        current = Some(Group::default());
                        agents_open = true;
                    }
                    if let Some(group) = current.as_mut() {
                        group.agents.push(value.to_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    agents_open = false;
                    let Some(group) = current.as_mut() else {
                        warnings.push(format!(
                            "line {}: {field} before any user-agent",
                            line_no + 1
                        ));
                        continue;
                    };
                    // An empty Disallow means allow-all and matches nothing.
                    if value.is_empty() {
                        continue;
                    }
                    group.rules.push(Rule {
                        allow: field == "allow",
                        pattern: value.to_string(),
                    });
                }
                "crawl-delay" => {
                    agents_open = false;
                    let Some(group) = current.as_mut() else {
                        warnings.push(format!(
                            "line {}: crawl-delay before any user-agent",
                            line_no + 1
                        ));
                        continue;
                    };
                    match value.parse::<f64>() {
                        Ok(delay) if delay >= 0.0 => group.crawl_delay = Some(delay),
                        _ => warnings.push(format!(
                            "line {}: unparseable crawl-delay {value:?}",
                            line_no + 1
                        )),
                    }
                }
                "sitemap" => {
                    // Sitemap lines are global, not group-scoped.
                    robots.sitemaps.push(value.to_string());
                }
                _ => {
                    warnings.push(format!("line {}: unknown field {field:?}", line_no + 1));
                }
            }
        }
        if let Some(group) = current.take() {
            robots.groups.push(group);
        }
        (robots, warnings)
    }

    /// Group applying to `user_agent`: longest agent-token substring match,
    /// `*` as fallback.
    #[must_use]
    pub fn group_for<'a>(&'a self, user_agent: &str) -> Option<&'a Group> {
        let ua = user_agent.to_lowercase();
        let mut best: Option<(&Group, usize)> = None;
        let mut wildcard: Option<&Group> = None;
        for group in &self.groups {
            for agent in &group.agents {
                if agent == "*" {
                    wildcard.get_or_insert(group);
                } else if ua.contains(agent.as_str()) {
                    let len = agent.len();
                    if best.map_or(true, |(_, l)| len > l) {
                        best = Some((group, len));
                    }
                }
            }
        }
        best.map(|(g, _)| g).or(wildcard)
    }

    /// Decide whether `path` (path + query) may be fetched by `user_agent`.
    #[must_use]
    pub fn check(&self, user_agent: &str, path: &str) -> RobotsVerdict {
        let Some(group) = self.group_for(user_agent) else {
            return RobotsVerdict::allow_all();
        };
        let mut best: Option<(&Rule, usize)> = None;
        for rule in &group.rules {
            if let Some(len) = pattern_match_len(&rule.pattern, path) {
                let replace = match best {
                    None => true,
                    // Longer pattern wins; Allow wins exact ties.
                    Some((current, cur_len)) => {
                        len > cur_len || (len == cur_len && rule.allow && !current.allow)
                    }
                };
                if replace {
                    best = Some((rule, len));
                }
            }
        }
        match best {
            Some((rule, _)) => RobotsVerdict {
                allowed: rule.allow,
                matched_rule: Some(format!(
                    "{}: {}",
                    if rule.allow { "Allow" } else { "Disallow" },
                    rule.pattern
                )),
                override_used: false,
            },
            None => RobotsVerdict::allow_all(),
        }
    }

    /// Crawl delay declared for `user_agent`, if any.
    #[must_use]
    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        self.group_for(user_agent).and_then(|g| g.crawl_delay)
    }
}

/// Match a robots pattern against a path. Returns the pattern length (the
/// specificity used for longest-match ranking) on success.
fn pattern_match_len(pattern: &str, path: &str) -> Option<usize> {
    let anchored = pattern.ends_with('$');
    let pattern_body = if anchored { &pattern[..pattern.len() - 1] } else { pattern };
    if wildcard_match(pattern_body, path, anchored) {
        Some(pattern.len())
    } else {
        None
    }
}

fn wildcard_match(pattern: &str, path: &str, anchored: bool) -> bool {
    fn inner(p: &[u8], s: &[u8], anchored: bool) -> bool {
        match p.first() {
            None => !anchored || s.is_empty(),
            Some(b'*') => {
                (0..=s.len()).any(|i| inner(&p[1..], &s[i..], anchored))
            }
            Some(&c) => s.first() == Some(&c) && inner(&p[1..], &s[1..], anchored),
        }
    }
    inner(pattern.as_bytes(), path.as_bytes(), anchored)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# example robots file
User-agent: *
Disallow: /private/
Allow: /private/open.html
Crawl-delay: 2

User-agent: atlasbot
Disallow: /atlas-only/

Sitemap: https://e.com/sitemap.xml
bogus line without separator
";

    #[test]
    fn parses_groups_delays_and_sitemaps() {
        let (robots, warnings) = RobotsTxt::parse(SAMPLE);
        assert_eq!(robots.groups.len(), 2);
        assert_eq!(robots.sitemaps, vec!["https://e.com/sitemap.xml"]);
        assert_eq!(robots.crawl_delay("anything"), Some(2.0));
        assert_eq!(robots.crawl_delay("atlasbot/1.0"), None);
        assert_eq!(warnings.len(), 1, "{warnings:?}");
    }

    #[test]
    fn longest_match_wins_and_allow_breaks_ties() {
        let (robots, _) = RobotsTxt::parse(SAMPLE);
        let denied = robots.check("somebot", "/private/secret.html");
        assert!(!denied.allowed);
        assert_eq!(denied.matched_rule.as_deref(), Some("Disallow: /private/"));

        let allowed = robots.check("somebot", "/private/open.html");
        assert!(allowed.allowed);
        assert_eq!(
            allowed.matched_rule.as_deref(),
            Some("Allow: /private/open.html")
        );
    }

    #[test]
    fn specific_agent_group_shadows_wildcard() {
        let (robots, _) = RobotsTxt::parse(SAMPLE);
        let verdict = robots.check("Mozilla/5.0 atlasbot/0.1", "/private/secret.html");
        // atlasbot's group has no /private rule, so the path is allowed.
        assert!(verdict.allowed);
        let verdict = robots.check("Mozilla/5.0 atlasbot/0.1", "/atlas-only/x");
        assert!(!verdict.allowed);
    }

    #[test]
    fn wildcards_and_anchors() {
        let (robots, _) = RobotsTxt::parse(
            "User-agent: *\nDisallow: /*.pdf$\nDisallow: /tmp*/drafts\n",
        );
        assert!(!robots.check("bot", "/docs/file.pdf").allowed);
        assert!(robots.check("bot", "/docs/file.pdf?x=1").allowed);
        assert!(!robots.check("bot", "/tmp-2024/drafts").allowed);
        assert!(robots.check("bot", "/docs/file.pdfx").allowed);
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let (robots, _) = RobotsTxt::parse("User-agent: *\nDisallow:\n");
        assert!(robots.check("bot", "/anything").allowed);
    }
}
