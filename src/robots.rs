//! `robots.txt` parsing and fetch permission checks.
//!
//! A three-state block parser (`Start`/`SawAgent`/`SawRule`), HTTP-status-
//! driven `allow_all`/`disallow_all` fallbacks, and `can_fetch`'s
//! agent-matching order, in the spirit of Python's `urllib.robotparser`.
//! `can_fetch` resolves ties by longest matching rule, with Allow beating
//! Disallow on an equal-length prefix.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

const PATH_ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

#[derive(Debug, Clone)]
struct RuleLine {
    path: String,
    allow: bool,
}

impl RuleLine {
    fn matches(&self, path: &str) -> bool {
        self.path == "*" || path.starts_with(self.path.as_str())
    }
}

#[derive(Debug, Clone, Default)]
struct Entry {
    user_agents: Vec<String>,
    rules: Vec<RuleLine>,
}

impl Entry {
    fn applies_to(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        self.user_agents.iter().any(|a| {
            let a = a.to_ascii_lowercase();
            a == "*" || ua.contains(&a)
        })
    }

    fn is_default(&self) -> bool {
        self.user_agents.iter().any(|a| a == "*")
    }

    /// Longest matching rule wins; Allow beats Disallow on an exact tie in
    /// prefix length.
    fn allowance(&self, path: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for rule in &self.rules {
            if !rule.matches(path) {
                continue;
            }
            let len = if rule.path == "*" { 0 } else { rule.path.len() };
            match best {
                None => best = Some((len, rule.allow)),
                Some((best_len, best_allow)) => {
                    if len > best_len || (len == best_len && rule.allow && !best_allow) {
                        best = Some((len, rule.allow));
                    }
                }
            }
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    SawAgent,
    SawRule,
}

/// A parsed `robots.txt` document for one host.
#[derive(Debug, Clone)]
pub struct Robots {
    entries: Vec<Entry>,
    default_entry: Option<Entry>,
    crawl_delay: Option<f64>,
    sitemap_urls: Vec<String>,
    allow_all: bool,
    disallow_all: bool,
    loaded: bool,
}

impl Default for Robots {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            default_entry: None,
            crawl_delay: None,
            sitemap_urls: Vec::new(),
            allow_all: false,
            disallow_all: false,
            loaded: false,
        }
    }
}

impl Robots {
    /// Build a `Robots` from the fetch's HTTP status: 401/403 means
    /// disallow everything, any other 4xx means allow everything (no
    /// robots.txt present), matching `Txt.read`'s error handling.
    pub fn from_status(status: u16) -> Self {
        let mut robots = Self::default();
        if status == 401 || status == 403 {
            robots.disallow_all = true;
        } else if (400..500).contains(&status) {
            robots.allow_all = true;
        }
        robots.loaded = true;
        robots
    }

    /// Parse a fetched `robots.txt` body.
    pub fn parse(body: &str) -> Self {
        let mut robots = Self::default();
        let mut state = ParseState::Start;
        let mut entry = Entry::default();

        for raw_line in body.lines() {
            let line = match raw_line.find('#') {
                Some(idx) => &raw_line[..idx],
                None => raw_line,
            };
            let line = line.trim();

            if line.is_empty() {
                match state {
                    ParseState::SawAgent => {
                        entry = Entry::default();
                        state = ParseState::Start;
                    }
                    ParseState::SawRule => {
                        robots.commit_entry(entry);
                        entry = Entry::default();
                        state = ParseState::Start;
                    }
                    ParseState::Start => {}
                }
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if state == ParseState::SawRule {
                        robots.commit_entry(entry);
                        entry = Entry::default();
                    }
                    entry.user_agents.push(value.to_string());
                    state = ParseState::SawAgent;
                }
                "disallow" => {
                    if state != ParseState::Start {
                        // An empty Disallow value means "allow everything",
                        // not "disallow the empty-prefix match"; flip it to
                        // an Allow rule, matching `urllib.robotparser`.
                        let allow = value.is_empty();
                        entry.rules.push(RuleLine { path: value.to_string(), allow });
                        state = ParseState::SawRule;
                    }
                }
                "allow" => {
                    if state != ParseState::Start {
                        entry.rules.push(RuleLine { path: value.to_string(), allow: true });
                        state = ParseState::SawRule;
                    }
                }
                "sitemap" => {
                    robots.sitemap_urls.push(value.to_string());
                }
                k if k.starts_with("crawl-delay") => {
                    if let Ok(delay) = value.parse::<f64>() {
                        robots.crawl_delay = Some(robots.crawl_delay.map_or(delay, |d: f64| d.max(delay)));
                    }
                }
                _ => {}
            }
        }

        if state == ParseState::SawRule {
            robots.commit_entry(entry);
        }

        robots.loaded = true;
        robots
    }

    fn commit_entry(&mut self, entry: Entry) {
        if entry.is_default() {
            self.default_entry = Some(entry);
        } else {
            self.entries.push(entry);
        }
    }

    /// Crawl delay declared in the file, if any, clamped to be no smaller
    /// than `floor`.
    pub fn crawl_delay(&self, floor: std::time::Duration) -> std::time::Duration {
        match self.crawl_delay {
            Some(secs) if secs > floor.as_secs_f64() => std::time::Duration::from_secs_f64(secs),
            _ => floor,
        }
    }

    pub fn sitemap_urls(&self) -> &[String] {
        &self.sitemap_urls
    }

    /// Whether `user_agent` may fetch `url`.
    pub fn can_fetch(&self, user_agent: &str, url: &Url) -> bool {
        if self.disallow_all {
            return false;
        }
        if self.allow_all {
            return true;
        }
        if !self.loaded {
            return false;
        }

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        if path.is_empty() {
            path = "/".to_string();
        }
        let path = utf8_percent_encode(&path, PATH_ENCODE_SET).to_string();

        for entry in &self.entries {
            if entry.applies_to(user_agent) {
                return entry.allowance(&path);
            }
        }

        if let Some(default_entry) = &self.default_entry {
            return default_entry.allowance(&path);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallow_all_blocks_everything() {
        let robots = Robots::from_status(403);
        let url = Url::parse("https://example.com/anything").unwrap();
        assert!(!robots.can_fetch("nieuwscrawl", &url));
    }

    #[test]
    fn allow_all_on_missing_robots() {
        let robots = Robots::from_status(404);
        let url = Url::parse("https://example.com/anything").unwrap();
        assert!(robots.can_fetch("nieuwscrawl", &url));
    }

    #[test]
    fn unloaded_robots_is_conservative() {
        let robots = Robots::default();
        let url = Url::parse("https://example.com/anything").unwrap();
        assert!(!robots.can_fetch("nieuwscrawl", &url));
    }

    #[test]
    fn basic_disallow_rule() {
        let body = "User-agent: *\nDisallow: /private\n";
        let robots = Robots::parse(body);
        let blocked = Url::parse("https://example.com/private/page").unwrap();
        let allowed = Url::parse("https://example.com/public/page").unwrap();
        assert!(!robots.can_fetch("nieuwscrawl", &blocked));
        assert!(robots.can_fetch("nieuwscrawl", &allowed));
    }

    #[test]
    fn empty_disallow_value_allows_everything() {
        let body = "User-agent: *\nDisallow:\n";
        let robots = Robots::parse(body);
        let url = Url::parse("https://example.com/anything/at/all").unwrap();
        assert!(robots.can_fetch("nieuwscrawl", &url));
    }

    #[test]
    fn longest_match_wins_allow_over_disallow() {
        let body = "User-agent: *\nDisallow: /a\nAllow: /a/b\n";
        let robots = Robots::parse(body);
        let url = Url::parse("https://example.com/a/b/c").unwrap();
        assert!(robots.can_fetch("nieuwscrawl", &url));
    }

    #[test]
    fn equal_length_prefix_allow_beats_disallow() {
        let body = "User-agent: *\nDisallow: /a\nAllow: /a\n";
        let robots = Robots::parse(body);
        let url = Url::parse("https://example.com/a").unwrap();
        assert!(robots.can_fetch("nieuwscrawl", &url));
    }

    #[test]
    fn specific_agent_takes_priority_over_default() {
        let body = "User-agent: nieuwscrawl\nDisallow: /secret\n\nUser-agent: *\nDisallow:\n";
        let robots = Robots::parse(body);
        let url = Url::parse("https://example.com/secret").unwrap();
        assert!(!robots.can_fetch("nieuwscrawl", &url));
        assert!(robots.can_fetch("othercrawler", &url));
    }

    #[test]
    fn crawl_delay_never_below_floor() {
        let body = "User-agent: *\nCrawl-delay: 0.5\n";
        let robots = Robots::parse(body);
        let floor = std::time::Duration::from_secs(1);
        assert_eq!(robots.crawl_delay(floor), floor);
    }

    #[test]
    fn crawl_delay_above_floor_is_honoured() {
        let body = "User-agent: *\nCrawl-delay: 5\n";
        let robots = Robots::parse(body);
        let floor = std::time::Duration::from_secs(1);
        assert_eq!(robots.crawl_delay(floor), std::time::Duration::from_secs(5));
    }

    #[test]
    fn sitemap_lines_are_collected() {
        let body = "Sitemap: https://example.com/sitemap.xml\nUser-agent: *\nDisallow:\n";
        let robots = Robots::parse(body);
        assert_eq!(robots.sitemap_urls(), &["https://example.com/sitemap.xml".to_string()]);
    }

    #[test]
    fn blank_line_after_agent_only_block_discards_it() {
        let body = "User-agent: ghostbot\n\nUser-agent: *\nDisallow: /x\n";
        let robots = Robots::parse(body);
        let url = Url::parse("https://example.com/x").unwrap();
        assert!(!robots.can_fetch("nieuwscrawl", &url));
    }
}
