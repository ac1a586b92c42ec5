//! Sitemap discovery and parsing.
//!
//! Dispatches by file extension: `.gz` → gunzip first, `.xml`/`...map` → XML,
//! `.txt` → plain text list, otherwise assume an XML sitemap index. A sitemap
//! visited more recently than `crawl_delay_sitemap_days` ago is skipped. A
//! child sitemap that 404s is retried under rewritten paths (`base +
//! "/sitemaps/" + name`, then `base + "/sitemap/" + name`). HTML-variant
//! sitemaps (a plain page of links, no XML or text file) are parsed with the
//! same `lol_html` streaming approach as `extract.rs`.

use std::collections::{HashSet, VecDeque};
use std::io::Read;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use lol_html::{element, HtmlRewriter, Settings};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use url::Url;

use crate::error::{CrawlError, Result};
use crate::extract::decode_body;
use crate::http;
use crate::storage::StorageGateway;

const CANDIDATE_NAMES: &[&str] = &[
    "sitemap.xml",
    "sitemap_index.xml",
    "sitemap-index.xml",
    "sitemap.xml.gz",
    "sitemap_index.xml.gz",
    "sitemap.txt",
];

/// One URL entry found in a sitemap, with whatever `lastmod`/`changefreq`
/// metadata accompanied it.
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapUrlEntry {
    pub url: Url,
    pub lastmod: Option<DateTime<Utc>>,
    pub changefreq: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SitemapKind {
    Xml,
    Gz,
    Txt,
    Html,
}

/// Dispatch a sitemap URL to a parser kind, mirroring `Sitemap.choose`'s
/// suffix checks (`.gz` wins over `.xml` even on a misleading double
/// extension like `sitemap.xml.gz`).
fn sniff_kind(url: &Url, content_type: Option<&str>) -> SitemapKind {
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".gz") {
        return SitemapKind::Gz;
    }
    if path.ends_with(".txt") {
        return SitemapKind::Txt;
    }
    if path.ends_with(".xml") {
        return SitemapKind::Xml;
    }
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("xml") {
            return SitemapKind::Xml;
        }
        if ct.contains("gzip") {
            return SitemapKind::Gz;
        }
        if ct.contains("text/plain") {
            return SitemapKind::Txt;
        }
    }
    SitemapKind::Html
}

fn maybe_gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() >= 2 && bytes[0] == 0x1F && bytes[1] == 0x8B {
        let mut d = GzDecoder::new(bytes);
        let mut out = Vec::new();
        d.read_to_end(&mut out)
            .map_err(|e| CrawlError::Parse { url: String::new(), reason: format!("gunzip failed: {e}") })?;
        return Ok(out);
    }
    Ok(bytes.to_vec())
}

#[derive(Debug, Default)]
struct ParsedSitemap {
    urls: Vec<SitemapUrlEntry>,
    child_sitemaps: Vec<Url>,
}

fn parse_sitemap_xml(bytes: &[u8]) -> Result<ParsedSitemap> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut parsed = ParsedSitemap::default();

    #[derive(Clone, Copy, PartialEq)]
    enum Ctx {
        None,
        Url,
        Sitemap,
    }
    #[derive(Clone, Copy, PartialEq)]
    enum Field {
        None,
        Loc,
        Lastmod,
        Changefreq,
    }

    let mut ctx = Ctx::None;
    let mut field = Field::None;
    let mut loc = String::new();
    let mut lastmod = String::new();
    let mut changefreq = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => {
                    ctx = Ctx::Url;
                    loc.clear();
                    lastmod.clear();
                    changefreq.clear();
                }
                b"sitemap" => {
                    ctx = Ctx::Sitemap;
                    loc.clear();
                    lastmod.clear();
                    changefreq.clear();
                }
                b"loc" => field = Field::Loc,
                b"lastmod" => field = Field::Lastmod,
                b"changefreq" => field = Field::Changefreq,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default();
                match field {
                    Field::Loc => loc.push_str(&text),
                    Field::Lastmod => lastmod.push_str(&text),
                    Field::Changefreq => changefreq.push_str(&text),
                    Field::None => {}
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"loc" | b"lastmod" | b"changefreq" => field = Field::None,
                b"url" => {
                    if let Ok(url) = Url::parse(loc.trim()) {
                        parsed.urls.push(SitemapUrlEntry {
                            url,
                            lastmod: parse_lastmod(lastmod.trim()),
                            changefreq: non_empty(&changefreq),
                        });
                    }
                    ctx = Ctx::None;
                }
                b"sitemap" => {
                    if ctx == Ctx::Sitemap {
                        if let Ok(url) = Url::parse(loc.trim()) {
                            parsed.child_sitemaps.push(url);
                        }
                    }
                    ctx = Ctx::None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(CrawlError::Parse { url: String::new(), reason: format!("sitemap XML parse error: {e}") }),
            _ => {}
        }
        buf.clear();
    }

    Ok(parsed)
}

fn parse_sitemap_txt(body: &str) -> ParsedSitemap {
    let mut parsed = ParsedSitemap::default();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(url) = Url::parse(line) {
            parsed.urls.push(SitemapUrlEntry { url, lastmod: None, changefreq: None });
        }
    }
    parsed
}

/// Fallback for sites that put a plain HTML page of links at the
/// conventional sitemap path instead of an XML or text file.
fn parse_sitemap_html(base: &Url, html: &str) -> Result<ParsedSitemap> {
    let mut urls = Vec::new();
    {
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![element!("a[href]", |el| {
                    if let Some(href) = el.get_attribute("href") {
                        if let Ok(url) = base.join(&href) {
                            urls.push(url);
                        }
                    }
                    Ok(())
                })],
                ..Settings::default()
            },
            |_: &[u8]| {},
        );
        rewriter
            .write(html.as_bytes())
            .map_err(|e| CrawlError::Parse { url: base.to_string(), reason: e.to_string() })?;
        rewriter
            .end()
            .map_err(|e| CrawlError::Parse { url: base.to_string(), reason: e.to_string() })?;
    }
    Ok(ParsedSitemap {
        urls: urls.into_iter().map(|url| SitemapUrlEntry { url, lastmod: None, changefreq: None }).collect(),
        child_sitemaps: Vec::new(),
    })
}

fn parse_lastmod(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc()))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

async fn parse_by_kind(base: &Url, sm_url: &Url, content_type: Option<&str>, body: &[u8]) -> Result<ParsedSitemap> {
    match sniff_kind(sm_url, content_type) {
        SitemapKind::Gz => {
            let bytes = maybe_gunzip(body)?;
            parse_sitemap_xml(&bytes)
        }
        SitemapKind::Xml => parse_sitemap_xml(body),
        SitemapKind::Txt => {
            let text = decode_body(sm_url, body, content_type)?;
            Ok(parse_sitemap_txt(&text))
        }
        SitemapKind::Html => {
            let text = decode_body(sm_url, body, content_type)?;
            parse_sitemap_html(base, &text)
        }
    }
}

/// Fetch `url`, and if it 404s/errors, retry against `/sitemaps/<name>` and
/// `/sitemap/<name>` rewrites of the same origin before giving up. Mirrors
/// `Sitemap._try_sitemap`'s rewrite order.
async fn fetch_child_with_fallback(client: &Client, origin: &Url, url: &Url, max_bytes: usize) -> Option<(Url, Option<String>, Vec<u8>)> {
    let name = url.path_segments().and_then(|mut s| s.next_back()).unwrap_or("").to_string();

    let mut attempts = vec![url.clone()];
    if !name.is_empty() {
        if let Ok(u) = origin.join(&format!("sitemaps/{name}")) {
            attempts.push(u);
        }
        if let Ok(u) = origin.join(&format!("sitemap/{name}")) {
            attempts.push(u);
        }
    }

    for attempt in attempts {
        if let Ok(resp) = http::fetch_limited(client, attempt.clone(), max_bytes).await {
            if resp.status.is_success() {
                return Some((attempt, resp.content_type, resp.body));
            }
        }
    }
    None
}

/// Candidate root sitemap URLs to try: anything declared in `robots.txt`
/// first (most authoritative), then the conventional filenames at origin
/// root.
pub fn candidate_sitemap_urls(origin: &Url, robots_sitemaps: &[String]) -> Vec<Url> {
    let mut out = Vec::new();
    for s in robots_sitemaps {
        if let Ok(u) = Url::parse(s) {
            out.push(u);
        }
    }
    for name in CANDIDATE_NAMES {
        if let Ok(u) = origin.join(name) {
            out.push(u);
        }
    }
    out
}

/// Crawl one site's sitemap tree to completion: walks `sitemapindex`
/// children breadth-first, applies revisit gating per child sitemap via the
/// storage gateway, and returns every page URL discovered. `site_base` is
/// the canonical base URL used as the storage key for visit bookkeeping.
pub async fn crawl_sitemap<S: StorageGateway>(
    client: &Client,
    storage: &S,
    site_base: &str,
    roots: &[Url],
    max_bytes: usize,
    revisit_after_days: i64,
) -> Result<Vec<SitemapUrlEntry>> {
    let origin = Url::parse(site_base).map_err(|_| CrawlError::InvalidUrl(site_base.to_string()))?;

    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<Url> = roots.iter().cloned().collect();

    while let Some(sm_url) = queue.pop_front() {
        let key = sm_url.as_str().to_string();
        if !seen.insert(key.clone()) {
            continue;
        }

        if let Some(last) = storage.sitemap_last_visited(site_base, sm_url.as_str()).await? {
            let age = Utc::now().signed_duration_since(last);
            if age.num_days() < revisit_after_days {
                continue;
            }
        }

        let Some((resolved, content_type, body)) = fetch_child_with_fallback(client, &origin, &sm_url, max_bytes).await else {
            continue;
        };

        let parsed = match parse_by_kind(&origin, &resolved, content_type.as_deref(), &body).await {
            Ok(p) => p,
            Err(_) => continue,
        };

        storage.record_sitemap_visit(site_base, sm_url.as_str(), Utc::now()).await?;

        out.extend(parsed.urls);
        for child in parsed.child_sitemaps {
            queue.push_back(child);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_kind_by_extension() {
        assert_eq!(sniff_kind(&Url::parse("https://x.test/sitemap.xml.gz").unwrap(), None), SitemapKind::Gz);
        assert_eq!(sniff_kind(&Url::parse("https://x.test/sitemap.xml").unwrap(), None), SitemapKind::Xml);
        assert_eq!(sniff_kind(&Url::parse("https://x.test/sitemap.txt").unwrap(), None), SitemapKind::Txt);
        assert_eq!(sniff_kind(&Url::parse("https://x.test/sitemap").unwrap(), None), SitemapKind::Html);
    }

    #[test]
    fn parses_urlset_with_lastmod_and_changefreq() {
        let xml = br#"<?xml version="1.0"?>
        <urlset><url><loc>https://x.test/a</loc><lastmod>2024-01-02</lastmod><changefreq>daily</changefreq></url></urlset>"#;
        let parsed = parse_sitemap_xml(xml).unwrap();
        assert_eq!(parsed.urls.len(), 1);
        assert_eq!(parsed.urls[0].url.as_str(), "https://x.test/a");
        assert!(parsed.urls[0].lastmod.is_some());
        assert_eq!(parsed.urls[0].changefreq.as_deref(), Some("daily"));
    }

    #[test]
    fn parses_sitemapindex_children() {
        let xml = br#"<sitemapindex><sitemap><loc>https://x.test/s1.xml</loc></sitemap></sitemapindex>"#;
        let parsed = parse_sitemap_xml(xml).unwrap();
        assert!(parsed.urls.is_empty());
        assert_eq!(parsed.child_sitemaps.len(), 1);
    }

    #[test]
    fn parses_txt_sitemap() {
        let body = "https://x.test/a\nhttps://x.test/b\n\n";
        let parsed = parse_sitemap_txt(body);
        assert_eq!(parsed.urls.len(), 2);
    }

    #[test]
    fn parses_html_fallback_links() {
        let base = Url::parse("https://x.test/").unwrap();
        let html = r#"<html><body><a href="/a">A</a><a href="https://other.test/b">B</a></body></html>"#;
        let parsed = parse_sitemap_html(&base, html).unwrap();
        assert_eq!(parsed.urls.len(), 2);
    }

    #[test]
    fn candidate_urls_include_robots_first() {
        let origin = Url::parse("https://x.test/").unwrap();
        let robots = vec!["https://x.test/custom-sitemap.xml".to_string()];
        let candidates = candidate_sitemap_urls(&origin, &robots);
        assert_eq!(candidates[0].as_str(), "https://x.test/custom-sitemap.xml");
        assert!(candidates.iter().any(|u| u.as_str() == "https://x.test/sitemap.xml"));
    }
}
