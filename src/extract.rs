//! Page extraction: one streaming `lol_html` pass over a fetched document
//! (`HtmlRewriter` + `element!` element-content handlers driven off shared
//! `Rc<RefCell<..>>` state), collecting head metadata, links, paragraphs,
//! and headings, plus the followable/archivable policy derived from
//! `<meta name="robots">`.
//!
//! Encoding negotiation tries the response's declared charset first, then
//! an ordered candidate list, accepting the first decode that produces no
//! replacement characters.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, BIG5, EUC_KR, GB18030, SHIFT_JIS, UTF_8, WINDOWS_1252};
use lol_html::{element, text, HtmlRewriter, Settings};
use url::Url;

use crate::error::{CrawlError, Result};
use crate::storage::{HeadingPath, PageHead, ParagraphRecord};

const ENCODING_CANDIDATES: &[&Encoding] = &[UTF_8, WINDOWS_1252, BIG5, GB18030, EUC_KR, SHIFT_JIS];

/// Decode a fetched body, trying the response's declared charset first and
/// then the ordered fallback list, accepting the first attempt that decodes
/// without replacement characters.
pub fn decode_body(url: &Url, bytes: &[u8], content_type: Option<&str>) -> Result<String> {
    if let Some(enc) = content_type.and_then(charset_from_content_type) {
        let (text, _, had_errors) = enc.decode(bytes);
        if !had_errors {
            return Ok(text.into_owned());
        }
    }
    for enc in ENCODING_CANDIDATES {
        let (text, _, had_errors) = enc.decode(bytes);
        if !had_errors {
            return Ok(text.into_owned());
        }
    }
    Err(CrawlError::Decode {
        url: url.to_string(),
        last_encoding: ENCODING_CANDIDATES.last().unwrap().name().to_string(),
    })
}

fn charset_from_content_type(content_type: &str) -> Option<&'static Encoding> {
    let lower = content_type.to_ascii_lowercase();
    let (_, charset) = lower.split_once("charset=")?;
    let charset = charset.trim().trim_matches('"').trim_matches('\'');
    Encoding::for_label(charset.as_bytes())
}

/// A discovered outbound link, carrying whatever `rel` tokens accompanied it.
#[derive(Debug, Clone)]
pub struct ExtractedLink {
    pub url: Url,
    /// True if `rel` contained any of the configured nofollow-equivalent tokens.
    pub nofollow: bool,
}

/// The result of one extraction pass over a page.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    pub head: PageHead,
    pub links: Vec<ExtractedLink>,
    pub paragraphs: Vec<ParagraphRecord>,
    /// `false` iff `<meta name="robots">` contains `nofollow`.
    pub followable: bool,
    /// `false` iff `<meta name="robots">` contains any of
    /// `{noarchive, nosnippet, noindex}`.
    pub archivable: bool,
}

#[derive(Default)]
struct ExtractState {
    head: PageHead,
    links: Vec<ExtractedLink>,
    paragraphs: Vec<ParagraphRecord>,
    heading_path: HeadingPath,
    in_title: bool,
    title_buffer: String,
}

fn set_heading(path: &mut HeadingPath, level: u8, text: String) {
    match level {
        1 => {
            path.h1 = Some(text);
            path.h2 = None;
            path.h3 = None;
            path.h4 = None;
            path.h5 = None;
            path.h6 = None;
        }
        2 => {
            path.h2 = Some(text);
            path.h3 = None;
            path.h4 = None;
            path.h5 = None;
            path.h6 = None;
        }
        3 => {
            path.h3 = Some(text);
            path.h4 = None;
            path.h5 = None;
            path.h6 = None;
        }
        4 => {
            path.h4 = Some(text);
            path.h5 = None;
            path.h6 = None;
        }
        5 => {
            path.h5 = Some(text);
            path.h6 = None;
        }
        6 => path.h6 = Some(text),
        _ => {}
    }
}

fn robots_tokens(content: &str) -> Vec<String> {
    content
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

// h1..h6 can appear consecutively but never nest in valid HTML; a small
// thread-local stack of per-heading text buffers lets each tag's start/end
// handlers (registered independently by `heading_handler!`) agree on which
// buffer is "theirs" without threading extra state through the macro.
thread_local! {
    static HEADING_BUFFERS: RefCell<Vec<Rc<RefCell<String>>>> = RefCell::new(Vec::new());
}

macro_rules! heading_handler {
    ($level:literal, $selector:literal, $state:ident) => {{
        let state_for_start = Rc::clone(&$state);
        (
            element!($selector, move |el| {
                let state_end = Rc::clone(&state_for_start);
                let buffer = Rc::new(RefCell::new(String::new()));
                HEADING_BUFFERS.with(|cell| cell.borrow_mut().push(Rc::clone(&buffer)));
                el.on_end_tag(move |_end| {
                    HEADING_BUFFERS.with(|cell| {
                        cell.borrow_mut().pop();
                    });
                    let text = buffer.borrow().trim().to_string();
                    if !text.is_empty() {
                        set_heading(&mut state_end.borrow_mut().heading_path, $level, text);
                    }
                    Ok(())
                })?;
                Ok(())
            }),
            text!($selector, move |t| {
                HEADING_BUFFERS.with(|cell| {
                    if let Some(buf) = cell.borrow().last() {
                        buf.borrow_mut().push_str(t.as_str());
                    }
                });
                Ok(())
            }),
        )
    }};
}

/// Run one streaming extraction pass over `html`, resolving relative links
/// against `base_url` and flagging links whose `rel` contains any token in
/// `nofollow_tokens` (the configured `ROBOT_NOFOLLOW` set).
pub fn extract(base_url: &Url, html: &str, nofollow_tokens: &[String]) -> Result<PageExtraction> {
    HEADING_BUFFERS.with(|cell| cell.borrow_mut().clear());
    let state = Rc::new(RefCell::new(ExtractState::default()));
    let base_url = base_url.clone();
    let nofollow_tokens = nofollow_tokens.to_vec();

    let mut handlers = Vec::new();

    // <title>
    {
        let state_start = Rc::clone(&state);
        let state_text = Rc::clone(&state);
        handlers.push(element!("title", move |el| {
            state_start.borrow_mut().in_title = true;
            state_start.borrow_mut().title_buffer.clear();
            let state_end = Rc::clone(&state_start);
            el.on_end_tag(move |_end| {
                let mut st = state_end.borrow_mut();
                if st.head.title.is_none() {
                    let t = st.title_buffer.trim().to_string();
                    if !t.is_empty() {
                        st.head.title = Some(t);
                    }
                }
                st.in_title = false;
                st.title_buffer.clear();
                Ok(())
            })?;
            Ok(())
        }));
        handlers.push(text!("title", move |t| {
            let mut st = state_text.borrow_mut();
            if st.in_title {
                st.title_buffer.push_str(t.as_str());
            }
            Ok(())
        }));
    }

    // <meta name="..."> and <meta property="...">
    {
        let state = Rc::clone(&state);
        handlers.push(element!("meta", move |el| {
            let name = el.get_attribute("name").unwrap_or_default().to_ascii_lowercase();
            let property = el.get_attribute("property").unwrap_or_default().to_ascii_lowercase();
            let content = el.get_attribute("content").unwrap_or_default();
            if content.is_empty() {
                return Ok(());
            }
            let mut st = state.borrow_mut();
            match name.as_str() {
                "description" => {
                    st.head.description.get_or_insert_with(|| content.clone());
                }
                "author" => {
                    st.head.author.get_or_insert_with(|| content.clone());
                }
                "keywords" => {
                    st.head.keywords.get_or_insert_with(|| content.clone());
                }
                "robots" => {
                    st.head.robots.get_or_insert_with(|| content.clone());
                }
                "revisit-after" => {
                    st.head.revisit_after.get_or_insert_with(|| content.clone());
                }
                _ => {}
            }
            match property.as_str() {
                "og:title" => {
                    if st.head.title.is_none() {
                        st.head.title = Some(content.clone());
                    }
                }
                "og:description" => {
                    if st.head.description.is_none() {
                        st.head.description = Some(content.clone());
                    }
                }
                "article:published_time" => st.head.published_time = parse_timestamp(&content),
                "article:modified_time" => st.head.modified_time = parse_timestamp(&content),
                "article:expiration_time" => st.head.expiration_time = parse_timestamp(&content),
                "article:section" => st.head.section = Some(content.clone()),
                "article:tag" => st.head.article_tag = Some(content.clone()),
                _ => {}
            }
            Ok(())
        }));
    }

    // <a href=...>
    {
        let state = Rc::clone(&state);
        let base_url = base_url.clone();
        let nofollow_tokens = nofollow_tokens.clone();
        handlers.push(element!("a[href]", move |el| {
            let href = el.get_attribute("href").unwrap_or_default();
            let rel = el.get_attribute("rel").unwrap_or_default();
            if let Ok(url) = base_url.join(&href) {
                if matches!(url.scheme(), "http" | "https") {
                    let nofollow = rel
                        .split_whitespace()
                        .any(|tok| nofollow_tokens.iter().any(|n| n.eq_ignore_ascii_case(tok)));
                    state.borrow_mut().links.push(ExtractedLink { url, nofollow });
                }
            }
            Ok(())
        }));
    }

    // h1..h6, tracking a shared heading-buffer stack (see `heading_handler!`).
    let (h1_el, h1_text) = heading_handler!(1, "h1", state);
    let (h2_el, h2_text) = heading_handler!(2, "h2", state);
    let (h3_el, h3_text) = heading_handler!(3, "h3", state);
    let (h4_el, h4_text) = heading_handler!(4, "h4", state);
    let (h5_el, h5_text) = heading_handler!(5, "h5", state);
    let (h6_el, h6_text) = heading_handler!(6, "h6", state);
    handlers.extend([h1_el, h2_el, h3_el, h4_el, h5_el, h6_el, h1_text, h2_text, h3_text, h4_text, h5_text, h6_text]);

    // p, li: each contributes one paragraph record at its current heading path.
    for selector in ["p", "li"] {
        let state_start = Rc::clone(&state);
        let state_text = Rc::clone(&state);
        handlers.push(element!(selector, move |el| {
            let heading_path = state_start.borrow().heading_path.clone();
            state_start.borrow_mut().paragraphs.push(ParagraphRecord { text: String::new(), heading_path });
            let state_end = Rc::clone(&state_start);
            el.on_end_tag(move |_end| {
                let mut st = state_end.borrow_mut();
                let drop_last = match st.paragraphs.last_mut() {
                    Some(last) => {
                        last.text = last.text.trim().to_string();
                        last.text.is_empty()
                    }
                    None => false,
                };
                if drop_last {
                    st.paragraphs.pop();
                }
                Ok(())
            })?;
            Ok(())
        }));
        handlers.push(text!(selector, move |t| {
            if let Some(last) = state_text.borrow_mut().paragraphs.last_mut() {
                last.text.push_str(t.as_str());
            }
            Ok(())
        }));
    }

    {
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: handlers,
                ..Settings::default()
            },
            |_: &[u8]| {},
        );
        rewriter
            .write(html.as_bytes())
            .map_err(|e| CrawlError::Parse { url: base_url.to_string(), reason: e.to_string() })?;
        rewriter
            .end()
            .map_err(|e| CrawlError::Parse { url: base_url.to_string(), reason: e.to_string() })?;
    }
    HEADING_BUFFERS.with(|cell| cell.borrow_mut().clear());

    let st = Rc::try_unwrap(state)
        .expect("all handler closures are dropped once the rewriter finishes")
        .into_inner();

    let tokens = robots_tokens(st.head.robots.as_deref().unwrap_or_default());
    let followable = !tokens.iter().any(|t| t == "nofollow");
    let archivable = !tokens.iter().any(|t| matches!(t.as_str(), "noarchive" | "nosnippet" | "noindex"));

    Ok(PageExtraction {
        head: st.head,
        links: st.links,
        paragraphs: st.paragraphs,
        followable,
        archivable,
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.test/articles/one").unwrap()
    }

    #[test]
    fn extracts_title_and_description() {
        let html = r#"<html><head><title>Hello</title>
            <meta name="description" content="A test page"></head>
            <body><p>hi</p></body></html>"#;
        let out = extract(&base(), html, &[]).unwrap();
        assert_eq!(out.head.title.as_deref(), Some("Hello"));
        assert_eq!(out.head.description.as_deref(), Some("A test page"));
    }

    #[test]
    fn followable_and_archivable_default_true() {
        let html = "<html><head></head><body><p>x</p></body></html>";
        let out = extract(&base(), html, &[]).unwrap();
        assert!(out.followable);
        assert!(out.archivable);
    }

    #[test]
    fn robots_meta_noindex_blocks_archivability_only() {
        let html = r#"<html><head><meta name="robots" content="noindex"></head><body></body></html>"#;
        let out = extract(&base(), html, &[]).unwrap();
        assert!(out.followable);
        assert!(!out.archivable);
    }

    #[test]
    fn robots_meta_nofollow_blocks_followability_only() {
        let html = r#"<html><head><meta name="robots" content="nofollow"></head><body></body></html>"#;
        let out = extract(&base(), html, &[]).unwrap();
        assert!(!out.followable);
        assert!(out.archivable);
    }

    #[test]
    fn links_resolved_against_base_and_rel_nofollow_flagged() {
        let html = r#"<html><body>
            <a href="/a">A</a>
            <a href="/b" rel="nofollow">B</a>
            </body></html>"#;
        let nofollow = vec!["nofollow".to_string()];
        let out = extract(&base(), html, &nofollow).unwrap();
        assert_eq!(out.links.len(), 2);
        assert_eq!(out.links[0].url.as_str(), "https://example.test/a");
        assert!(!out.links[0].nofollow);
        assert!(out.links[1].nofollow);
    }

    #[test]
    fn paragraphs_carry_current_heading_path() {
        let html = r#"<html><body>
            <h1>Intro</h1>
            <p>first</p>
            <h2>Sub</h2>
            <p>second</p>
            </body></html>"#;
        let out = extract(&base(), html, &[]).unwrap();
        assert_eq!(out.paragraphs.len(), 2);
        assert_eq!(out.paragraphs[0].text, "first");
        assert_eq!(out.paragraphs[0].heading_path.h1.as_deref(), Some("Intro"));
        assert_eq!(out.paragraphs[1].text, "second");
        assert_eq!(out.paragraphs[1].heading_path.h1.as_deref(), Some("Intro"));
        assert_eq!(out.paragraphs[1].heading_path.h2.as_deref(), Some("Sub"));
    }

    #[test]
    fn empty_paragraphs_are_dropped() {
        let html = "<html><body><p>   </p><p>real</p></body></html>";
        let out = extract(&base(), html, &[]).unwrap();
        assert_eq!(out.paragraphs.len(), 1);
        assert_eq!(out.paragraphs[0].text, "real");
    }
}
