//! URL syntactic validation, IRI→URI escaping, and filename sanitisation.
//!
//! The absolute-URL check leans on the `url` crate's grammar rather than a
//! hand-rolled one; the extension allowlist, office-document rejection, and
//! nofollow-host substring check run as a second pass on top of it.

use std::sync::OnceLock;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use url::Url;

const OFFICE_EXTENSIONS: &[&str] = &["docx", "xlsx", "pptx"];
const ALLOWED_4CHAR_EXTENSIONS: &[&str] = &["htm", "com", "org", "edu", "gov"];

fn host_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,}\.?|localhost)$")
            .unwrap()
    })
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").unwrap())
}

/// `true` iff `u` matches the absolute-URL grammar and passes the extension
/// and nofollow-host checks. Never panics; invalid input simply yields
/// `false`.
pub fn url_valid(u: &str, nofollow_hosts: &[String]) -> bool {
    let parsed = match Url::parse(u) {
        Ok(p) => p,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https" | "ftp" | "ftps") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(h) => h,
        None => return false,
    };
    if !(host_label_regex().is_match(host) || ipv4_regex().is_match(host)) {
        return false;
    }

    if nofollow_hosts.iter().any(|nf| host.contains(nf.as_str())) {
        return false;
    }

    let trimmed = u.trim_end_matches('/');
    let last_segment = trimmed.rsplit('/').next().unwrap_or("");

    if let Some(dot) = last_segment.rfind('.') {
        let ext = &last_segment[dot + 1..];
        if OFFICE_EXTENSIONS.iter().any(|o| o.eq_ignore_ascii_case(ext)) {
            return false;
        }
        if ext.len() == 4
            && ext.chars().all(|c| c.is_ascii_alphabetic())
            && !ALLOWED_4CHAR_EXTENSIONS
                .iter()
                .any(|prefix| ext.to_ascii_lowercase().starts_with(prefix))
        {
            return false;
        }
    }

    true
}

const IRI_EXTRA: &AsciiSet = &CONTROLS
    .add(b'"')
    .add(b'\'')
    .add(b',')
    .add(b' ')
    .add(b';')
    .add(b':');

/// Percent-encode every non-ASCII byte and the set `{"', ;:}`, leaving other
/// ASCII bytes untouched. Operates per the whole string (the original
/// `iri_to_uri` re-encodes each URL component independently, but since all
/// of the extra characters are reserved/unsafe in every component the
/// whole-string pass is equivalent here).
pub fn iri_to_uri(s: &str) -> String {
    utf8_percent_encode(s, IRI_EXTRA).to_string()
}

/// Remove characters outside `[A-Za-z0-9._/-]` and optionally collapse
/// consecutive `/`.
pub fn sanitise_filename(s: &str, collapse_slashes: bool) -> String {
    let filtered: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
        .collect();

    if !collapse_slashes {
        return filtered;
    }

    let mut out = String::with_capacity(filtered.len());
    let mut last_was_slash = false;
    for c in filtered.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }
    out
}

/// Sanitise a single path segment (no slashes expected) using the
/// `sanitize-filename` crate, for on-disk spill/body file names.
pub fn sanitise_path_segment(s: &str) -> String {
    sanitize_filename::sanitize(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_http_url() {
        assert!(url_valid("https://example.com/news/article", &[]));
    }

    #[test]
    fn rejects_bad_scheme() {
        assert!(!url_valid("javascript:alert(1)", &[]));
    }

    #[test]
    fn rejects_office_extension() {
        assert!(!url_valid("https://example.com/file.docx", &[]));
    }

    #[test]
    fn accepts_allowed_three_char_extension() {
        assert!(url_valid("https://example.com/index.htm", &[]));
    }

    #[test]
    fn rejects_four_char_extension_not_in_allowlist() {
        assert!(!url_valid("https://example.com/page.abcd", &[]));
    }

    #[test]
    fn accepts_four_char_extension_beginning_with_allowed_prefix() {
        assert!(url_valid("https://example.com/page.html", &[]));
        assert!(url_valid("https://example.com/page.orgx", &[]));
    }

    #[test]
    fn rejects_nofollow_host() {
        let nofollow = vec!["facebook".to_string()];
        assert!(!url_valid("https://www.facebook.com/page", &nofollow));
    }

    #[test]
    fn accepts_localhost() {
        assert!(url_valid("http://localhost:8080/", &[]));
    }

    #[test]
    fn accepts_ipv4_host() {
        assert!(url_valid("http://192.168.0.1/path", &[]));
    }

    #[test]
    fn iri_to_uri_escapes_reserved_and_nonascii() {
        let out = iri_to_uri("https://example.com/café \"quote\"");
        assert!(!out.contains(' '));
        assert!(!out.contains('"'));
        assert!(out.contains("caf"));
    }

    #[test]
    fn sanitise_filename_strips_unsafe_chars_and_collapses_slashes() {
        let out = sanitise_filename("a//b$$c<>d", true);
        assert_eq!(out, "a/bcd");
    }
}
