//! Narrow storage interface for crawl results, and the record types that
//! flow through it.
//!
//! Table names (`websites`, `webpages`, `paragraphs`, `headings`,
//! `sitemaps_history`) and foreign keys describe the relational shape
//! below. Only the SQLite-backed implementation (`sqlite`) is shipped;
//! callers depend on `StorageGateway` so a different backend can be
//! dropped in later.

pub mod sqlite;

use chrono::{DateTime, Utc};

pub use sqlite::SqliteStorage;

use crate::error::Result;

/// A crawled site (host), identified by its base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub id: i64,
    pub base: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub depth: i64,
}

/// Head metadata extracted from a page: title/description/author/keywords/
/// robots plus OpenGraph-style article timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageHead {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub keywords: Option<String>,
    pub robots: Option<String>,
    pub revisit_after: Option<String>,
    pub published_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub section: Option<String>,
    pub article_tag: Option<String>,
}

/// One crawl snapshot of a page, ready to be persisted.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub url: String,
    pub site_base: String,
    pub crawl_created: DateTime<Utc>,
    pub crawl_modified: DateTime<Utc>,
    pub raw_content: String,
    pub head: PageHead,
    pub paragraphs: Vec<ParagraphRecord>,
}

/// A single paragraph (or list item), carrying the heading path active when
/// it was extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct ParagraphRecord {
    pub text: String,
    pub heading_path: HeadingPath,
}

/// The `(h1..h6)` stack active at the point a paragraph was extracted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HeadingPath {
    pub h1: Option<String>,
    pub h2: Option<String>,
    pub h3: Option<String>,
    pub h4: Option<String>,
    pub h5: Option<String>,
    pub h6: Option<String>,
}

impl HeadingPath {
    pub fn is_empty(&self) -> bool {
        self.h1.is_none()
            && self.h2.is_none()
            && self.h3.is_none()
            && self.h4.is_none()
            && self.h5.is_none()
            && self.h6.is_none()
    }
}

/// A recently-stored page's identity, used at startup to suppress refetch
/// of pages crawled within `revisit_after_days`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentPage {
    pub url: String,
    pub site_id: i64,
    pub crawl_modified: DateTime<Utc>,
}

/// Narrow persistence interface. All mutating operations are serialised
/// through a single write lock in the implementation; reads may run
/// concurrently with each other and with in-flight writes.
///
/// Methods return `impl Future<..> + Send` rather than plain `async fn`:
/// `Scheduler`/`Frontier` are generic over `S: StorageGateway` and spawn
/// worker futures onto `JoinSet`, which requires `F: Send`. A bare `async
/// fn` in a generic trait doesn't let the compiler prove the returned
/// future is `Send` for an arbitrary `S`, so the bound is spelled out here
/// instead.
pub trait StorageGateway: Send + Sync {
    /// Insert the site if absent, otherwise touch `modified` and return the
    /// existing id. Returns the site's id either way.
    fn upsert_site(&self, base: &str, depth: i64) -> impl std::future::Future<Output = Result<i64>> + Send;

    /// All known sites with their base URL and crawl depth.
    fn list_sites(&self) -> impl std::future::Future<Output = Result<Vec<Site>>> + Send;

    /// Pages stored or last modified within `within_days` days of now, used
    /// at startup to seed the membership filter and skip refetching
    /// recently-crawled pages.
    fn list_recent_pages(&self, within_days: i64) -> impl std::future::Future<Output = Result<Vec<RecentPage>>> + Send;

    /// Persist a page snapshot: upserts `webpages`, replaces its
    /// `paragraphs`/`headings` rows.
    fn store_page(&self, snapshot: &PageSnapshot) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Record that `sitemap_url` (belonging to `site_base`) was visited at
    /// `ts`.
    fn record_sitemap_visit(&self, site_base: &str, sitemap_url: &str, ts: DateTime<Utc>) -> impl std::future::Future<Output = Result<()>> + Send;

    /// The last time `sitemap_url` was visited for `site_base`, if ever.
    fn sitemap_last_visited(&self, site_base: &str, sitemap_url: &str) -> impl std::future::Future<Output = Result<Option<DateTime<Utc>>>> + Send;
}
