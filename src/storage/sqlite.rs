//! SQLite-backed `StorageGateway`: WAL mode, a shared `SqlitePool`, schema
//! applied as a constant on open.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use super::{HeadingPath, PageSnapshot, RecentPage, Site, StorageGateway};
use crate::error::Result;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS websites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    created TEXT NOT NULL,
    modified TEXT NOT NULL,
    crawl_depth INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS webpages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id),
    url TEXT NOT NULL UNIQUE,
    crawl_created TEXT NOT NULL,
    crawl_modified TEXT NOT NULL,
    content TEXT NOT NULL,
    title TEXT,
    description TEXT,
    author TEXT,
    keywords TEXT,
    revisit TEXT,
    published_time TEXT,
    modified_time TEXT,
    expiration_time TEXT,
    section TEXT,
    tag TEXT
);
CREATE INDEX IF NOT EXISTS idx_webpages_website ON webpages(website_id);

CREATE TABLE IF NOT EXISTS headings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webpage_id INTEGER NOT NULL REFERENCES webpages(id),
    h1 TEXT, h2 TEXT, h3 TEXT, h4 TEXT, h5 TEXT, h6 TEXT
);
CREATE INDEX IF NOT EXISTS idx_headings_webpage ON headings(webpage_id);

CREATE TABLE IF NOT EXISTS paragraphs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webpage_id INTEGER NOT NULL REFERENCES webpages(id),
    headings_id INTEGER REFERENCES headings(id),
    paragraph TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_paragraphs_webpage ON paragraphs(webpage_id);

CREATE TABLE IF NOT EXISTS sitemaps_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id),
    sitemap_url TEXT NOT NULL,
    visited_at TEXT NOT NULL,
    UNIQUE(website_id, sitemap_url)
);
"#;

/// Opens (or creates) a SQLite database file and exposes the narrow
/// `StorageGateway` surface. Writes are serialised through `write_lock`;
/// reads borrow the shared pool directly.
pub struct SqliteStorage {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStorage {
    pub async fn open(database_path: &Path) -> Result<Self> {
        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory database, used by tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    async fn site_id_by_base(&self, base: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM websites WHERE url = ?")
            .bind(base)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }
}

impl StorageGateway for SqliteStorage {
    async fn upsert_site(&self, base: &str, depth: i64) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();

        if let Some(id) = self.site_id_by_base(base).await? {
            sqlx::query("UPDATE websites SET modified = ?, crawl_depth = MAX(crawl_depth, ?) WHERE id = ?")
                .bind(&now)
                .bind(depth)
                .bind(id)
                .execute(&self.pool)
                .await?;
            return Ok(id);
        }

        let result = sqlx::query(
            "INSERT INTO websites (url, created, modified, crawl_depth) VALUES (?, ?, ?, ?)",
        )
        .bind(base)
        .bind(&now)
        .bind(&now)
        .bind(depth)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        let rows = sqlx::query("SELECT id, url, created, modified, crawl_depth FROM websites")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Site {
                    id: row.try_get("id")?,
                    base: row.try_get("url")?,
                    created: parse_timestamp(row.try_get("created")?),
                    modified: parse_timestamp(row.try_get("modified")?),
                    depth: row.try_get("crawl_depth")?,
                })
            })
            .collect()
    }

    async fn list_recent_pages(&self, within_days: i64) -> Result<Vec<RecentPage>> {
        let cutoff = (Utc::now() - chrono::Duration::days(within_days)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT url, website_id, crawl_modified FROM webpages WHERE crawl_modified >= ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(RecentPage {
                    url: row.try_get("url")?,
                    site_id: row.try_get("website_id")?,
                    crawl_modified: parse_timestamp(row.try_get("crawl_modified")?),
                })
            })
            .collect()
    }

    async fn store_page(&self, snapshot: &PageSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let site_id = match self.site_id_by_base(&snapshot.site_base).await? {
            Some(id) => id,
            None => {
                let result = sqlx::query(
                    "INSERT INTO websites (url, created, modified, crawl_depth) VALUES (?, ?, ?, 0)",
                )
                .bind(&snapshot.site_base)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                result.last_insert_rowid()
            }
        };

        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM webpages WHERE url = ?")
            .bind(&snapshot.url)
            .fetch_optional(&mut *tx)
            .await?;

        let head = &snapshot.head;
        let webpage_id = if let Some((id,)) = existing {
            sqlx::query(
                r#"UPDATE webpages SET crawl_modified = ?, content = ?, title = ?, description = ?,
                   author = ?, keywords = ?, revisit = ?, published_time = ?, modified_time = ?,
                   expiration_time = ?, section = ?, tag = ? WHERE id = ?"#,
            )
            .bind(snapshot.crawl_modified.to_rfc3339())
            .bind(&snapshot.raw_content)
            .bind(&head.title)
            .bind(&head.description)
            .bind(&head.author)
            .bind(&head.keywords)
            .bind(&head.robots)
            .bind(head.published_time.map(|t| t.to_rfc3339()))
            .bind(head.modified_time.map(|t| t.to_rfc3339()))
            .bind(head.expiration_time.map(|t| t.to_rfc3339()))
            .bind(&head.section)
            .bind(&head.article_tag)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM paragraphs WHERE webpage_id = ?").bind(id).execute(&mut *tx).await?;
            sqlx::query("DELETE FROM headings WHERE webpage_id = ?").bind(id).execute(&mut *tx).await?;
            id
        } else {
            let result = sqlx::query(
                r#"INSERT INTO webpages (website_id, url, crawl_created, crawl_modified, content,
                   title, description, author, keywords, revisit, published_time, modified_time,
                   expiration_time, section, tag)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(site_id)
            .bind(&snapshot.url)
            .bind(snapshot.crawl_created.to_rfc3339())
            .bind(snapshot.crawl_modified.to_rfc3339())
            .bind(&snapshot.raw_content)
            .bind(&head.title)
            .bind(&head.description)
            .bind(&head.author)
            .bind(&head.keywords)
            .bind(&head.robots)
            .bind(head.published_time.map(|t| t.to_rfc3339()))
            .bind(head.modified_time.map(|t| t.to_rfc3339()))
            .bind(head.expiration_time.map(|t| t.to_rfc3339()))
            .bind(&head.section)
            .bind(&head.article_tag)
            .execute(&mut *tx)
            .await?;
            result.last_insert_rowid()
        };

        let mut heading_ids: HashMap<HeadingPath, i64> = HashMap::new();
        for para in &snapshot.paragraphs {
            let headings_id = if para.heading_path.is_empty() {
                None
            } else if let Some(id) = heading_ids.get(&para.heading_path) {
                Some(*id)
            } else {
                let h = &para.heading_path;
                let result = sqlx::query(
                    "INSERT INTO headings (webpage_id, h1, h2, h3, h4, h5, h6) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(webpage_id)
                .bind(&h.h1)
                .bind(&h.h2)
                .bind(&h.h3)
                .bind(&h.h4)
                .bind(&h.h5)
                .bind(&h.h6)
                .execute(&mut *tx)
                .await?;
                let id = result.last_insert_rowid();
                heading_ids.insert(para.heading_path.clone(), id);
                Some(id)
            };

            sqlx::query("INSERT INTO paragraphs (webpage_id, headings_id, paragraph) VALUES (?, ?, ?)")
                .bind(webpage_id)
                .bind(headings_id)
                .bind(&para.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn record_sitemap_visit(&self, site_base: &str, sitemap_url: &str, ts: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let site_id = match self.site_id_by_base(site_base).await? {
            Some(id) => id,
            None => {
                let result = sqlx::query(
                    "INSERT INTO websites (url, created, modified, crawl_depth) VALUES (?, ?, ?, 0)",
                )
                .bind(site_base)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                result.last_insert_rowid()
            }
        };

        sqlx::query(
            r#"INSERT INTO sitemaps_history (website_id, sitemap_url, visited_at) VALUES (?, ?, ?)
               ON CONFLICT(website_id, sitemap_url) DO UPDATE SET visited_at = excluded.visited_at"#,
        )
        .bind(site_id)
        .bind(sitemap_url)
        .bind(ts.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn sitemap_last_visited(&self, site_base: &str, sitemap_url: &str) -> Result<Option<DateTime<Utc>>> {
        let site_id = match self.site_id_by_base(site_base).await? {
            Some(id) => id,
            None => return Ok(None),
        };

        let row: Option<(String,)> = sqlx::query_as(
            "SELECT visited_at FROM sitemaps_history WHERE website_id = ? AND sitemap_url = ?",
        )
        .bind(site_id)
        .bind(sitemap_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ts,)| parse_timestamp(ts)))
    }
}

fn parse_timestamp(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
