//! End-to-end crawl scenarios against a mock HTTP server: a seed page with
//! a followable and a `rel="nofollow"` link, and a page withheld from
//! storage by `<meta name="robots" content="noindex">` whose own outbound
//! link is still discovered.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nieuwscrawl::config::Config;
use nieuwscrawl::supervisor;

fn base_config(data_dir: &Path, seed: &str) -> Config {
    let mut config = Config::default();
    config.sites = vec![seed.to_string()];
    config.crawl_depth = 0;
    config.crawl_delay_secs = 0;
    config.max_threads = 2;
    config.max_concurrent_sitemaps = 2;
    config.data_dir = data_dir.to_string_lossy().to_string();
    config.database_filename = "crawl.sqlite3".to_string();
    config
}

async fn paragraphs_for_url(db_path: &Path, url: &str) -> Vec<String> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite://{}", db_path.display()))
        .await
        .unwrap();
    let rows = sqlx::query(
        "SELECT paragraph FROM paragraphs p \
         JOIN webpages w ON w.id = p.webpage_id \
         WHERE w.url = ?",
    )
    .bind(url)
    .fetch_all(&pool)
    .await
    .unwrap();
    rows.into_iter().map(|r| r.try_get::<String, _>("paragraph").unwrap()).collect()
}

async fn page_urls(db_path: &Path) -> Vec<String> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite://{}", db_path.display()))
        .await
        .unwrap();
    let rows = sqlx::query("SELECT url FROM webpages").fetch_all(&pool).await.unwrap();
    rows.into_iter().map(|r| r.try_get::<String, _>("url").unwrap()).collect()
}

#[tokio::test]
async fn followable_links_are_crawled_nofollow_links_are_not() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head><title>Home</title></head><body>
                <a href="/a">A</a>
                <a href="/b" rel="nofollow">B</a>
                <p>hello</p>
            </body></html>"#,
        ))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><head><title>A</title></head><body><p>page a</p></body></html>",
        ))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path(), &server.uri());
    let summary = supervisor::run(config).await.unwrap();

    assert_eq!(summary.errors, 0);
    assert_eq!(summary.pages_stored, 2);

    let db_path = dir.path().join("crawl.sqlite3");
    let mut urls = page_urls(&db_path).await;
    urls.sort();
    let root = format!("{}/", server.uri());
    let a = format!("{}/a", server.uri());
    assert_eq!(urls, vec![root.clone(), a.clone()]);

    let paragraphs = paragraphs_for_url(&db_path, &root).await;
    assert_eq!(paragraphs, vec!["hello".to_string()]);

    // `/b` carries rel="nofollow" on the seed page and must never be fetched.
    server.received_requests().await.unwrap().iter().for_each(|req| {
        assert_ne!(req.url.path(), "/b");
    });
}

#[tokio::test]
async fn noindex_page_is_not_stored_but_its_links_are_still_discovered() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head><title>Home</title>
                <meta name="robots" content="noindex"></head>
                <body><a href="/a">A</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><head><title>A</title></head><body><p>page a</p></body></html>",
        ))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path(), &server.uri());
    let summary = supervisor::run(config).await.unwrap();

    assert_eq!(summary.pages_stored, 1);

    let db_path = dir.path().join("crawl.sqlite3");
    let urls = page_urls(&db_path).await;
    let root = format!("{}/", server.uri());
    let a = format!("{}/a", server.uri());
    assert!(!urls.contains(&root));
    assert!(urls.contains(&a));
}

#[tokio::test]
async fn disallow_all_robots_stores_no_pages_but_site_row_exists() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body><p>hi</p></body></html>"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path(), &server.uri());
    let summary = supervisor::run(config).await.unwrap();

    assert_eq!(summary.pages_stored, 0);

    let db_path = dir.path().join("crawl.sqlite3");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite://{}", db_path.display()))
        .await
        .unwrap();
    let sites: Vec<String> = sqlx::query("SELECT url FROM websites")
        .fetch_all(&pool)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.try_get::<String, _>("url").unwrap())
        .collect();
    assert_eq!(sites.len(), 1);
}

#[tokio::test]
async fn empty_seed_list_exits_cleanly_with_no_rows() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.sites = Vec::new();
    config.data_dir = dir.path().to_string_lossy().to_string();
    config.database_filename = "crawl.sqlite3".to_string();

    let summary = supervisor::run(config).await.unwrap();
    assert_eq!(summary.sites_seen, 0);
    assert_eq!(summary.pages_stored, 0);
    assert_eq!(summary.exit_code(), 0);
}
