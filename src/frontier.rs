//! Depth-bucketed host map and per-host URL queues.
//!
//! Multi-site, depth-bucketed scheduling: a flat `{base: queue}` structure
//! grouped by discovery depth, with `add`/`append`/`store`-style operations.
//! Host-folding compares parsed, normalised `url::Url` hosts rather than
//! stripping substrings from raw strings.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::config::Config;
use crate::error::Result;
use crate::membership::MembershipFilter;
use crate::robots::Robots;
use crate::spillqueue::SpillQueue;
use crate::storage::StorageGateway;
use crate::validator;

/// Per-host crawl state. The frontier hands out one `Arc<HostState>` per
/// base; workers hold it for the duration of a sitemap or page-crawl task
/// and never reach back into the frontier's host map.
pub struct HostState {
    pub base: String,
    pub depth: i64,
    pub queue: SpillQueue<String>,
    pub sitemap_queue: SpillQueue<String>,
    pub robots: Mutex<Option<Robots>>,
}

impl HostState {
    fn open(data_dir: &std::path::Path, base: &str, depth: i64) -> Result<Self> {
        let dir_name = validator::sanitise_path_segment(base);
        let dir = data_dir.join("hosts").join(dir_name);
        Ok(Self {
            base: base.to_string(),
            depth,
            queue: SpillQueue::open(&dir, "pages", true)?,
            sitemap_queue: SpillQueue::open(&dir, "sitemaps", true)?,
            robots: Mutex::new(None),
        })
    }
}

/// The depth-bucketed set of hosts and their per-host queues.
///
/// Generic over the storage backend rather than `Arc<dyn StorageGateway>`:
/// `StorageGateway`'s methods are native `async fn`s, which are not
/// dyn-compatible, so swapping implementations happens at the type
/// parameter instead of behind a trait object.
pub struct Frontier<S: StorageGateway> {
    config: Arc<Config>,
    storage: Arc<S>,
    filter: Arc<MembershipFilter>,
    hosts: Mutex<HashMap<String, Arc<HostState>>>,
    base_tx: mpsc::UnboundedSender<(String, i64)>,
}

impl<S: StorageGateway> Frontier<S> {
    pub fn new(
        config: Arc<Config>,
        storage: Arc<S>,
        filter: Arc<MembershipFilter>,
    ) -> (Self, mpsc::UnboundedReceiver<(String, i64)>) {
        let (base_tx, base_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                storage,
                filter,
                hosts: Mutex::new(HashMap::new()),
                base_tx,
            },
            base_rx,
        )
    }

    /// Seed the frontier from the configured sites plus any sites the
    /// Storage Gateway already knows about (crash-restart recovery).
    pub async fn seed(&self, seeds: &[Url], stored_sites: &[(String, i64)]) -> Result<()> {
        for (base, depth) in stored_sites {
            if let Ok(url) = Url::parse(base) {
                self.ensure_host(&url, *depth).await?;
            }
        }
        for url in seeds {
            self.append(url.clone(), 0).await?;
            if self.config.always_include_base_in_crawlable_link_queue {
                if let Ok(origin) = origin_of(url) {
                    if origin.as_str() != url.as_str() {
                        self.push_to_existing_or_append(origin, 0).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Normalise, dedupe against the membership filter, and route `url` to
    /// the queue of whichever known base it belongs to, or mint a new base
    /// at `from_depth + 1`.
    pub async fn enqueue(&self, url: &Url, from_depth: i64) -> Result<()> {
        let mut url = url.clone();
        url.set_fragment(None);
        if url.as_str().is_empty() {
            return Ok(());
        }
        if !validator::url_valid(url.as_str(), &self.config.nofollow) {
            return Ok(());
        }
        if self.filter.contains(url.as_str()) {
            return Ok(());
        }

        {
            let hosts = self.hosts.lock().await;
            for (base, state) in hosts.iter() {
                if url_belongs_to_base(&url, base) {
                    self.filter.add(url.as_str()).ok();
                    state.queue.put(&url.to_string())?;
                    return Ok(());
                }
            }
        }

        self.append(url, from_depth + 1).await
    }

    /// Mint a new base for `url` at `depth` (dropping it if `depth` exceeds
    /// `CRAWL_DEPTH`), or push onto the existing base's queue if one already
    /// covers it.
    async fn append(&self, url: Url, depth: i64) -> Result<()> {
        if depth > self.config.crawl_depth as i64 {
            return Ok(());
        }
        let base = origin_of(&url)?;

        let mut hosts = self.hosts.lock().await;
        if let Some(state) = hosts.get(&base) {
            if self.filter.contains(url.as_str()) {
                return Ok(());
            }
            self.filter.add(url.as_str()).ok();
            state.queue.put(&url.to_string())?;
            return Ok(());
        }

        self.storage.upsert_site(&base, depth).await?;
        self.filter.add(&base).ok();
        self.filter.add(url.as_str()).ok();
        let state = Arc::new(HostState::open(std::path::Path::new(&self.config.data_dir), &base, depth)?);
        state.queue.put(&url.to_string())?;
        hosts.insert(base.clone(), Arc::clone(&state));
        drop(hosts);
        let _ = self.base_tx.send((base, depth));
        Ok(())
    }

    /// Like `append`, but used for seeding the bare base URL alongside an
    /// already-appended seed page: only pushes if the base's host is
    /// already known (it always will be, since `seed` calls `append` first).
    async fn push_to_existing_or_append(&self, url: Url, depth: i64) -> Result<()> {
        self.append(url, depth).await
    }

    async fn ensure_host(&self, base_url: &Url, depth: i64) -> Result<()> {
        let base = origin_of(base_url)?;
        let mut hosts = self.hosts.lock().await;
        if hosts.contains_key(&base) {
            return Ok(());
        }
        let state = Arc::new(HostState::open(std::path::Path::new(&self.config.data_dir), &base, depth)?);
        hosts.insert(base.clone(), Arc::clone(&state));
        drop(hosts);
        let _ = self.base_tx.send((base, depth));
        Ok(())
    }

    /// All currently-known `(base, depth)` pairs, for the scheduler's
    /// initial phase seeding.
    pub async fn snapshot_bases(&self) -> Vec<(String, i64)> {
        self.hosts.lock().await.values().map(|h| (h.base.clone(), h.depth)).collect()
    }

    pub async fn host(&self, base: &str) -> Option<Arc<HostState>> {
        self.hosts.lock().await.get(base).cloned()
    }
}

fn origin_of(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| crate::error::CrawlError::InvalidUrl(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// Host equivalence: compare scheme + normalised host (stripping a leading
/// `www.`/`m.` label) rather than stripping substrings from raw strings.
fn url_belongs_to_base(url: &Url, base: &str) -> bool {
    let Ok(base_url) = Url::parse(base) else { return false };
    let (Some(uh), Some(bh)) = (url.host_str(), base_url.host_str()) else { return false };
    url.scheme() == base_url.scheme() && normalize_host(uh) == normalize_host(bh)
}

fn normalize_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    host.strip_prefix("www.").or_else(|| host.strip_prefix("m.")).map(str::to_string).unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use tempfile::TempDir;

    async fn test_frontier(crawl_depth: usize) -> (Frontier<SqliteStorage>, mpsc::UnboundedReceiver<(String, i64)>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.crawl_depth = crawl_depth;
        config.data_dir = dir.path().to_string_lossy().to_string();
        let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let filter = Arc::new(MembershipFilter::new(1000, 0.01, crate::membership::GrowthMode::default()));
        let (frontier, rx) = Frontier::new(Arc::new(config), storage, filter);
        (frontier, rx, dir)
    }

    #[tokio::test]
    async fn seeding_creates_host_at_depth_zero() {
        let (frontier, _rx, _dir) = test_frontier(0).await;
        let seed = Url::parse("https://example.test/").unwrap();
        frontier.seed(&[seed], &[]).await.unwrap();
        let bases = frontier.snapshot_bases().await;
        assert_eq!(bases, vec![("https://example.test".to_string(), 0)]);
    }

    #[tokio::test]
    async fn same_host_link_stays_at_same_depth() {
        let (frontier, _rx, _dir) = test_frontier(1).await;
        let seed = Url::parse("https://example.test/").unwrap();
        frontier.seed(&[seed], &[]).await.unwrap();
        frontier.enqueue(&Url::parse("https://example.test/a").unwrap(), 0).await.unwrap();
        let host = frontier.host("https://example.test").await.unwrap();
        assert_eq!(host.depth, 0);
        assert_eq!(host.queue.get().unwrap(), "https://example.test/");
        assert_eq!(host.queue.get().unwrap(), "https://example.test/a");
    }

    #[tokio::test]
    async fn off_host_link_creates_new_base_at_depth_plus_one() {
        let (frontier, _rx, _dir) = test_frontier(1).await;
        let seed = Url::parse("https://example.test/").unwrap();
        frontier.seed(&[seed], &[]).await.unwrap();
        frontier.enqueue(&Url::parse("https://other.test/x").unwrap(), 0).await.unwrap();
        let other = frontier.host("https://other.test").await.unwrap();
        assert_eq!(other.depth, 1);
    }

    #[tokio::test]
    async fn off_host_link_dropped_when_depth_exceeds_crawl_depth() {
        let (frontier, _rx, _dir) = test_frontier(0).await;
        let seed = Url::parse("https://example.test/").unwrap();
        frontier.seed(&[seed], &[]).await.unwrap();
        frontier.enqueue(&Url::parse("https://other.test/x").unwrap(), 0).await.unwrap();
        assert!(frontier.host("https://other.test").await.is_none());
    }

    #[tokio::test]
    async fn www_and_bare_host_fold_together() {
        let (frontier, _rx, _dir) = test_frontier(0).await;
        let seed = Url::parse("https://www.example.test/").unwrap();
        frontier.seed(&[seed], &[]).await.unwrap();
        frontier.enqueue(&Url::parse("https://example.test/a").unwrap(), 0).await.unwrap();
        assert!(frontier.host("https://example.test").await.is_none());
        let host = frontier.host("https://www.example.test").await.unwrap();
        assert_eq!(host.queue.size(), 2);
    }

    #[tokio::test]
    async fn duplicate_url_is_not_requeued() {
        let (frontier, _rx, _dir) = test_frontier(0).await;
        let seed = Url::parse("https://example.test/").unwrap();
        frontier.seed(&[seed.clone()], &[]).await.unwrap();
        frontier.enqueue(&seed, 0).await.unwrap();
        let host = frontier.host("https://example.test").await.unwrap();
        assert_eq!(host.queue.size(), 1);
    }

    #[tokio::test]
    async fn fragment_is_stripped_before_dedup() {
        let (frontier, _rx, _dir) = test_frontier(0).await;
        let seed = Url::parse("https://example.test/").unwrap();
        frontier.seed(&[seed], &[]).await.unwrap();
        frontier.enqueue(&Url::parse("https://example.test/a#section").unwrap(), 0).await.unwrap();
        frontier.enqueue(&Url::parse("https://example.test/a").unwrap(), 0).await.unwrap();
        let host = frontier.host("https://example.test").await.unwrap();
        assert_eq!(host.queue.size(), 2);
    }
}
