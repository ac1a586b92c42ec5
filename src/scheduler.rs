//! Two-phase worker pool: sitemap discovery, then page crawling.
//!
//! The fan-out shape (`JoinSet` fed from a bounded window over a pending
//! work list, `join_next` draining completions to make room for more) runs
//! as two passes, aware of per-host crawl delay and `robots.txt` permission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use reqwest::Client;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use url::Url;

use crate::config::Config;
use crate::crawl_log;
use crate::frontier::{Frontier, HostState};
use crate::http;
use crate::logging::EventKind;
use crate::robots::Robots;
use crate::sitemap;
use crate::storage::{PageSnapshot, StorageGateway};

/// Running totals for one crawl, reported by the supervisor at the end of
/// a run.
#[derive(Debug, Default)]
pub struct CrawlStats {
    pub sites_seen: AtomicU64,
    pub pages_stored: AtomicU64,
    pub pages_skipped: AtomicU64,
    pub errors: AtomicU64,
}

impl CrawlStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.sites_seen.load(Ordering::Relaxed),
            self.pages_stored.load(Ordering::Relaxed),
            self.pages_skipped.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

pub struct Scheduler<S: StorageGateway> {
    config: Arc<Config>,
    storage: Arc<S>,
    frontier: Arc<Frontier<S>>,
    client: Client,
    page_semaphore: Arc<Semaphore>,
    stats: Arc<CrawlStats>,
    shutdown: watch::Receiver<bool>,
}

impl<S: StorageGateway + 'static> Scheduler<S> {
    pub fn new(
        config: Arc<Config>,
        storage: Arc<S>,
        frontier: Arc<Frontier<S>>,
        client: Client,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let page_semaphore = Arc::new(Semaphore::new(config.max_threads));
        Self {
            config,
            storage,
            frontier,
            client,
            page_semaphore,
            stats: Arc::new(CrawlStats::default()),
            shutdown,
        }
    }

    pub fn stats(&self) -> Arc<CrawlStats> {
        Arc::clone(&self.stats)
    }

    /// True once a SIGINT/SIGTERM (or the supervisor's own request) has
    /// asked the crawl to wind down. Workers observing this finish the URL
    /// they're holding and return instead of popping another.
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drive robots + sitemap discovery for every known base, including
    /// bases discovered along the way (a sitemap can reference pages whose
    /// links mint new bases once crawled in phase two, but `append`ing a
    /// brand new site at startup also arrives here via `base_rx`).
    pub async fn run_sitemap_phase(
        self: &Arc<Self>,
        mut base_rx: mpsc::UnboundedReceiver<(String, i64)>,
    ) -> mpsc::UnboundedReceiver<(String, i64)> {
        let mut pending: VecDeque<(String, i64)> = self.frontier.snapshot_bases().await.into();
        let mut joinset: JoinSet<()> = JoinSet::new();

        loop {
            while let Ok(item) = base_rx.try_recv() {
                pending.push_back(item);
            }
            while !self.is_shutting_down() && joinset.len() < self.config.max_concurrent_sitemaps && !pending.is_empty() {
                let (base, depth) = pending.pop_front().unwrap();
                self.stats.sites_seen.fetch_add(1, Ordering::Relaxed);
                let this = Arc::clone(self);
                joinset.spawn(async move { this.sitemap_one(base, depth).await });
            }

            if joinset.is_empty() && (pending.is_empty() || self.is_shutting_down()) {
                if self.is_shutting_down() {
                    break;
                }
                match base_rx.try_recv() {
                    Ok(item) => {
                        pending.push_back(item);
                        continue;
                    }
                    Err(_) => break,
                }
            }

            if joinset.join_next().await.is_none() {
                // joinset empty but pending non-empty: loop immediately to spawn more.
                continue;
            }
        }

        base_rx
    }

    async fn sitemap_one(&self, base: String, depth: i64) {
        let Ok(origin) = Url::parse(&base) else { return };
        let robots_url = match origin.join("robots.txt") {
            Ok(u) => u,
            Err(_) => return,
        };

        let robots = match http::fetch_limited(&self.client, robots_url.clone(), self.config.max_body_bytes).await {
            Ok(resp) if resp.status.is_success() => {
                let body = String::from_utf8_lossy(&resp.body).into_owned();
                Robots::parse(&body)
            }
            Ok(resp) => Robots::from_status(resp.status.as_u16()),
            Err(_) => Robots::default(),
        };

        crawl_log!(EventKind::Sitemap, host = &base, url = robots_url.as_str(), reason = "robots.txt fetched");

        let sitemap_roots = sitemap::candidate_sitemap_urls(&origin, robots.sitemap_urls());

        if let Some(host) = self.frontier.host(&base).await {
            *host.robots.lock().await = Some(robots);
        }

        let entries = match sitemap::crawl_sitemap(
            &self.client,
            self.storage.as_ref(),
            &base,
            &sitemap_roots,
            self.config.max_body_bytes,
            self.config.crawl_delay_sitemap_days,
        )
        .await
        {
            Ok(entries) => entries,
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        for entry in entries {
            self.frontier.enqueue(&entry.url, depth).await.ok();
        }
    }

    /// Drive page fetch/extract/store for every known host, including
    /// hosts minted by links discovered mid-run.
    pub async fn run_page_phase(self: &Arc<Self>, mut base_rx: mpsc::UnboundedReceiver<(String, i64)>) {
        let mut joinset: JoinSet<()> = JoinSet::new();
        for (base, _depth) in self.frontier.snapshot_bases().await {
            if let Some(host) = self.frontier.host(&base).await {
                let this = Arc::clone(self);
                joinset.spawn(async move { this.page_worker(host).await });
            }
        }

        loop {
            if !self.is_shutting_down() {
                while let Ok((base, _depth)) = base_rx.try_recv() {
                    if let Some(host) = self.frontier.host(&base).await {
                        let this = Arc::clone(self);
                        joinset.spawn(async move { this.page_worker(host).await });
                    }
                }
            }
            if joinset.is_empty() {
                if self.is_shutting_down() {
                    break;
                }
                match base_rx.try_recv() {
                    Ok((base, _depth)) => {
                        if let Some(host) = self.frontier.host(&base).await {
                            let this = Arc::clone(self);
                            joinset.spawn(async move { this.page_worker(host).await });
                        }
                        continue;
                    }
                    Err(_) => break,
                }
            }
            joinset.join_next().await;
        }
    }

    async fn page_worker(&self, host: Arc<HostState>) {
        loop {
            if self.is_shutting_down() {
                break;
            }
            let start = Instant::now();

            let url_str = match host.queue.get() {
                Ok(u) => u,
                Err(_) => break,
            };
            let Ok(url) = Url::parse(&url_str) else { continue };

            let floor = self.config.crawl_delay();
            let delay = {
                let guard = host.robots.lock().await;
                guard.as_ref().map(|r| r.crawl_delay(floor)).unwrap_or(floor)
            };

            let allowed = {
                let guard = host.robots.lock().await;
                guard.as_ref().map(|r| r.can_fetch(&self.config.user_agent, &url)).unwrap_or(true)
            };
            if !allowed {
                crawl_log!(EventKind::Skip, host = &host.base, url = url.as_str(), reason = "disallowed by robots.txt");
                self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
                // No network contact was made for this URL, so the per-host
                // delay clock does not apply here.
                continue;
            }

            // Once a fetch attempt is made, the per-host delay applies
            // regardless of how the rest of this iteration turns out.
            'fetch: {
                let _permit = self.page_semaphore.acquire().await.unwrap();

                let fetch = match http::fetch_limited(&self.client, url.clone(), self.config.max_body_bytes).await {
                    Ok(f) => f,
                    Err(e) => {
                        crawl_log!(EventKind::Error, host = &host.base, url = url.as_str(), reason = &e.to_string());
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        break 'fetch;
                    }
                };
                if !fetch.status.is_success() {
                    crawl_log!(EventKind::Skip, host = &host.base, url = url.as_str(), reason = &format!("HTTP {}", fetch.status));
                    self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
                    break 'fetch;
                }
                crawl_log!(EventKind::Fetch, host = &host.base, url = fetch.final_url.as_str(), reason = &format!("HTTP {}", fetch.status));
                if !http::is_probably_html(fetch.content_type.as_deref(), &fetch.body) {
                    self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
                    break 'fetch;
                }

                let text = match crate::extract::decode_body(&url, &fetch.body, fetch.content_type.as_deref()) {
                    Ok(t) => t,
                    Err(e) => {
                        crawl_log!(EventKind::Error, host = &host.base, url = url.as_str(), reason = &e.to_string());
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        break 'fetch;
                    }
                };

                let extraction = match crate::extract::extract(&fetch.final_url, &text, &self.config.robot_nofollow) {
                    Ok(e) => e,
                    Err(e) => {
                        crawl_log!(EventKind::Error, host = &host.base, url = url.as_str(), reason = &e.to_string());
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        break 'fetch;
                    }
                };
                drop(_permit);

                if extraction.followable {
                    for link in &extraction.links {
                        if !link.nofollow {
                            self.frontier.enqueue(&link.url, host.depth).await.ok();
                        }
                    }
                }

                if extraction.archivable {
                    let now = Utc::now();
                    let snapshot = PageSnapshot {
                        url: fetch.final_url.to_string(),
                        site_base: host.base.clone(),
                        crawl_created: now,
                        crawl_modified: now,
                        raw_content: text,
                        head: extraction.head,
                        paragraphs: extraction.paragraphs,
                    };
                    match self.storage.store_page(&snapshot).await {
                        Ok(()) => {
                            crawl_log!(EventKind::Store, host = &host.base, url = fetch.final_url.as_str(), reason = "stored");
                            self.stats.pages_stored.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            crawl_log!(EventKind::Error, host = &host.base, url = fetch.final_url.as_str(), reason = &e.to_string());
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else {
                    self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }

            let elapsed = start.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
    }
}
