//! Top-level crawl lifecycle: open storage and queues for every configured
//! site, run sitemap discovery, then run the page crawl, unconditionally,
//! once per process. Repeating a crawl is left to an external scheduler
//! (cron, a supervising service) rather than an internal sleep-and-repeat
//! loop.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::Config;
use crate::crawl_log;
use crate::frontier::Frontier;
use crate::http::{build_client_all, HttpOptions};
use crate::logging::{self, EventKind};
use crate::membership::{GrowthMode, MembershipFilter};
use crate::scheduler::Scheduler;
use crate::storage::{SqliteStorage, StorageGateway};

/// Final tally for one run, suitable for logging or a process exit-code
/// decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlSummary {
    pub sites_seen: u64,
    pub pages_stored: u64,
    pub pages_skipped: u64,
    pub errors: u64,
}

impl CrawlSummary {
    /// A run that stored nothing but produced errors counts as a failure;
    /// partial success (some pages stored despite some errors) exits zero.
    pub fn exit_code(&self) -> i32 {
        if self.errors > 0 && self.pages_stored == 0 {
            1
        } else {
            0
        }
    }
}

/// Bloom filter sizing: generous enough that a typical run's entire
/// membership (sites + pages) fits inside the first couple of tiers.
const MEMBERSHIP_INITIAL_CAPACITY: usize = 200_000;
const MEMBERSHIP_TARGET_FP: f64 = 1e-4;

pub async fn run(config: Config) -> anyhow::Result<CrawlSummary> {
    logging::init(&config)?;
    let config = Arc::new(config);
    crawl_log!(EventKind::Init, host = "-", url = "-", reason = "starting crawl");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = Path::new(&config.data_dir).join(&config.database_filename);
    let storage = Arc::new(SqliteStorage::open(&db_path).await?);

    let filter = Arc::new(MembershipFilter::new(
        MEMBERSHIP_INITIAL_CAPACITY,
        MEMBERSHIP_TARGET_FP,
        GrowthMode::default(),
    ));

    // Rehydrate the membership filter from storage so a restarted run
    // doesn't re-crawl everything it already knows about.
    let known_sites = storage.list_sites().await?;
    for site in &known_sites {
        filter.add(&site.base).ok();
    }
    let recent_pages = storage.list_recent_pages(config.revisit_after_days).await?;
    for page in &recent_pages {
        filter.add(&page.url).ok();
    }

    let (frontier, base_rx_a) = Frontier::new(Arc::clone(&config), Arc::clone(&storage), Arc::clone(&filter));
    let frontier = Arc::new(frontier);

    let stored_sites: Vec<(String, i64)> = known_sites.into_iter().map(|s| (s.base, s.depth)).collect();
    let seed_urls = config.seed_urls()?;
    frontier.seed(&seed_urls, &stored_sites).await?;

    let http_opts = HttpOptions::from_config(&config);
    let client = build_client_all(&http_opts)?;

    // A shutdown signal (SIGINT/SIGTERM) sets a "draining" flag; workers
    // observing it finish the URL they're holding, then exit rather than
    // popping another. No forced termination mid-fetch.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&config),
        Arc::clone(&storage),
        Arc::clone(&frontier),
        client,
        shutdown_rx,
    ));

    // Phase A: robots + sitemap discovery for every known (and newly
    // minted) base. The channel is handed back so phase B keeps listening
    // on the same stream for bases minted by links followed mid-crawl.
    let base_rx_b = scheduler.run_sitemap_phase(base_rx_a).await;
    scheduler.run_page_phase(base_rx_b).await;

    let (sites_seen, pages_stored, pages_skipped, errors) = scheduler.stats().snapshot();
    let summary = CrawlSummary { sites_seen, pages_stored, pages_skipped, errors };

    crawl_log!(
        EventKind::Init,
        host = "-",
        url = "-",
        reason = &format!(
            "crawl finished at {}: {} sites, {} stored, {} skipped, {} errors",
            Utc::now().to_rfc3339(),
            summary.sites_seen,
            summary.pages_stored,
            summary.pages_skipped,
            summary.errors
        )
    );

    Ok(summary)
}
