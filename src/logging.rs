use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// Install a `tracing-subscriber` fmt layer. Verbosity is driven by
/// `RUST_LOG` when set, falling back to `config.verbose`.
///
/// Event kinds (`INIT|SITEMAP|FETCH|STORE|SKIP|ERROR`) are emitted as
/// structured fields by call sites (see `EventKind::as_str` below), not
/// baked into the subscriber itself, so the formatting layer can render
/// them however the operator prefers.
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.verbose { "debug" } else { "info" })
    });

    fmt().with_env_filter(filter).with_target(false).try_init().ok();
    Ok(())
}

/// One entry per kind of crawl event a call site can log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Init,
    Sitemap,
    Fetch,
    Store,
    Skip,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Init => "INIT",
            EventKind::Sitemap => "SITEMAP",
            EventKind::Fetch => "FETCH",
            EventKind::Store => "STORE",
            EventKind::Skip => "SKIP",
            EventKind::Error => "ERROR",
        }
    }
}

/// Emit one structured log line: timestamp (added by the subscriber), event
/// kind, host, url, reason.
#[macro_export]
macro_rules! crawl_log {
    ($kind:expr, host = $host:expr, url = $url:expr, reason = $reason:expr) => {
        tracing::info!(
            kind = $kind.as_str(),
            host = %$host,
            url = %$url,
            reason = %$reason,
        );
    };
    ($kind:expr, host = $host:expr, url = $url:expr) => {
        tracing::info!(kind = $kind.as_str(), host = %$host, url = %$url);
    };
}
