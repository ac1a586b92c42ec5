use thiserror::Error;

/// Domain errors surfaced by the crawl engine's components.
///
/// Workers match on the variant and decide locally (retry, skip, escalate)
/// rather than unwinding; only initialisation failures (`Config`, `Storage`
/// on startup) are meant to propagate out of `Supervisor::run`.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("http status {status} from {url}")]
    Http { status: u16, url: String },

    #[error("could not decode body of {url} with any candidate encoding (last tried: {last_encoding})")]
    Decode { url: String, last_encoding: String },

    #[error("parse error in {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("queue is empty")]
    QueueEmpty,

    #[error("queue is closed")]
    QueueClosed,

    #[error("membership filter at capacity ceiling, false-positive rate degrading")]
    MembershipFull,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CrawlError>;
