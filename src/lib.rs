//! nieuwscrawl: a polite, multi-site web crawler.
//!
//! Discovers pages via `robots.txt`-declared sitemaps and in-page links,
//! respects per-host crawl delay and fetch permission, and persists
//! extracted page structure (headings, paragraphs, head metadata) to
//! SQLite.

pub mod config;
pub mod error;
pub mod extract;
pub mod frontier;
pub mod http;
pub mod logging;
pub mod membership;
pub mod robots;
pub mod scheduler;
pub mod sitemap;
pub mod spillqueue;
pub mod storage;
pub mod supervisor;
pub mod validator;
