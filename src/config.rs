use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Every crawl tunable: seed sites, politeness, concurrency, storage
/// locations.
///
/// Loaded from a TOML file and then overridden by `NIEUWSCRAWL_*` environment
/// variables; the CLI itself takes no required arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub user_agent: String,
    pub user_agent_info: HashMap<String, String>,
    pub sites: Vec<String>,
    pub crawl_depth: usize,
    pub crawl_delay_secs: u64,
    pub crawl_delay_sitemap_days: i64,
    pub revisit_after_days: i64,
    pub max_threads: usize,
    pub max_concurrent_sitemaps: usize,
    pub always_include_base_in_crawlable_link_queue: bool,
    pub robot_nofollow: Vec<String>,
    pub nofollow: Vec<String>,
    pub verbose: bool,
    pub log_filename: Option<String>,
    pub database_filename: String,
    pub data_dir: String,
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: format!("nieuwscrawl/{}", env!("CARGO_PKG_VERSION")),
            user_agent_info: HashMap::new(),
            sites: Vec::new(),
            crawl_depth: 0,
            crawl_delay_secs: 1,
            crawl_delay_sitemap_days: 1,
            revisit_after_days: 7,
            max_threads: 30,
            max_concurrent_sitemaps: 8,
            always_include_base_in_crawlable_link_queue: false,
            robot_nofollow: vec![
                "nofollow".to_string(),
                "noarchive".to_string(),
                "nosnippet".to_string(),
                "noindex".to_string(),
            ],
            nofollow: vec![
                "facebook".to_string(),
                "twitter".to_string(),
                "instagram".to_string(),
                "linkedin".to_string(),
                "youtube".to_string(),
                "flickr".to_string(),
                "github".to_string(),
                "wikipedia".to_string(),
                "wikimedia".to_string(),
                "pinterest".to_string(),
            ],
            verbose: false,
            log_filename: None,
            database_filename: "nieuwscrawl.sqlite3".to_string(),
            data_dir: "data".to_string(),
            max_body_bytes: 32 * 1024 * 1024,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file (if present) and apply
    /// `NIEUWSCRAWL_*` environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let text = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file: {}", p.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("failed to parse config file: {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("NIEUWSCRAWL_USER_AGENT") {
            self.user_agent = v;
        }
        if let Ok(v) = env::var("NIEUWSCRAWL_SITES") {
            self.sites = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = env::var("NIEUWSCRAWL_CRAWL_DEPTH") {
            self.crawl_depth = v.parse().context("invalid NIEUWSCRAWL_CRAWL_DEPTH")?;
        }
        if let Ok(v) = env::var("NIEUWSCRAWL_CRAWL_DELAY") {
            self.crawl_delay_secs = v.parse().context("invalid NIEUWSCRAWL_CRAWL_DELAY")?;
        }
        if let Ok(v) = env::var("NIEUWSCRAWL_MAX_THREADS") {
            self.max_threads = v.parse().context("invalid NIEUWSCRAWL_MAX_THREADS")?;
        }
        if let Ok(v) = env::var("NIEUWSCRAWL_DATABASE_FILENAME") {
            self.database_filename = v;
        }
        if let Ok(v) = env::var("NIEUWSCRAWL_VERBOSE") {
            self.verbose = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for s in &self.sites {
            Url::parse(s).with_context(|| format!("invalid seed site url: {s}"))?;
        }
        if self.max_threads == 0 {
            anyhow::bail!("max_threads must be >= 1");
        }
        if self.max_concurrent_sitemaps == 0 {
            anyhow::bail!("max_concurrent_sitemaps must be >= 1");
        }
        Ok(())
    }

    pub fn crawl_delay(&self) -> Duration {
        Duration::from_secs(self.crawl_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn seed_urls(&self) -> Result<Vec<Url>> {
        self.sites
            .iter()
            .map(|s| Url::parse(s).with_context(|| format!("invalid seed site url: {s}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_threads, 30);
        assert_eq!(cfg.crawl_delay_secs, 1);
    }

    #[test]
    fn rejects_bad_seed_url() {
        let mut cfg = Config::default();
        cfg.sites.push("not-a-url".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_toml() {
        let toml_text = r#"
            sites = ["https://example.test/"]
            crawl_depth = 2
            max_threads = 4
        "#;
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.crawl_depth, 2);
        assert_eq!(cfg.max_threads, 4);
        // Fields absent from the TOML fall back to defaults.
        assert_eq!(cfg.crawl_delay_secs, 1);
    }
}
