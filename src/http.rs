//! HTTP client construction and size-bounded body fetching: a bounded
//! redirect policy and a `fetch_limited` that streams a response body under
//! a byte cap rather than buffering it unconditionally.

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::{header, redirect, Client, StatusCode};
use std::time::Duration;
use url::Url;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("nieuwscrawl/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl HttpOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetch {
    pub final_url: Url,
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub fn build_client_all(opts: &HttpOptions) -> Result<Client> {
    let c = Client::builder()
        .user_agent(opts.user_agent.clone())
        .timeout(opts.timeout)
        .connect_timeout(opts.connect_timeout)
        .redirect(redirect::Policy::limited(10))
        .brotli(true)
        .gzip(true)
        .deflate(true)
        .build()
        .context("failed to build HTTP client")?;
    Ok(c)
}

pub async fn fetch_limited(client: &Client, url: Url, max_bytes: usize) -> Result<HttpFetch> {
    let requested = url.clone();
    let resp = client
        .get(url)
        .header(header::ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.1")
        .send()
        .await
        .with_context(|| format!("HTTP request failed: {requested}"))?;

    let status = resp.status();
    let final_url = resp.url().clone();
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let mut stream = resp.bytes_stream();
    let mut buf = BytesMut::new();

    while let Some(item) = stream.next().await {
        let chunk = item.context("failed while streaming response body")?;
        if buf.len() + chunk.len() > max_bytes {
            return Err(anyhow!(
                "response body too large (>{} bytes) for {final_url}",
                max_bytes
            ));
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(HttpFetch {
        final_url,
        status,
        content_type,
        body: buf.to_vec(),
    })
}

pub fn is_probably_html(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct_l = ct.to_ascii_lowercase();
        if ct_l.contains("text/html") || ct_l.contains("application/xhtml+xml") {
            return true;
        }
        // Some sites send `text/plain` for HTML. Fall through to sniffing.
    }

    // Sniff first couple KB.
    let head = &body[..body.len().min(2048)];
    let head_l = String::from_utf8_lossy(head).to_ascii_lowercase();
    head_l.contains("<html") || head_l.contains("<!doctype html")
}
