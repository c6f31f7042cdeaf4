//! Breadth-first company website scraper.
//!
//! The scraper starts from the domain's home page, follows same-host links
//! up to a depth and page budget, and returns the combined visible text plus
//! every e-mail address on the target domain it saw along the way.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use scraper::Html;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;

use dealdriver_shared::{AppConfig, DealDriverError, Result, ScrapeOutput};

use crate::extract::{
    compute_hash, extract_emails, extract_links, extract_text, merge_emails, normalize_url,
    truncate_chars,
};
use crate::session::BrowserSession;

// ---------------------------------------------------------------------------
// Scraper trait
// ---------------------------------------------------------------------------

/// The Scrape stage collaborator.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Scrape `domain` using the leased session.
    async fn scrape(&self, session: &BrowserSession, domain: &str) -> Result<ScrapeOutput>;
}

// ---------------------------------------------------------------------------
// ScrapeConfig
// ---------------------------------------------------------------------------

/// Runtime scrape configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Maximum link depth from the home page.
    pub depth: u32,
    /// Maximum pages fetched per domain.
    pub max_pages: usize,
    /// Concurrent page fetches within one domain.
    pub concurrency: usize,
    /// Combined text is truncated to this many characters.
    pub max_content_length: usize,
}

impl From<&AppConfig> for ScrapeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            depth: config.defaults.crawl_depth,
            max_pages: config.defaults.max_pages,
            concurrency: 3,
            max_content_length: config.scraping.max_content_length,
        }
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// HttpScraper
// ---------------------------------------------------------------------------

struct FetchedPage {
    url: Url,
    depth: u32,
    text: String,
    emails: Vec<String>,
    links: Vec<Url>,
}

/// Scraper that crawls the company site over plain HTTP(S).
pub struct HttpScraper {
    config: ScrapeConfig,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpScraper {
    pub fn new(config: ScrapeConfig) -> Self {
        Self {
            config,
            allow_localhost: false,
        }
    }

    /// Allow crawling localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Crawl from `start_url`, keeping e-mails that belong to `domain`.
    #[instrument(skip_all, fields(start_url = %start_url, domain = %domain))]
    pub async fn scrape_url(
        &self,
        session: &BrowserSession,
        start_url: &Url,
        domain: &str,
    ) -> Result<ScrapeOutput> {
        if !self.allow_localhost && is_ssrf_target(start_url) {
            return Err(DealDriverError::validation(format!(
                "refusing to scrape {start_url}: private or local address"
            )));
        }

        let base_host = start_url.host_str().unwrap_or("").to_string();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: Vec<(Url, u32)> = vec![(start_url.clone(), 0)];
        let mut pages: Vec<FetchedPage> = Vec::new();
        let mut emails: Vec<String> = Vec::new();
        let mut entry_error: Option<DealDriverError> = None;

        while !queue.is_empty() && pages.len() < self.config.max_pages {
            let budget = self.config.max_pages - pages.len();
            let mut batch = Vec::new();
            while let Some((url, depth)) = queue.pop() {
                if batch.len() >= budget.min(self.config.concurrency.max(1)) {
                    queue.push((url, depth));
                    break;
                }
                if url.host_str().unwrap_or("") != base_host
                    || !matches!(url.scheme(), "http" | "https")
                {
                    continue;
                }
                if !visited.insert(normalize_url(&url)) {
                    continue;
                }
                if !self.allow_localhost && is_ssrf_target(&url) {
                    warn!(%url, "SSRF protection: blocked");
                    continue;
                }
                batch.push((url, depth));
            }

            let mut handles = Vec::new();
            for (url, depth) in batch {
                let client = session.client().clone();
                let sem = semaphore.clone();
                let domain = domain.to_string();
                handles.push(tokio::spawn(async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| DealDriverError::Network(e.to_string()))?;
                    fetch_page(&client, url, depth, &domain).await
                }));
            }

            let mut next_level = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok(Ok(page)) => {
                        if page.depth < self.config.depth {
                            next_level.extend(page.links.iter().cloned().map(|u| (u, page.depth + 1)));
                        }
                        merge_emails(&mut emails, page.emails.clone());
                        pages.push(page);
                    }
                    Ok(Err(e)) => {
                        if pages.is_empty() && entry_error.is_none() {
                            entry_error = Some(e);
                        } else {
                            debug!(error = %e, "page fetch failed, continuing");
                        }
                    }
                    Err(e) => warn!(error = %e, "page fetch task failed"),
                }
            }

            // `queue` is consumed from the back; keep breadth-first order.
            next_level.reverse();
            let mut rest = std::mem::take(&mut queue);
            queue = next_level;
            queue.append(&mut rest);

            if pages.is_empty() {
                break;
            }
        }

        if pages.is_empty() {
            return Err(entry_error.unwrap_or_else(|| {
                DealDriverError::Network(format!("{start_url}: no pages could be fetched"))
            }));
        }

        let combined = pages
            .iter()
            .map(|p| format!("=== {} ===\n{}", p.url, p.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let content = truncate_chars(&combined, self.config.max_content_length).to_string();

        info!(
            pages = pages.len(),
            emails = emails.len(),
            chars = content.chars().count(),
            "scrape completed"
        );

        Ok(ScrapeOutput {
            url: start_url.to_string(),
            content_hash: Some(compute_hash(&content)),
            content,
            emails,
            pages_scraped: pages.len(),
        })
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, session: &BrowserSession, domain: &str) -> Result<ScrapeOutput> {
        let https = Url::parse(&format!("https://{domain}/"))
            .map_err(|e| DealDriverError::validation(format!("{domain}: {e}")))?;

        match self.scrape_url(session, &https, domain).await {
            Ok(out) => Ok(out),
            Err(DealDriverError::Network(msg)) => {
                debug!(domain, error = %msg, "https failed, retrying over http");
                let http = Url::parse(&format!("http://{domain}/"))
                    .map_err(|e| DealDriverError::validation(format!("{domain}: {e}")))?;
                self.scrape_url(session, &http, domain).await
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

// ---------------------------------------------------------------------------
// Page fetching
// ---------------------------------------------------------------------------

async fn fetch_page(
    client: &reqwest::Client,
    url: Url,
    depth: u32,
    domain: &str,
) -> Result<FetchedPage> {
    debug!(%url, depth, "fetching page");

    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| DealDriverError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DealDriverError::Network(format!("{url}: HTTP {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| DealDriverError::Network(format!("{url}: body read failed: {e}")))?;

    let emails = extract_emails(&body, domain);
    let doc = Html::parse_document(&body);
    let text = extract_text(&doc);
    let links = extract_links(&doc, &url);

    Ok(FetchedPage {
        url,
        depth,
        text,
        emails,
        links,
    })
}
