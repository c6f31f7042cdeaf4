//! In-process fakes shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;

use dealdriver_crawler::{BrowserSession, HttpSessionFactory, Scraper};
use dealdriver_shared::{
    BucketConfig, CompanyAnalysis, DealDriverError, LeadAnalysis, Result, ScrapeOutput, WorkItem,
};
use dealdriver_storage::ArtifactStore;

use crate::enrichment::{Analyzer, LeadContext};
use crate::export::{CsvExporter, ExportTargets};
use crate::import::{CrmClient, UpsertOutcome};
use crate::pool::{PoolLimits, SessionFactory, SessionPool};
use crate::ratelimit::{RateLimiter, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::stages::{AI_RESOURCE, CRM_RESOURCE, Collaborators, SCRAPE_RESOURCE, StageRunner};

pub fn item(domain: &str) -> WorkItem {
    WorkItem::parse(domain).unwrap()
}

pub fn items(n: usize) -> Vec<WorkItem> {
    (0..n).map(|i| item(&format!("company{i:03}.com"))).collect()
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Hands out sequential `u64` "sessions".
#[derive(Debug, Default)]
pub struct CountingFactory {
    created: AtomicUsize,
    fail_first: AtomicUsize,
    delay: Duration,
}

impl CountingFactory {
    pub fn failing_first(n: usize) -> Self {
        Self {
            created: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(n),
            delay: Duration::ZERO,
        }
    }

    /// Every `create` takes `delay` before it resolves.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory<u64> for CountingFactory {
    async fn create(&self) -> Result<u64> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DealDriverError::Network("factory offline".into()));
        }
        Ok(self.created.fetch_add(1, Ordering::SeqCst) as u64 + 1)
    }
}

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

/// One recorded `scrape` call.
#[derive(Debug, Clone)]
pub struct ScrapeSpan {
    pub domain: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct ScraperState {
    calls: HashMap<String, usize>,
    failing: HashSet<String>,
    no_emails: HashSet<String>,
    spans: Vec<ScrapeSpan>,
    delay: Duration,
}

/// Scraper that returns canned content without touching the network.
#[derive(Debug, Default)]
pub struct FakeScraper {
    state: Mutex<ScraperState>,
}

impl FakeScraper {
    pub fn fail(&self, domain: &str) {
        self.state.lock().unwrap().failing.insert(domain.to_string());
    }

    pub fn without_emails(&self, domain: &str) {
        self.state.lock().unwrap().no_emails.insert(domain.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn calls(&self, domain: &str) -> usize {
        self.state.lock().unwrap().calls.get(domain).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }

    pub fn spans(&self) -> Vec<ScrapeSpan> {
        self.state.lock().unwrap().spans.clone()
    }
}

#[async_trait]
impl Scraper for FakeScraper {
    async fn scrape(&self, _session: &BrowserSession, domain: &str) -> Result<ScrapeOutput> {
        let started = Instant::now();
        let (delay, failing, no_emails) = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(domain.to_string()).or_default() += 1;
            (
                state.delay,
                state.failing.contains(domain),
                state.no_emails.contains(domain),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().spans.push(ScrapeSpan {
            domain: domain.to_string(),
            started,
            finished: Instant::now(),
        });

        if failing {
            return Err(DealDriverError::Network(format!("{domain}: connection refused")));
        }
        let emails = if no_emails {
            Vec::new()
        } else {
            vec![format!("jane.doe@{domain}"), format!("sales@{domain}")]
        };
        Ok(ScrapeOutput {
            url: format!("https://{domain}/"),
            content: format!(
                "{domain} manufactures precision components for industrial customers worldwide."
            ),
            emails,
            pages_scraped: 1,
            content_hash: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeAnalyzer {
    company_calls: AtomicUsize,
    lead_calls: AtomicUsize,
    failing_companies: Mutex<HashSet<String>>,
    fail_leads: Mutex<bool>,
    delay: Mutex<Duration>,
}

impl FakeAnalyzer {
    pub fn fail_company(&self, domain: &str) {
        self.failing_companies
            .lock()
            .unwrap()
            .insert(domain.to_string());
    }

    pub fn fail_leads(&self) {
        *self.fail_leads.lock().unwrap() = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn company_calls(&self) -> usize {
        self.company_calls.load(Ordering::SeqCst)
    }

    pub fn lead_calls(&self) -> usize {
        self.lead_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze_company(
        &self,
        domain: &str,
        _content: &str,
        _emails: &[String],
    ) -> Result<CompanyAnalysis> {
        self.company_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.failing_companies.lock().unwrap().contains(domain) {
            return Err(DealDriverError::Analysis("model returned no JSON".into()));
        }
        Ok(CompanyAnalysis {
            industry: "Manufacturing".into(),
            naics_code: "332".into(),
            confidence_score: 0.9,
            ..Default::default()
        })
    }

    async fn analyze_lead(&self, _lead: &LeadContext<'_>) -> Result<LeadAnalysis> {
        self.lead_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if *self.fail_leads.lock().unwrap() {
            return Err(DealDriverError::Analysis("HTTP 500".into()));
        }
        Ok(LeadAnalysis {
            buyer_persona: "End User".into(),
            lead_score_adjustment: 3,
            confidence: 0.7,
            reasoning: "operations contact".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// CRM
// ---------------------------------------------------------------------------

/// In-memory CRM keyed by domain and e-mail.
#[derive(Debug, Default)]
pub struct FakeCrm {
    pub companies: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    pub contacts: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    calls: AtomicUsize,
}

impl FakeCrm {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn upsert(
    records: &Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    key: &str,
    properties: &BTreeMap<String, String>,
) -> UpsertOutcome {
    let previous = records
        .lock()
        .unwrap()
        .insert(key.to_string(), properties.clone());
    if previous.is_some() {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Created
    }
}

#[async_trait]
impl CrmClient for FakeCrm {
    async fn upsert_company(
        &self,
        domain: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(upsert(&self.companies, domain, properties))
    }

    async fn upsert_contact(
        &self,
        email: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(upsert(&self.contacts, email, properties))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Limiter whose buckets never get in the way.
pub fn open_limiter() -> Arc<RateLimiter> {
    let buckets = [SCRAPE_RESOURCE, AI_RESOURCE, CRM_RESOURCE]
        .into_iter()
        .map(|name| (name.to_string(), BucketConfig::new(1000.0, 1000.0, 0)))
        .collect();
    Arc::new(RateLimiter::new(
        buckets,
        RetryPolicy {
            timeout: Duration::from_secs(5),
            retries: 1,
            backoff: Duration::from_millis(10),
        },
    ))
}

pub fn pool_limits(max_sessions: usize) -> PoolLimits {
    PoolLimits {
        max_sessions,
        max_requests_per_session: 50,
        max_age: Duration::from_secs(1800),
        max_idle: Duration::from_secs(600),
        acquire_timeout: Duration::from_secs(30),
        checkout_ceiling: Duration::from_secs(300),
    }
}

/// A scheduler wired to fakes over a temporary data directory.
pub struct Harness {
    pub dir: TempDir,
    pub store: ArtifactStore,
    pub scraper: Arc<FakeScraper>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub exporter: Arc<CsvExporter>,
    pub runner: Arc<StageRunner>,
    pub scheduler: Scheduler,
    pub targets: ExportTargets,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_sessions(4).await
    }

    pub async fn with_sessions(max_sessions: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(&dir.path().join("artifacts"))
            .await
            .unwrap();
        let scraper = Arc::new(FakeScraper::default());
        let analyzer = Arc::new(FakeAnalyzer::default());
        let exporter = Arc::new(CsvExporter::new());
        let sessions: SessionPool<BrowserSession> = SessionPool::new(
            pool_limits(max_sessions),
            Arc::new(HttpSessionFactory::default()),
        );
        let runner = Arc::new(StageRunner::new(
            Collaborators {
                scraper: scraper.clone(),
                analyzer: analyzer.clone(),
                exporter: exporter.clone(),
            },
            sessions,
            open_limiter(),
        ));
        let scheduler = Scheduler::new(store.clone(), runner.clone()).unwrap();
        let targets = ExportTargets::in_dir(&dir.path().join("output"));
        exporter.prepare(&targets).await.unwrap();

        Self {
            dir,
            store,
            scraper,
            analyzer,
            exporter,
            runner,
            scheduler,
            targets,
        }
    }
}
