//! Application configuration for DealDriver.
//!
//! User config lives at `~/.dealdriver/dealdriver.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DealDriverError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "dealdriver.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".dealdriver";

// ---------------------------------------------------------------------------
// Config structs (matching dealdriver.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Scraper settings.
    #[serde(default)]
    pub scraping: ScrapingConfig,

    /// AI analysis API settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// CRM import settings.
    #[serde(default)]
    pub crm: CrmConfig,

    /// Browser session pool limits.
    #[serde(default)]
    pub session_pool: SessionPoolConfig,

    /// Token buckets per external resource.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Distributed-mode broker.
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Where a batch executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In-process worker pool.
    #[default]
    Local,
    /// Per-item tasks published to a broker and run by `dealdriver worker` processes.
    Distributed,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Distributed => f.write_str("distributed"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = DealDriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "distributed" => Ok(Self::Distributed),
            other => Err(DealDriverError::config(format!(
                "unknown execution mode '{other}' (expected local or distributed)"
            ))),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory receiving `companies.csv` and `leads.csv`.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Directory holding stage artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Concurrent work items in local mode.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// Maximum link depth followed from the home page.
    #[serde(default = "default_crawl_depth")]
    pub crawl_depth: u32,

    /// Maximum pages fetched per domain.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Seconds in-flight items may keep running after cancellation.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            data_dir: default_data_dir(),
            workers: default_workers(),
            mode: ExecutionMode::default(),
            crawl_depth: default_crawl_depth(),
            max_pages: default_max_pages(),
            grace_period_secs: default_grace_period(),
        }
    }
}

impl DefaultsConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

fn default_output_dir() -> String {
    "output".into()
}
fn default_data_dir() -> String {
    "data".into()
}
fn default_workers() -> usize {
    4
}
fn default_crawl_depth() -> u32 {
    2
}
fn default_max_pages() -> usize {
    10
}
fn default_grace_period() -> u64 {
    30
}

/// `[scraping]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingConfig {
    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Combined page text is truncated to this many characters.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_content_length: default_max_content_length(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}
fn default_max_content_length() -> usize {
    32_000
}
fn default_user_agent() -> String {
    format!("dealdriver/{}", env!("CARGO_PKG_VERSION"))
}

/// `[analysis]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_analysis_key_env")]
    pub api_key_env: String,

    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_analysis_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_analysis_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_analysis_key_env(),
            endpoint: default_analysis_endpoint(),
            model: default_analysis_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_analysis_timeout(),
        }
    }
}

fn default_analysis_key_env() -> String {
    "DEEPSEEK_API_KEY".into()
}
fn default_analysis_endpoint() -> String {
    "https://api.deepseek.com".into()
}
fn default_analysis_model() -> String {
    "deepseek-chat".into()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_analysis_timeout() -> u64 {
    60
}

/// `[crm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    /// Name of the env var holding the private-app token.
    #[serde(default = "default_crm_token_env")]
    pub token_env: String,

    #[serde(default = "default_crm_base_url")]
    pub base_url: String,

    #[serde(default = "default_crm_timeout")]
    pub timeout_secs: u64,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            token_env: default_crm_token_env(),
            base_url: default_crm_base_url(),
            timeout_secs: default_crm_timeout(),
        }
    }
}

fn default_crm_token_env() -> String {
    "HUBSPOT_TOKEN".into()
}
fn default_crm_base_url() -> String {
    "https://api.hubapi.com".into()
}
fn default_crm_timeout() -> u64 {
    30
}

/// `[session_pool]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPoolConfig {
    /// Maximum live pooled sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// A session is retired after this many requests.
    #[serde(default = "default_max_requests")]
    pub max_requests_per_session: u32,

    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// How long `acquire` blocks at capacity before falling back to an ad-hoc session.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Hard ceiling on a single checkout; longer checkouts are reclaimed.
    #[serde(default = "default_checkout_ceiling")]
    pub checkout_ceiling_secs: u64,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_requests_per_session: default_max_requests(),
            max_age_secs: default_max_age(),
            max_idle_secs: default_max_idle(),
            acquire_timeout_secs: default_acquire_timeout(),
            checkout_ceiling_secs: default_checkout_ceiling(),
        }
    }
}

fn default_max_sessions() -> usize {
    5
}
fn default_max_requests() -> u32 {
    50
}
fn default_max_age() -> u64 {
    30 * 60
}
fn default_max_idle() -> u64 {
    10 * 60
}
fn default_acquire_timeout() -> u64 {
    30
}
fn default_checkout_ceiling() -> u64 {
    300
}

/// One `[rate_limits.buckets.<resource>]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Burst size.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Shortest sleep between re-checks while waiting.
    #[serde(default)]
    pub min_interval_ms: u64,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_per_sec: f64, min_interval_ms: u64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            min_interval_ms,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::new(1.0, 1.0, 0)
    }
}

/// `[rate_limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Longest a single acquire may wait.
    #[serde(default = "default_rate_timeout")]
    pub acquire_timeout_secs: u64,

    /// Extra attempts after a rate-limit timeout before the stage fails.
    #[serde(default = "default_rate_retries")]
    pub retries: u32,

    /// Base backoff between attempts, doubled each time.
    #[serde(default = "default_rate_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_buckets")]
    pub buckets: BTreeMap<String, BucketConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: default_rate_timeout(),
            retries: default_rate_retries(),
            backoff_ms: default_rate_backoff(),
            buckets: default_buckets(),
        }
    }
}

impl RateLimitsConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_rate_timeout() -> u64 {
    60
}
fn default_rate_retries() -> u32 {
    3
}
fn default_rate_backoff() -> u64 {
    500
}
fn default_buckets() -> BTreeMap<String, BucketConfig> {
    BTreeMap::from([
        ("ai-api".to_string(), BucketConfig::new(5.0, 2.0, 200)),
        ("crm".to_string(), BucketConfig::new(20.0, 10.0, 50)),
        ("scrape".to_string(), BucketConfig::new(5.0, 3.0, 100)),
    ])
}

/// `[broker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Shared spool directory for distributed mode.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,

    /// A claimed task whose worker stays silent this long is re-queued.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Concurrent tasks per `dealdriver worker` process.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            lease_secs: default_lease(),
            poll_interval_ms: default_poll_interval(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

impl BrokerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_spool_dir() -> String {
    "data/broker".into()
}
fn default_lease() -> u64 {
    600
}
fn default_poll_interval() -> u64 {
    500
}
fn default_worker_concurrency() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.dealdriver/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DealDriverError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.dealdriver/dealdriver.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DealDriverError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        DealDriverError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| DealDriverError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DealDriverError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| DealDriverError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path.to_path_buf())
}

/// Read a secret from the env var named in config.
pub fn resolve_secret(var_name: &str, purpose: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(DealDriverError::config(format!(
            "{purpose} not found. Set the {var_name} environment variable."
        ))),
    }
}

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.defaults.workers == 0 {
            return Err(DealDriverError::config("defaults.workers must be at least 1"));
        }
        if self.session_pool.max_sessions == 0 {
            return Err(DealDriverError::config(
                "session_pool.max_sessions must be at least 1",
            ));
        }
        if self.broker.worker_concurrency == 0 {
            return Err(DealDriverError::config(
                "broker.worker_concurrency must be at least 1",
            ));
        }
        for (name, bucket) in &self.rate_limits.buckets {
            let positive = |v: f64| v.is_finite() && v > 0.0;
            if !positive(bucket.capacity) || !positive(bucket.refill_per_sec) {
                return Err(DealDriverError::config(format!(
                    "rate_limits.buckets.{name}: capacity and refill_per_sec must be positive and finite"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("DEEPSEEK_API_KEY"));
        assert!(toml_str.contains("[rate_limits.buckets.ai-api]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.crawl_depth, 2);
        assert_eq!(parsed.session_pool.max_sessions, 5);
        assert_eq!(parsed.rate_limits.buckets["crm"].capacity, 20.0);
        assert_eq!(parsed.defaults.mode, ExecutionMode::Local);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
workers = 8
mode = "distributed"

[rate_limits.buckets.scrape]
capacity = 2.0
refill_per_sec = 0.5
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.workers, 8);
        assert_eq!(config.defaults.mode, ExecutionMode::Distributed);
        assert_eq!(config.defaults.output_dir, "output");
        // An explicit table replaces the default bucket set.
        assert_eq!(config.rate_limits.buckets.len(), 1);
        assert_eq!(config.rate_limits.buckets["scrape"].min_interval_ms, 0);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.defaults.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_finite_buckets() {
        for rate in [f64::NAN, f64::INFINITY, 0.0] {
            let mut config = AppConfig::default();
            config
                .rate_limits
                .buckets
                .insert("scrape".into(), BucketConfig::new(5.0, rate, 100));
            assert!(config.validate().is_err(), "rate {rate} accepted");
        }

        let mut config = AppConfig::default();
        config
            .rate_limits
            .buckets
            .insert("scrape".into(), BucketConfig::new(f64::NAN, 1.0, 100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn init_and_load_from_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        init_config_at(&path).expect("init");
        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.broker.spool_dir, "data/broker");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("Local".parse::<ExecutionMode>().unwrap(), ExecutionMode::Local);
        assert!("celery".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn missing_secret_is_config_error() {
        let result = resolve_secret("DD_TEST_NONEXISTENT_KEY_12345", "Analysis API key");
        assert!(result.unwrap_err().to_string().contains("DD_TEST_NONEXISTENT_KEY_12345"));
    }
}
