//! Token-bucket rate limiting per external resource.
//!
//! One [`RateLimiter`] is built per process and handed to every stage that
//! talks to a rate-limited API. Buckets refill lazily: each acquire adds
//! `elapsed * rate` tokens (capped at capacity) and takes its cost in the
//! same critical section, so concurrent callers can never overdraw a bucket.
//! Waiting happens outside the lock.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dealdriver_shared::{BucketConfig, DealDriverError, RateLimitsConfig, Result};

/// Bucket used for resources with no configured entry.
const FALLBACK_BUCKET: BucketConfig = BucketConfig {
    capacity: 1.0,
    refill_per_sec: 1.0,
    min_interval_ms: 0,
};

#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.refill_per_sec).min(self.config.capacity);
        self.last_refill = now;
    }

    /// Take `cost` tokens, or return how long until enough have accrued.
    fn try_take(&mut self, cost: f64, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            return Ok(());
        }
        let shortfall = cost - self.tokens;
        // Tiny or broken rates give waits longer than any deadline.
        let wait = Duration::try_from_secs_f64(shortfall / self.config.refill_per_sec)
            .unwrap_or(Duration::MAX);
        Err(wait.max(self.config.min_interval()))
    }
}

/// Retry policy applied by [`RateLimiter::acquire_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Longest a single acquire attempt may wait.
    pub timeout: Duration,
    /// Extra attempts after the first timeout.
    pub retries: u32,
    /// Sleep before retry `n` is `backoff * 2^n`.
    pub backoff: Duration,
}

impl From<&RateLimitsConfig> for RetryPolicy {
    fn from(config: &RateLimitsConfig) -> Self {
        Self {
            timeout: config.acquire_timeout(),
            retries: config.retries,
            backoff: config.backoff(),
        }
    }
}

/// Registry of token buckets keyed by resource name.
#[derive(Debug)]
pub struct RateLimiter {
    configs: BTreeMap<String, BucketConfig>,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    retry: RetryPolicy,
}

impl RateLimiter {
    pub fn new(configs: BTreeMap<String, BucketConfig>, retry: RetryPolicy) -> Self {
        Self {
            configs,
            buckets: RwLock::new(HashMap::new()),
            retry,
        }
    }

    pub fn from_config(config: &RateLimitsConfig) -> Self {
        Self::new(config.buckets.clone(), RetryPolicy::from(config))
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn bucket(&self, resource: &str) -> Result<Arc<Mutex<Bucket>>> {
        {
            let buckets = self.buckets.read().map_err(|_| poisoned(resource))?;
            if let Some(bucket) = buckets.get(resource) {
                return Ok(bucket.clone());
            }
        }

        let mut buckets = self.buckets.write().map_err(|_| poisoned(resource))?;
        let config = self.configs.get(resource).copied().unwrap_or_else(|| {
            debug!(resource, "no bucket configured, using fallback");
            FALLBACK_BUCKET
        });
        Ok(buckets
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(config, Instant::now()))))
            .clone())
    }

    /// Take `cost` tokens from `resource`, waiting up to `timeout`.
    ///
    /// Returns how long the caller waited.
    pub async fn acquire(
        &self,
        resource: &str,
        cost: f64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let bucket = self.bucket(resource)?;
        let capacity = bucket.lock().map_err(|_| poisoned(resource))?.config.capacity;
        if cost <= 0.0 || cost > capacity {
            return Err(DealDriverError::validation(format!(
                "cost {cost} for {resource} must be in (0, {capacity}]"
            )));
        }

        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            let now = Instant::now();
            let wait = match bucket.lock().map_err(|_| poisoned(resource))?.try_take(cost, now) {
                Ok(()) => return Ok(now - start),
                Err(wait) => wait,
            };

            if now >= deadline {
                return Err(DealDriverError::RateLimitTimeout {
                    resource: resource.to_string(),
                    waited: now - start,
                });
            }

            let wake = now.checked_add(wait).map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = cancel.cancelled() => return Err(DealDriverError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// [`acquire`](Self::acquire) with the configured timeout, retrying
    /// timeouts with exponential backoff.
    pub async fn acquire_with_retry(
        &self,
        resource: &str,
        cost: f64,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let mut attempt = 0;
        loop {
            match self.acquire(resource, cost, self.retry.timeout, cancel).await {
                Err(DealDriverError::RateLimitTimeout { waited, .. }) if attempt < self.retry.retries => {
                    let backoff = self.retry.backoff * 2u32.saturating_pow(attempt);
                    warn!(resource, attempt, ?waited, ?backoff, "rate limit timeout, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DealDriverError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Run `call` after taking one token from `resource`.
    ///
    /// A [`DealDriverError::RateLimitTimeout`] from the call itself (the
    /// remote API pushing back) is retried under the same policy as a local
    /// timeout.
    pub async fn run<T, F, Fut>(
        &self,
        resource: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            self.acquire_with_retry(resource, 1.0, cancel).await?;
            match call().await {
                Err(DealDriverError::RateLimitTimeout { waited, .. }) if attempt < self.retry.retries => {
                    let backoff = (self.retry.backoff * 2u32.saturating_pow(attempt)).max(waited);
                    warn!(resource, attempt, ?backoff, "remote rate limit, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DealDriverError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Tokens currently available for `resource` after refill.
    pub fn available(&self, resource: &str) -> Result<f64> {
        let bucket = self.bucket(resource)?;
        let mut bucket = bucket.lock().map_err(|_| poisoned(resource))?;
        bucket.refill(Instant::now());
        Ok(bucket.tokens)
    }
}

fn poisoned(resource: &str) -> DealDriverError {
    DealDriverError::Storage(format!("rate limiter state for {resource} is poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(capacity: f64, rate: f64, min_interval_ms: u64) -> RateLimiter {
        RateLimiter::new(
            BTreeMap::from([(
                "ai-api".to_string(),
                BucketConfig::new(capacity, rate, min_interval_ms),
            )]),
            RetryPolicy {
                timeout: Duration::from_millis(100),
                retries: 2,
                backoff: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_granted_immediately() {
        let limiter = limiter(3.0, 1.0, 0);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let waited = limiter
                .acquire("ai-api", 1.0, Duration::from_secs(1), &cancel)
                .await
                .unwrap();
            assert_eq!(waited, Duration::ZERO);
        }
        assert!(limiter.available("ai-api").unwrap() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_refill() {
        let limiter = limiter(1.0, 2.0, 0);
        let cancel = CancellationToken::new();
        limiter
            .acquire("ai-api", 1.0, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        let waited = limiter
            .acquire("ai-api", 1.0, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(waited >= Duration::from_millis(499), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(600), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_starved() {
        let limiter = limiter(1.0, 0.1, 0);
        let cancel = CancellationToken::new();
        limiter
            .acquire("ai-api", 1.0, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let err = limiter
            .acquire("ai-api", 1.0, Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DealDriverError::RateLimitTimeout { ref resource, .. } if resource == "ai-api"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let limiter = Arc::new(limiter(1.0, 0.01, 0));
        let cancel = CancellationToken::new();
        limiter
            .acquire("ai-api", 1.0, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                limiter
                    .acquire("ai-api", 1.0, Duration::from_secs(600), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_cost_above_capacity() {
        let limiter = limiter(2.0, 1.0, 0);
        let err = limiter
            .acquire("ai-api", 3.0, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DealDriverError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_configured_attempts() {
        let limiter = limiter(1.0, 0.001, 0);
        let cancel = CancellationToken::new();
        limiter.acquire_with_retry("ai-api", 1.0, &cancel).await.unwrap();

        let start = Instant::now();
        let err = limiter
            .acquire_with_retry("ai-api", 1.0, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DealDriverError::RateLimitTimeout { .. }));
        // Three 100ms attempts plus 10ms + 20ms backoff.
        assert!(start.elapsed() >= Duration::from_millis(330));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_resource_uses_fallback_bucket() {
        let limiter = limiter(5.0, 5.0, 0);
        let cancel = CancellationToken::new();
        limiter
            .acquire("crm", 1.0, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert!(
            limiter
                .acquire("crm", 1.0, Duration::from_millis(10), &cancel)
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_remote_pushback() {
        let limiter = limiter(10.0, 10.0, 0);
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let value = limiter
            .run("ai-api", &cancel, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(DealDriverError::RateLimitTimeout {
                            resource: "ai-api".into(),
                            waited: Duration::from_secs(1),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_refill_rate_times_out() {
        let limiter = limiter(1.0, 1e-20, 0);
        let cancel = CancellationToken::new();
        limiter
            .acquire("ai-api", 1.0, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let second = limiter
            .acquire("ai-api", 1.0, Duration::from_secs(1), &cancel)
            .await;
        assert!(matches!(second, Err(DealDriverError::RateLimitTimeout { .. })));
    }

    /// Grants over any window T never exceed capacity + rate * T.
    #[tokio::test(start_paused = true)]
    async fn grants_never_exceed_window_budget() {
        let limiter = Arc::new(limiter(5.0, 2.0, 50));
        let cancel = CancellationToken::new();
        let granted = Arc::new(AtomicUsize::new(0));
        let window = Duration::from_secs(3);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let granted = granted.clone();
            handles.push(tokio::spawn(async move {
                if limiter
                    .acquire("ai-api", 1.0, Duration::from_secs(60), &cancel)
                    .await
                    .is_ok()
                    && start.elapsed() <= window
                {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        tokio::time::sleep(window + Duration::from_millis(1)).await;
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let budget = 5.0 + 2.0 * window.as_secs_f64();
        let granted = granted.load(Ordering::SeqCst);
        assert!(granted as f64 <= budget, "granted {granted} > {budget}");
        assert!(granted >= 10, "only {granted} grants");
    }
}
