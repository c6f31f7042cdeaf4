//! Bounded pool of heavyweight scraping sessions.
//!
//! At most `max_sessions` pooled sessions are alive at once. Idle sessions are
//! reused until they hit a request-count, age, or idle limit, and are then
//! retired. When the pool is at capacity, [`SessionPool::acquire`] blocks up to
//! a timeout and then reports [`DealDriverError::ResourceExhausted`];
//! [`SessionPool::checkout`] turns that into an unpooled [`SessionLease::Adhoc`]
//! session so the caller still makes progress.
//!
//! Every checkout carries a deadline. Checkouts held past the hard ceiling
//! are reclaimed: the slot is freed for other callers, and the late session
//! is destroyed instead of returned when its holder finally lets go.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dealdriver_crawler::{BrowserSession, HttpSessionFactory};
use dealdriver_shared::{DealDriverError, Result, SessionPoolConfig};

/// How often a blocked `acquire` re-checks for reclaimable checkouts.
const RECLAIM_POLL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates the sessions the pool manages.
#[async_trait]
pub trait SessionFactory<S>: Send + Sync {
    async fn create(&self) -> Result<S>;
}

#[async_trait]
impl SessionFactory<BrowserSession> for HttpSessionFactory {
    async fn create(&self) -> Result<BrowserSession> {
        HttpSessionFactory::create(self)
    }
}

// ---------------------------------------------------------------------------
// Limits & stats
// ---------------------------------------------------------------------------

/// Runtime pool limits.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub max_sessions: usize,
    pub max_requests_per_session: u32,
    pub max_age: Duration,
    pub max_idle: Duration,
    /// Default wait used by [`SessionPool::checkout`].
    pub acquire_timeout: Duration,
    pub checkout_ceiling: Duration,
}

impl From<&SessionPoolConfig> for PoolLimits {
    fn from(config: &SessionPoolConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            max_requests_per_session: config.max_requests_per_session,
            max_age: Duration::from_secs(config.max_age_secs),
            max_idle: Duration::from_secs(config.max_idle_secs),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            checkout_ceiling: Duration::from_secs(config.checkout_ceiling_secs),
        }
    }
}

/// Counters and gauges describing pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub recycled: u64,
    pub reclaimed: u64,
    pub hits: u64,
    pub misses: u64,
    pub adhoc: u64,
    /// Pooled sessions alive (idle, checked out, or being created).
    pub live: usize,
    pub idle: usize,
    pub checked_out: usize,
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SessionMeta {
    id: u64,
    created_at: Instant,
    last_used: Instant,
    requests: u32,
}

struct Entry<S> {
    session: S,
    meta: SessionMeta,
}

struct PoolState<S> {
    idle: VecDeque<Entry<S>>,
    /// Checkout id → hard deadline. Includes slots reserved for sessions being created.
    checked_out: HashMap<u64, Instant>,
    live: usize,
    next_id: u64,
    closed: bool,
    stats: PoolStats,
}

struct PoolInner<S> {
    limits: PoolLimits,
    factory: Arc<dyn SessionFactory<S>>,
    state: Mutex<PoolState<S>>,
    released: Notify,
}

impl<S> PoolInner<S> {
    fn lock(&self) -> Result<MutexGuard<'_, PoolState<S>>> {
        self.state
            .lock()
            .map_err(|_| DealDriverError::Storage("session pool state is poisoned".into()))
    }

    fn is_stale(&self, meta: &SessionMeta, now: Instant) -> bool {
        meta.requests >= self.limits.max_requests_per_session
            || now.saturating_duration_since(meta.created_at) >= self.limits.max_age
            || now.saturating_duration_since(meta.last_used) >= self.limits.max_idle
    }

    /// Free the slots of checkouts past their deadline.
    fn reclaim_expired(&self, state: &mut PoolState<S>, now: Instant) -> usize {
        let expired: Vec<u64> = state
            .checked_out
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            state.checked_out.remove(id);
            state.live -= 1;
            state.stats.reclaimed += 1;
            warn!(session = id, "reclaimed session held past checkout ceiling");
        }
        expired.len()
    }

    /// Return or retire a checked-out session.
    fn give_back(&self, mut entry: Entry<S>, healthy: bool) {
        let now = Instant::now();
        entry.meta.requests += 1;
        entry.meta.last_used = now;

        let dropped = {
            let Ok(mut state) = self.lock() else {
                return;
            };
            if state.checked_out.remove(&entry.meta.id).is_none() {
                // Reclaimed while out; its slot is already gone.
                debug!(session = entry.meta.id, "late return of reclaimed session");
                Some(entry)
            } else if !healthy || state.closed || self.is_stale(&entry.meta, now) {
                state.live -= 1;
                state.stats.recycled += 1;
                Some(entry)
            } else {
                state.idle.push_back(entry);
                None
            }
        };
        drop(dropped);
        self.released.notify_one();
    }
}

/// Slot held for a session that is still being created. Dropped without
/// [`disarm`](Self::disarm) (failed create, cancelled or aborted acquire),
/// it gives the slot back.
struct Reservation<'a, S> {
    pool: &'a PoolInner<S>,
    id: u64,
    armed: bool,
}

impl<S> Reservation<'_, S> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.pool.lock() {
            if state.checked_out.remove(&self.id).is_some() {
                state.live -= 1;
            }
        }
        debug!(session = self.id, "released slot of unfinished session create");
        self.pool.released.notify_one();
    }
}

// ---------------------------------------------------------------------------
// SessionPool
// ---------------------------------------------------------------------------

enum Step<S> {
    Ready(Entry<S>),
    Create(u64),
    Wait,
}

/// Shared, cloneable handle to a bounded session pool.
pub struct SessionPool<S> {
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for SessionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Send + 'static> SessionPool<S> {
    pub fn new(limits: PoolLimits, factory: Arc<dyn SessionFactory<S>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limits,
                factory,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    checked_out: HashMap::new(),
                    live: 0,
                    next_id: 0,
                    closed: false,
                    stats: PoolStats::default(),
                }),
                released: Notify::new(),
            }),
        }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.inner.limits
    }

    /// Check out a pooled session, waiting up to `timeout` at capacity.
    pub async fn acquire(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PooledSession<S>> {
        let start = Instant::now();
        let deadline = start + timeout;

        loop {
            let step = self.next_step()?;
            match step {
                Step::Ready(entry) => return Ok(PooledSession::new(self.inner.clone(), entry)),
                Step::Create(id) => return self.create_session(id, cancel).await,
                Step::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DealDriverError::ResourceExhausted {
                            resource: "session pool".into(),
                            waited: now - start,
                        });
                    }
                    let wake = deadline.min(now + RECLAIM_POLL);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DealDriverError::Cancelled),
                        _ = self.inner.released.notified() => {}
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
            }
        }
    }

    fn next_step(&self) -> Result<Step<S>> {
        let now = Instant::now();
        let mut retired = Vec::new();
        let step = {
            let mut state = self.inner.lock()?;
            if state.closed {
                return Err(DealDriverError::validation("session pool is closed"));
            }
            self.inner.reclaim_expired(&mut state, now);

            let mut ready = None;
            while let Some(entry) = state.idle.pop_front() {
                if self.inner.is_stale(&entry.meta, now) {
                    state.live -= 1;
                    state.stats.recycled += 1;
                    retired.push(entry);
                    continue;
                }
                ready = Some(entry);
                break;
            }

            let deadline = now + self.inner.limits.checkout_ceiling;
            if let Some(entry) = ready {
                state.checked_out.insert(entry.meta.id, deadline);
                state.stats.hits += 1;
                Step::Ready(entry)
            } else if state.live < self.inner.limits.max_sessions {
                let id = state.next_id;
                state.next_id += 1;
                state.live += 1;
                state.checked_out.insert(id, deadline);
                state.stats.misses += 1;
                Step::Create(id)
            } else {
                Step::Wait
            }
        };
        if !retired.is_empty() {
            debug!(count = retired.len(), "retired stale idle sessions");
        }
        drop(retired);
        Ok(step)
    }

    async fn create_session(
        &self,
        id: u64,
        cancel: &CancellationToken,
    ) -> Result<PooledSession<S>> {
        let reservation = Reservation {
            pool: &self.inner,
            id,
            armed: true,
        };
        let session = tokio::select! {
            _ = cancel.cancelled() => return Err(DealDriverError::Cancelled),
            created = self.inner.factory.create() => created?,
        };
        reservation.disarm();

        let now = Instant::now();
        if let Ok(mut state) = self.inner.lock() {
            state.stats.created += 1;
        }
        debug!(session = id, "created pooled session");
        Ok(PooledSession::new(
            self.inner.clone(),
            Entry {
                session,
                meta: SessionMeta {
                    id,
                    created_at: now,
                    last_used: now,
                    requests: 0,
                },
            },
        ))
    }

    /// Check out a session, falling back to an unpooled one when the pool
    /// stays exhausted for the configured acquire timeout.
    pub async fn checkout(&self, cancel: &CancellationToken) -> Result<SessionLease<S>> {
        match self.acquire(self.inner.limits.acquire_timeout, cancel).await {
            Ok(session) => Ok(SessionLease::Pooled(session)),
            Err(DealDriverError::ResourceExhausted { waited, .. }) => {
                warn!(?waited, "session pool exhausted, using ad-hoc session");
                if let Ok(mut state) = self.inner.lock() {
                    state.stats.adhoc += 1;
                }
                let session = self.inner.factory.create().await?;
                Ok(SessionLease::Adhoc(session))
            }
            Err(e) => Err(e),
        }
    }

    /// Free slots held past the checkout ceiling. Returns how many were reclaimed.
    pub fn reclaim_expired(&self) -> Result<usize> {
        let mut state = self.inner.lock()?;
        let reclaimed = self.inner.reclaim_expired(&mut state, Instant::now());
        drop(state);
        for _ in 0..reclaimed {
            self.inner.released.notify_one();
        }
        Ok(reclaimed)
    }

    pub fn stats(&self) -> PoolStats {
        match self.inner.lock() {
            Ok(state) => PoolStats {
                live: state.live,
                idle: state.idle.len(),
                checked_out: state.checked_out.len(),
                ..state.stats.clone()
            },
            Err(_) => PoolStats::default(),
        }
    }

    /// Refuse new checkouts and drop idle sessions. Checked-out sessions are
    /// destroyed as they come back.
    pub fn close(&self) -> Result<()> {
        let drained: Vec<Entry<S>> = {
            let mut state = self.inner.lock()?;
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live -= drained.len();
            drained
        };
        info!(closed = drained.len(), "session pool closed");
        drop(drained);
        self.inner.released.notify_waiters();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A checked-out pooled session.
///
/// Call [`release`](Self::release) after a successful use or
/// [`retire`](Self::retire) after a failure. Dropping the handle without
/// either (an abandoned or cancelled caller) retires it.
pub struct PooledSession<S> {
    pool: Arc<PoolInner<S>>,
    entry: Option<Entry<S>>,
}

impl<S> PooledSession<S> {
    fn new(pool: Arc<PoolInner<S>>, entry: Entry<S>) -> Self {
        Self {
            pool,
            entry: Some(entry),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.entry.as_ref().map(|e| e.meta.id).unwrap_or_default()
    }

    pub fn release(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.give_back(entry, true);
        }
    }

    pub fn retire(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.give_back(entry, false);
        }
    }
}

impl<S> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        match &self.entry {
            Some(entry) => &entry.session,
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl<S> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            debug!(session = entry.meta.id, "pooled session dropped without release");
            self.pool.give_back(entry, false);
        }
    }
}

/// A session obtained through [`SessionPool::checkout`].
pub enum SessionLease<S> {
    Pooled(PooledSession<S>),
    /// Created outside the pool's accounting; discarded after use.
    Adhoc(S),
}

impl<S> SessionLease<S> {
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }

    /// Hand the session back: pooled sessions are released when `healthy`
    /// and retired otherwise; ad-hoc sessions are dropped.
    pub fn finish(self, healthy: bool) {
        match self {
            Self::Pooled(session) if healthy => session.release(),
            Self::Pooled(session) => session.retire(),
            Self::Adhoc(_) => {}
        }
    }
}

impl<S> Deref for SessionLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        match self {
            Self::Pooled(session) => session,
            Self::Adhoc(session) => session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::CountingFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limits(max_sessions: usize) -> PoolLimits {
        PoolLimits {
            max_sessions,
            max_requests_per_session: 50,
            max_age: Duration::from_secs(1800),
            max_idle: Duration::from_secs(600),
            acquire_timeout: Duration::from_millis(200),
            checkout_ceiling: Duration::from_secs(300),
        }
    }

    fn pool(limits: PoolLimits) -> (SessionPool<u64>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        (SessionPool::new(limits, factory.clone()), factory)
    }

    #[tokio::test]
    async fn reuses_released_sessions() {
        let (pool, factory) = pool(limits(2));
        let cancel = CancellationToken::new();

        let first = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        let id = *first;
        first.release();
        let second = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(*second, id);
        assert_eq!(factory.created(), 1);

        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses, stats.checked_out), (1, 1, 1));
    }

    #[tokio::test]
    async fn recycles_after_request_limit() {
        let mut limits = limits(1);
        limits.max_requests_per_session = 2;
        let (pool, factory) = pool(limits);
        let cancel = CancellationToken::new();

        for _ in 0..4 {
            pool.acquire(Duration::from_secs(1), &cancel)
                .await
                .unwrap()
                .release();
        }
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.stats().recycled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire() {
        let mut limits = limits(1);
        limits.max_idle = Duration::from_secs(10);
        let (pool, factory) = pool(limits);
        let cancel = CancellationToken::new();

        pool.acquire(Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .release();
        tokio::time::advance(Duration::from_secs(11)).await;
        pool.acquire(Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .release();
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_after_timeout() {
        let (pool, _) = pool(limits(1));
        let cancel = CancellationToken::new();
        let _held = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let err = pool
            .acquire(Duration::from_millis(500), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DealDriverError::ResourceExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_falls_back_to_adhoc() {
        let (pool, factory) = pool(limits(1));
        let cancel = CancellationToken::new();
        let held = pool.checkout(&cancel).await.unwrap();
        assert!(held.is_pooled());

        let lease = pool.checkout(&cancel).await.unwrap();
        assert!(!lease.is_pooled());
        lease.finish(true);

        let stats = pool.stats();
        assert_eq!(stats.adhoc, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(factory.created(), 2);
        held.finish(true);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_released_session() {
        let (pool, _) = pool(limits(1));
        let cancel = CancellationToken::new();
        let held = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(30), &cancel).await.map(|s| *s) })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        let id = *held;
        held.release();
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn reclaims_checkouts_past_ceiling() {
        let mut limits = limits(1);
        limits.checkout_ceiling = Duration::from_secs(5);
        let (pool, _) = pool(limits);
        let cancel = CancellationToken::new();

        let stuck = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(pool.stats().reclaimed, 1);

        // The late return must not free a second slot.
        stuck.release();
        let stats = pool.stats();
        assert_eq!((stats.live, stats.checked_out, stats.idle), (1, 1, 0));
        fresh.release();
    }

    #[tokio::test]
    async fn dropped_handle_is_retired() {
        let (pool, _) = pool(limits(1));
        let cancel = CancellationToken::new();
        drop(pool.acquire(Duration::from_secs(1), &cancel).await.unwrap());

        let stats = pool.stats();
        assert_eq!((stats.live, stats.checked_out, stats.recycled), (0, 0, 1));
    }

    #[tokio::test]
    async fn failed_create_frees_slot() {
        let factory = Arc::new(CountingFactory::failing_first(1));
        let pool = SessionPool::new(limits(1), factory);
        let cancel = CancellationToken::new();

        assert!(pool.acquire(Duration::from_secs(1), &cancel).await.is_err());
        assert!(pool.acquire(Duration::from_secs(1), &cancel).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_create_frees_slot() {
        let factory = Arc::new(CountingFactory::slow(Duration::from_secs(10)));
        let pool: SessionPool<u64> = SessionPool::new(limits(1), factory);

        let acquiring = pool.clone();
        let task = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            acquiring.acquire(Duration::from_secs(1), &cancel).await.map(|s| *s)
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.stats().checked_out, 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        let stats = pool.stats();
        assert_eq!((stats.live, stats.checked_out), (0, 0));

        // The slot is usable again right away.
        let cancel = CancellationToken::new();
        let session = pool.acquire(Duration::from_millis(1), &cancel).await;
        assert!(session.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_create_frees_slot() {
        let factory = Arc::new(CountingFactory::slow(Duration::from_secs(10)));
        let pool: SessionPool<u64> = SessionPool::new(limits(1), factory.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let result = pool.acquire(Duration::from_secs(30), &cancel).await;

        assert!(matches!(result, Err(DealDriverError::Cancelled)));
        assert_eq!(factory.created(), 0);
        let stats = pool.stats();
        assert_eq!((stats.live, stats.checked_out), (0, 0));
    }

    #[tokio::test]
    async fn close_rejects_new_checkouts() {
        let (pool, _) = pool(limits(2));
        let cancel = CancellationToken::new();
        pool.acquire(Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .release();
        pool.close().unwrap();
        assert_eq!(pool.stats().live, 0);
        assert!(pool.acquire(Duration::from_secs(1), &cancel).await.is_err());
    }

    /// Simultaneous checkouts never exceed `max_sessions`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capacity_holds_under_contention() {
        let (pool, _) = pool(limits(3));
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let session = pool.acquire(Duration::from_secs(30), &cancel).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                session.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert!(stats.live <= 3);
        assert_eq!(stats.checked_out, 0);
    }
}
