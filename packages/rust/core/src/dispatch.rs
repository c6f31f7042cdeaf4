//! Broker-backed distributed execution.
//!
//! Brokers know nothing about stage dependencies, so every work item is
//! published as one composite [`PipelineTask`]. A worker claims it and runs
//! the whole per-item graph through the local [`Scheduler`], which still
//! skips whatever stages are already committed in the shared artifact store.
//!
//! Two brokers ship with the crate:
//! - [`MemoryBroker`]: in-process queue, for single-host runs and tests
//! - [`SpoolBroker`]: a shared directory (`pending/`, `claimed/`,
//!   `results/`) where claiming is an atomic rename, so independent
//!   `dealdriver worker` processes can pull from it

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use dealdriver_shared::{BrokerConfig, DealDriverError, Result, Stage, WorkItem};
use dealdriver_storage::{ArtifactStore, write_atomic};

use crate::export::ExportTargets;
use crate::scheduler::{ItemOutcome, ItemStatus, RunOptions, Scheduler};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One work item's full pipeline, as published to a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTask {
    pub task_id: Uuid,
    pub item: WorkItem,
    #[serde(default)]
    pub force: bool,
    pub targets: ExportTargets,
    pub submitted_at: DateTime<Utc>,
}

impl PipelineTask {
    pub fn new(item: WorkItem, force: bool, targets: ExportTargets) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            item,
            force,
            targets,
            submitted_at: Utc::now(),
        }
    }
}

/// Result of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub outcome: ItemOutcome,
    pub worker: String,
    pub finished_at: DateTime<Utc>,
}

/// Message broker contract.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, task: &PipelineTask) -> Result<()>;

    /// Take the oldest pending task, waiting up to `wait` for one to appear.
    async fn claim(&self, wait: Duration, cancel: &CancellationToken)
    -> Result<Option<PipelineTask>>;

    /// Record the result of a claimed task.
    async fn complete(&self, report: &TaskReport) -> Result<()>;

    async fn report(&self, task_id: Uuid) -> Result<Option<TaskReport>>;

    /// Drop a report the submitter has consumed.
    async fn acknowledge(&self, task_id: Uuid) -> Result<()>;

    /// Drop a task that has not been claimed yet. Returns whether it was pending.
    async fn revoke(&self, task_id: Uuid) -> Result<bool>;

    /// Return claims older than `lease` to the queue. Returns how many moved.
    async fn requeue_expired(&self, lease: Duration) -> Result<usize>;
}

fn worker_name() -> String {
    format!("pid-{}", std::process::id())
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<PipelineTask>,
    claimed: HashMap<Uuid, (PipelineTask, DateTime<Utc>)>,
    results: HashMap<Uuid, TaskReport>,
}

/// In-process broker.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    published: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| DealDriverError::Broker("memory broker state is poisoned".into()))
    }

    pub fn pending(&self) -> usize {
        self.lock().map(|state| state.pending.len()).unwrap_or_default()
    }

    /// Reports not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.lock().map(|state| state.results.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, task: &PipelineTask) -> Result<()> {
        self.lock()?.pending.push_back(task.clone());
        self.published.notify_one();
        Ok(())
    }

    async fn claim(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PipelineTask>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = self.lock()?;
                if let Some(task) = state.pending.pop_front() {
                    state
                        .claimed
                        .insert(task.task_id, (task.clone(), Utc::now()));
                    return Ok(Some(task));
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(DealDriverError::Cancelled),
                _ = self.published.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn complete(&self, report: &TaskReport) -> Result<()> {
        let mut state = self.lock()?;
        state.claimed.remove(&report.task_id);
        state.results.insert(report.task_id, report.clone());
        Ok(())
    }

    async fn report(&self, task_id: Uuid) -> Result<Option<TaskReport>> {
        Ok(self.lock()?.results.get(&task_id).cloned())
    }

    async fn acknowledge(&self, task_id: Uuid) -> Result<()> {
        self.lock()?.results.remove(&task_id);
        Ok(())
    }

    async fn revoke(&self, task_id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        let before = state.pending.len();
        state.pending.retain(|task| task.task_id != task_id);
        Ok(state.pending.len() < before)
    }

    async fn requeue_expired(&self, lease: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let expired: Vec<Uuid> = state
            .claimed
            .iter()
            .filter(|(_, (_, claimed_at))| is_expired(*claimed_at, lease, now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some((task, _)) = state.claimed.remove(id) {
                state.pending.push_back(task);
            }
        }
        drop(state);
        for _ in &expired {
            self.published.notify_one();
        }
        Ok(expired.len())
    }
}

/// Set the file's mtime to now.
async fn touch(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .append(true)
            .open(&path)?
            .set_modified(std::time::SystemTime::now())
    })
    .await
    .map_err(std::io::Error::other)?
}

fn is_expired(claimed_at: DateTime<Utc>, lease: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| claimed_at.checked_add_signed(lease))
        .is_some_and(|deadline| deadline <= now)
}

// ---------------------------------------------------------------------------
// SpoolBroker
// ---------------------------------------------------------------------------

/// A task file on the spool. `claimed_at` is set once a worker owns it.
#[derive(Debug, Serialize, Deserialize)]
struct SpoolEntry {
    #[serde(flatten)]
    task: PipelineTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker: Option<String>,
}

/// Directory-backed broker shared by several processes.
#[derive(Debug, Clone)]
pub struct SpoolBroker {
    root: PathBuf,
    poll_interval: Duration,
}

impl SpoolBroker {
    const PENDING: &'static str = "pending";
    const CLAIMED: &'static str = "claimed";
    const RESULTS: &'static str = "results";

    pub async fn open(root: &Path, poll_interval: Duration) -> Result<Self> {
        for dir in [Self::PENDING, Self::CLAIMED, Self::RESULTS] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| DealDriverError::io(&path, e))?;
        }
        debug!(root = %root.display(), "opened spool broker");
        Ok(Self {
            root: root.to_path_buf(),
            poll_interval,
        })
    }

    pub async fn from_config(config: &BrokerConfig) -> Result<Self> {
        Self::open(Path::new(&config.spool_dir), config.poll_interval()).await
    }

    fn path(&self, dir: &str, task_id: Uuid) -> PathBuf {
        self.root.join(dir).join(format!("{task_id}.json"))
    }

    /// Task ids in `dir`, oldest first (v7 ids sort by creation time).
    async fn list(&self, dir: &str) -> Result<Vec<Uuid>> {
        let path = self.root.join(dir);
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| DealDriverError::io(&path, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DealDriverError::io(&path, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn read_entry(path: &Path) -> Result<Option<SpoolEntry>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                DealDriverError::Broker(format!("corrupt spool entry {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DealDriverError::io(path, e)),
        }
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(value).map_err(|e| DealDriverError::Broker(e.to_string()))?;
        write_atomic(path, &json).await
    }

    /// Try to move one pending task into `claimed/`.
    async fn try_claim(&self) -> Result<Option<PipelineTask>> {
        for id in self.list(Self::PENDING).await? {
            let from = self.path(Self::PENDING, id);
            let to = self.path(Self::CLAIMED, id);
            // The rename keeps mtime; refresh it so an unstamped claim ages
            // from now rather than from publish time.
            match touch(&from).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DealDriverError::io(&from, e)),
            }
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {}
                // Another worker won the race.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DealDriverError::io(&from, e)),
            }

            let Some(mut entry) = Self::read_entry(&to).await? else {
                continue;
            };
            entry.claimed_at = Some(Utc::now());
            entry.worker = Some(worker_name());
            Self::write_json(&to, &entry).await?;
            return Ok(Some(entry.task));
        }
        Ok(None)
    }
}

#[async_trait]
impl Broker for SpoolBroker {
    async fn publish(&self, task: &PipelineTask) -> Result<()> {
        let entry = SpoolEntry {
            task: task.clone(),
            claimed_at: None,
            worker: None,
        };
        Self::write_json(&self.path(Self::PENDING, task.task_id), &entry).await
    }

    async fn claim(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PipelineTask>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(task) = self.try_claim().await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = deadline.min(now + self.poll_interval);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DealDriverError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn complete(&self, report: &TaskReport) -> Result<()> {
        Self::write_json(&self.path(Self::RESULTS, report.task_id), report).await?;
        let claimed = self.path(Self::CLAIMED, report.task_id);
        match tokio::fs::remove_file(&claimed).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DealDriverError::io(&claimed, e)),
        }
    }

    async fn report(&self, task_id: Uuid) -> Result<Option<TaskReport>> {
        let path = self.path(Self::RESULTS, task_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                DealDriverError::Broker(format!("corrupt task report {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DealDriverError::io(&path, e)),
        }
    }

    async fn acknowledge(&self, task_id: Uuid) -> Result<()> {
        let path = self.path(Self::RESULTS, task_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DealDriverError::io(&path, e)),
        }
    }

    async fn revoke(&self, task_id: Uuid) -> Result<bool> {
        let path = self.path(Self::PENDING, task_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DealDriverError::io(&path, e)),
        }
    }

    async fn requeue_expired(&self, lease: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut moved = 0;
        for id in self.list(Self::CLAIMED).await? {
            let path = self.path(Self::CLAIMED, id);
            let Some(entry) = Self::read_entry(&path).await? else {
                continue;
            };
            // Unstamped: the claimer died between rename and stamp.
            let claimed_at = match entry.claimed_at {
                Some(at) => at,
                None => match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                    Ok(modified) => DateTime::<Utc>::from(modified),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(DealDriverError::io(&path, e)),
                },
            };
            if !is_expired(claimed_at, lease, now) {
                continue;
            }
            match tokio::fs::rename(&path, self.path(Self::PENDING, id)).await {
                Ok(()) => {
                    warn!(task = %id, worker = ?entry.worker, "claim expired, task re-queued");
                    moved += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DealDriverError::io(&path, e)),
            }
        }
        Ok(moved)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// A published task the submitter is waiting on.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub item: WorkItem,
}

/// What [`Dispatcher::submit`] did with an item.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Every per-item artifact already exists; nothing was published.
    AlreadyComplete(WorkItem),
    Enqueued(TaskHandle),
}

/// Submits work items to a broker and collects their reports.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    store: ArtifactStore,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, store: ArtifactStore, poll_interval: Duration) -> Self {
        Self {
            broker,
            store,
            poll_interval,
        }
    }

    /// Publish `item` unless its pipeline already finished (or `force`).
    pub async fn submit(
        &self,
        item: &WorkItem,
        force: bool,
        targets: &ExportTargets,
    ) -> Result<Submission> {
        if !force && self.store.is_complete(item, &Stage::PER_ITEM).await? {
            debug!(item = %item, "all stages committed, not publishing");
            return Ok(Submission::AlreadyComplete(item.clone()));
        }
        let task = PipelineTask::new(item.clone(), force, targets.clone());
        self.broker.publish(&task).await?;
        debug!(item = %item, task = %task.task_id, "task published");
        Ok(Submission::Enqueued(TaskHandle {
            task_id: task.task_id,
            item: item.clone(),
        }))
    }

    /// Wait for every handle's report, calling `on_done` as each arrives.
    ///
    /// On cancellation, still-pending tasks are revoked and every handle
    /// without a report is reported as cancelled.
    pub async fn await_reports<F>(
        &self,
        handles: Vec<TaskHandle>,
        cancel: &CancellationToken,
        mut on_done: F,
    ) -> Result<()>
    where
        F: FnMut(&TaskHandle, Result<ItemOutcome>) + Send,
    {
        let mut waiting = handles;
        while !waiting.is_empty() {
            let mut still_waiting = Vec::with_capacity(waiting.len());
            for handle in waiting {
                match self.broker.report(handle.task_id).await? {
                    Some(report) => {
                        on_done(&handle, Ok(report.outcome));
                        self.broker.acknowledge(handle.task_id).await?;
                    }
                    None => still_waiting.push(handle),
                }
            }
            waiting = still_waiting;
            if waiting.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    for handle in &waiting {
                        let revoked = self.broker.revoke(handle.task_id).await?;
                        debug!(item = %handle.item, revoked, "abandoning task");
                        on_done(handle, Err(DealDriverError::Cancelled));
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl From<&BrokerConfig> for WorkerOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            lease: config.lease(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Totals for one worker session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// Claim and run tasks until `cancel` fires.
///
/// Tasks interrupted by cancellation are left claimed; they return to the
/// queue once their lease expires.
#[instrument(skip_all, fields(concurrency = opts.concurrency))]
pub async fn run_worker(
    broker: Arc<dyn Broker>,
    scheduler: Scheduler,
    opts: WorkerOptions,
    cancel: CancellationToken,
) -> Result<WorkerSummary> {
    let slots = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut running: JoinSet<Option<ItemStatus>> = JoinSet::new();
    let mut summary = WorkerSummary::default();
    info!("worker started");

    loop {
        while let Some(joined) = running.try_join_next() {
            tally(&mut summary, joined);
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = slots.clone().acquire_owned() => permit
                .map_err(|_| DealDriverError::Broker("worker slots closed".into()))?,
        };

        match broker.requeue_expired(opts.lease).await {
            Ok(0) => {}
            Ok(n) => info!(requeued = n, "re-queued expired claims"),
            Err(e) => warn!(error = %e, "requeue failed"),
        }

        let task = match broker.claim(opts.poll_interval, &cancel).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(DealDriverError::Cancelled) => break,
            Err(e) => {
                warn!(error = %e, "claim failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(opts.poll_interval) => continue,
                }
            }
        };

        let broker = broker.clone();
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        running.spawn(async move {
            let _permit = permit;
            run_task(broker.as_ref(), &scheduler, task, &cancel).await
        });
    }

    while let Some(joined) = running.join_next().await {
        tally(&mut summary, joined);
    }
    info!(
        processed = summary.processed,
        degraded = summary.degraded,
        failed = summary.failed,
        "worker stopped"
    );
    Ok(summary)
}

async fn run_task(
    broker: &dyn Broker,
    scheduler: &Scheduler,
    task: PipelineTask,
    cancel: &CancellationToken,
) -> Option<ItemStatus> {
    let opts = RunOptions {
        force: task.force,
        ..RunOptions::new(task.targets.clone())
    };
    let outcome = match scheduler.run_item(&task.item, &opts, cancel).await {
        Ok(outcome) => outcome,
        Err(e) => ItemOutcome::aborted(task.item.clone(), &e),
    };
    if outcome.status == ItemStatus::Cancelled {
        debug!(item = %task.item, task = %task.task_id, "task interrupted, leaving claim");
        return None;
    }

    let status = outcome.status;
    let report = TaskReport {
        task_id: task.task_id,
        outcome,
        worker: worker_name(),
        finished_at: Utc::now(),
    };
    if let Err(e) = broker.complete(&report).await {
        warn!(task = %task.task_id, error = %e, "could not record task result");
    }
    Some(status)
}

fn tally(
    summary: &mut WorkerSummary,
    joined: std::result::Result<Option<ItemStatus>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Some(status)) => {
            summary.processed += 1;
            match status {
                ItemStatus::Degraded => summary.degraded += 1,
                ItemStatus::Failed => summary.failed += 1,
                _ => {}
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "worker task panicked");
            summary.failed += 1;
        }
    }
}
