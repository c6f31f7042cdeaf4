//! Batch orchestrator: domains → per-item stage graph → optional CRM import.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use dealdriver_crawler::{
    BrowserSession, HttpScraper, HttpSessionFactory, ScrapeConfig, SessionSettings,
};
use dealdriver_shared::{
    AppConfig, Artifact, DealDriverError, ExecutionMode, ImportReport, Result, Stage, WorkItem,
};
use dealdriver_storage::ArtifactStore;

use crate::dispatch::{
    Broker, Dispatcher, MemoryBroker, SpoolBroker, Submission, WorkerOptions, run_worker,
};
use crate::enrichment::ChatAnalyzer;
use crate::export::{CsvExporter, ExportTargets};
use crate::import::{CrmClient, HubSpotClient, Importer};
use crate::pool::{PoolLimits, SessionPool};
use crate::ratelimit::RateLimiter;
use crate::scheduler::{ItemOutcome, ItemStatus, RunOptions, Scheduler, StageObserver};
use crate::stages::{Collaborators, StageRunner};
use crate::workers::WorkerPool;

/// Options for one [`Pipeline::run_batch`] call.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub mode: ExecutionMode,
    /// Re-run every stage even if its artifact exists.
    pub force: bool,
    /// Run the CRM import after all items finish.
    pub import: bool,
    pub targets: ExportTargets,
    /// Distributed mode only: worker slots to run in this process next to
    /// the dispatcher. `0` relies entirely on `dealdriver worker` processes.
    pub embedded_workers: usize,
}

impl BatchOptions {
    pub fn new(mode: ExecutionMode, targets: ExportTargets) -> Self {
        Self {
            mode,
            force: false,
            import: false,
            targets,
            embedded_workers: 0,
        }
    }
}

/// Result of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub mode: ExecutionMode,
    /// One outcome per distinct input item, in input order.
    pub outcomes: Vec<ItemOutcome>,
    pub imports: Vec<ImportReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_error: Option<String>,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// How many items ran `stage` in this batch (as opposed to skipping it).
    pub fn executed(&self, stage: Stage) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.executed.contains(&stage))
            .count()
    }
}

/// Progress callback for reporting batch status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a stage starts executing for an item.
    fn stage_started(&self, item: &WorkItem, stage: Stage);
    /// Called when an item reaches its final state.
    fn item_finished(&self, outcome: &ItemOutcome, completed: usize, total: usize);
    /// Called when the batch completes.
    fn done(&self, summary: &BatchSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn stage_started(&self, _item: &WorkItem, _stage: Stage) {}
    fn item_finished(&self, _outcome: &ItemOutcome, _completed: usize, _total: usize) {}
    fn done(&self, _summary: &BatchSummary) {}
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Per-item bookkeeping for one batch.
struct PipelineRun {
    progress: Arc<dyn ProgressReporter>,
    order: HashMap<String, usize>,
    outcomes: Mutex<Vec<ItemOutcome>>,
}

impl PipelineRun {
    fn new(items: &[WorkItem], progress: Arc<dyn ProgressReporter>) -> Self {
        Self {
            progress,
            order: items
                .iter()
                .enumerate()
                .map(|(i, item)| (item.id().to_string(), i))
                .collect(),
            outcomes: Mutex::new(Vec::with_capacity(items.len())),
        }
    }

    fn record(&self, outcome: ItemOutcome) {
        let Ok(mut outcomes) = self.outcomes.lock() else {
            return;
        };
        outcomes.push(outcome);
        if let Some(last) = outcomes.last() {
            self.progress
                .item_finished(last, outcomes.len(), self.order.len());
        }
    }

    /// Recorded outcomes in input order.
    fn take_outcomes(&self) -> Vec<ItemOutcome> {
        let mut outcomes = match self.outcomes.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        outcomes.sort_by_key(|o| self.order.get(o.item.id()).copied().unwrap_or(usize::MAX));
        outcomes
    }
}

impl StageObserver for PipelineRun {
    fn stage_started(&self, item: &WorkItem, stage: Stage) {
        self.progress.stage_started(item, stage);
    }

    fn stage_finished(&self, item: &WorkItem, artifact: &Artifact, executed: bool) {
        if executed && !artifact.success {
            debug!(item = %item, stage = %artifact.stage, error = artifact.error_message(), "stage degraded");
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Execution settings that do not change between batches.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub grace_period: Duration,
    pub worker: WorkerOptions,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            workers: config.defaults.workers,
            grace_period: config.defaults.grace_period(),
            worker: WorkerOptions::from(&config.broker),
        }
    }
}

/// Everything a batch needs, built once and shared by all items.
pub struct Pipeline {
    scheduler: Scheduler,
    exporter: Arc<CsvExporter>,
    importer: Importer,
    broker: Arc<dyn Broker>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        scheduler: Scheduler,
        exporter: Arc<CsvExporter>,
        importer: Importer,
        broker: Arc<dyn Broker>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            scheduler,
            exporter,
            importer,
            broker,
            settings,
        }
    }

    /// Wire the production collaborators from `config`.
    ///
    /// Distributed mode uses the spool broker in `broker.spool_dir`; local
    /// mode never touches a broker.
    pub async fn from_config(config: &AppConfig, mode: ExecutionMode) -> Result<Self> {
        let store = ArtifactStore::open(&artifacts_dir(config)).await?;
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limits));

        let sessions: SessionPool<BrowserSession> = SessionPool::new(
            PoolLimits::from(&config.session_pool),
            Arc::new(HttpSessionFactory::new(SessionSettings::from(config))),
        );
        let exporter = Arc::new(CsvExporter::new());
        let collaborators = Collaborators {
            scraper: Arc::new(HttpScraper::new(ScrapeConfig::from(config))),
            analyzer: Arc::new(ChatAnalyzer::from_config(&config.analysis)?),
            exporter: exporter.clone(),
        };
        let runner = Arc::new(StageRunner::new(collaborators, sessions, limiter.clone()));
        let scheduler = Scheduler::new(store, runner)?;

        let crm = HubSpotClient::from_config(&config.crm)?
            .map(|client| Arc::new(client) as Arc<dyn CrmClient>);
        let importer = Importer::new(crm, limiter);

        let broker: Arc<dyn Broker> = match mode {
            ExecutionMode::Local => Arc::new(MemoryBroker::new()),
            ExecutionMode::Distributed => Arc::new(SpoolBroker::from_config(&config.broker).await?),
        };

        Ok(Self::new(
            scheduler,
            exporter,
            importer,
            broker,
            PipelineSettings::from(config),
        ))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Run every item through the stage graph, then optionally import.
    ///
    /// Item failures never fail the batch; they are reported per item.
    #[instrument(skip_all, fields(items = items.len(), mode = %opts.mode))]
    pub async fn run_batch(
        &self,
        items: Vec<WorkItem>,
        opts: &BatchOptions,
        progress: Arc<dyn ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary> {
        let start = Instant::now();
        let items = dedupe(items);
        info!(items = items.len(), mode = %opts.mode, force = opts.force, "starting batch");

        // --- Phase 1: Export files ---
        progress.phase("Preparing export files");
        self.exporter.prepare(&opts.targets).await?;

        // --- Phase 2: Items ---
        progress.phase("Enriching domains");
        let run = Arc::new(PipelineRun::new(&items, progress.clone()));
        match opts.mode {
            ExecutionMode::Local => self.run_local(items, opts, &run, cancel).await,
            ExecutionMode::Distributed => self.run_distributed(items, opts, &run, cancel).await?,
        }

        // --- Phase 3: Import ---
        let mut imports = Vec::new();
        let mut import_error = None;
        if opts.import && !cancel.is_cancelled() {
            progress.phase("Importing into CRM");
            match self.importer.run(&opts.targets, cancel).await {
                Ok(reports) => imports = reports,
                Err(e) => {
                    warn!(error = %e, "CRM import failed");
                    import_error = Some(e.to_string());
                }
            }
        }

        let summary = BatchSummary {
            mode: opts.mode,
            outcomes: run.take_outcomes(),
            imports,
            import_error,
            elapsed: start.elapsed(),
        };

        info!(
            completed = summary.count(ItemStatus::Completed),
            degraded = summary.count(ItemStatus::Degraded),
            failed = summary.count(ItemStatus::Failed),
            cancelled = summary.count(ItemStatus::Cancelled),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "batch finished"
        );
        progress.done(&summary);
        Ok(summary)
    }

    async fn run_local(
        &self,
        items: Vec<WorkItem>,
        opts: &BatchOptions,
        run: &Arc<PipelineRun>,
        cancel: &CancellationToken,
    ) {
        let observer: Arc<dyn StageObserver> = run.clone();
        let run_opts = RunOptions {
            force: opts.force,
            targets: opts.targets.clone(),
            observer: Some(observer),
        };
        let scheduler = self.scheduler.clone();
        let workers = WorkerPool::new(self.settings.workers, self.settings.grace_period);

        let mut stream = workers.submit_batch(items, cancel.clone(), move |item, cancel| {
            let scheduler = scheduler.clone();
            let opts = run_opts.clone();
            async move { scheduler.run_item(&item, &opts, &cancel).await }
        });

        while let Some(event) = stream.next().await {
            let outcome = match event.result {
                Ok(outcome) => outcome,
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(item = %event.item, error = %e, "item failed");
                    }
                    ItemOutcome::aborted(event.item, &e)
                }
            };
            run.record(outcome);
        }
    }

    async fn run_distributed(
        &self,
        items: Vec<WorkItem>,
        opts: &BatchOptions,
        run: &Arc<PipelineRun>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dispatcher = Dispatcher::new(
            self.broker.clone(),
            self.scheduler.store().clone(),
            self.settings.worker.poll_interval,
        );

        let worker_cancel = cancel.child_token();
        let embedded = (opts.embedded_workers > 0).then(|| {
            let worker_opts = WorkerOptions {
                concurrency: opts.embedded_workers,
                ..self.settings.worker.clone()
            };
            tokio::spawn(run_worker(
                self.broker.clone(),
                self.scheduler.clone(),
                worker_opts,
                worker_cancel.clone(),
            ))
        });

        let mut handles = Vec::new();
        for item in items {
            if cancel.is_cancelled() {
                run.record(ItemOutcome::aborted(item, &DealDriverError::Cancelled));
                continue;
            }
            match dispatcher.submit(&item, opts.force, &opts.targets).await {
                Ok(Submission::AlreadyComplete(item)) => {
                    run.record(ItemOutcome::already_complete(item));
                }
                Ok(Submission::Enqueued(handle)) => handles.push(handle),
                Err(e) => {
                    warn!(item = %item, error = %e, "submit failed");
                    run.record(ItemOutcome::aborted(item, &e));
                }
            }
        }
        info!(published = handles.len(), "tasks published");

        let waited = dispatcher
            .await_reports(handles, cancel, |handle, result| {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(e) => ItemOutcome::aborted(handle.item.clone(), &e),
                };
                run.record(outcome);
            })
            .await;

        worker_cancel.cancel();
        if let Some(worker) = embedded {
            match worker.await {
                Ok(Ok(summary)) => debug!(processed = summary.processed, "embedded worker stopped"),
                Ok(Err(e)) => warn!(error = %e, "embedded worker failed"),
                Err(e) => warn!(error = %e, "embedded worker panicked"),
            }
        }
        waited
    }

    /// Drop idle sessions; call once no more batches will run.
    pub fn shutdown(&self) -> Result<()> {
        self.scheduler.runner().sessions().close()
    }
}

/// `<data_dir>/artifacts`.
pub fn artifacts_dir(config: &AppConfig) -> std::path::PathBuf {
    Path::new(&config.defaults.data_dir).join("artifacts")
}

/// Keep the first occurrence of each item id.
fn dedupe(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id().to_string()))
        .collect()
}
