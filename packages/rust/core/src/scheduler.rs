//! Per-item stage scheduling.
//!
//! The scheduler walks the item waves of the [`StageGraph`]. A stage whose
//! artifact is already committed is skipped and its stored output is used
//! instead; everything else runs through the [`StageRunner`] and its
//! artifact is committed before any dependent stage starts. Stages within a
//! wave run concurrently.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use dealdriver_shared::{Artifact, DealDriverError, Result, Stage, WorkItem};
use dealdriver_storage::ArtifactStore;

use crate::export::ExportTargets;
use crate::graph::StageGraph;
use crate::stages::{StageInputs, StageRunner};

// ---------------------------------------------------------------------------
// Observers & options
// ---------------------------------------------------------------------------

/// Receives stage lifecycle events.
pub trait StageObserver: Send + Sync {
    fn stage_started(&self, _item: &WorkItem, _stage: Stage) {}

    /// `executed` is false when the stage was skipped because its artifact
    /// already existed.
    fn stage_finished(&self, _item: &WorkItem, _artifact: &Artifact, _executed: bool) {}
}

/// Per-run knobs shared by every item of a batch.
#[derive(Clone)]
pub struct RunOptions {
    /// Re-run stages even if their artifact exists.
    pub force: bool,
    pub targets: ExportTargets,
    pub observer: Option<Arc<dyn StageObserver>>,
}

impl RunOptions {
    pub fn new(targets: ExportTargets) -> Self {
        Self {
            force: false,
            targets,
            observer: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Final state of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Every per-item stage committed a successful artifact.
    Completed,
    /// Every stage committed, but some artifacts record a failure.
    Degraded,
    /// Aborted by a storage or dependency error.
    Failed,
    /// Stopped by cancellation; committed stages are kept for resume.
    Cancelled,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What happened to one item during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item: WorkItem,
    pub status: ItemStatus,
    pub executed: Vec<Stage>,
    pub skipped: Vec<Stage>,
    /// Stages whose committed artifact has `success == false`.
    pub degraded: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    fn new(item: WorkItem) -> Self {
        Self {
            item,
            status: ItemStatus::Completed,
            executed: Vec::new(),
            skipped: Vec::new(),
            degraded: Vec::new(),
            error: None,
        }
    }

    /// Outcome for an item that was not run because every stage was committed.
    pub fn already_complete(item: WorkItem) -> Self {
        Self {
            skipped: Stage::PER_ITEM.to_vec(),
            ..Self::new(item)
        }
    }

    /// Outcome for an item whose run ended with `err`.
    pub fn aborted(item: WorkItem, err: &DealDriverError) -> Self {
        let status = if err.is_cancelled() {
            ItemStatus::Cancelled
        } else {
            ItemStatus::Failed
        };
        Self {
            status,
            error: Some(err.to_string()),
            ..Self::new(item)
        }
    }

    fn record(&mut self, step: &StageStep) {
        let stage = step.artifact.stage;
        if step.executed {
            self.executed.push(stage);
        } else {
            self.skipped.push(stage);
        }
        if !step.artifact.success {
            self.degraded.push(stage);
            self.status = ItemStatus::Degraded;
        }
    }
}

struct StageStep {
    artifact: Artifact,
    executed: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct SchedulerInner {
    store: ArtifactStore,
    graph: StageGraph,
    runner: Arc<StageRunner>,
}

/// Runs the stage graph for individual work items.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler over the built-in stage graph.
    pub fn new(store: ArtifactStore, runner: Arc<StageRunner>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                store,
                graph: StageGraph::pipeline()?,
                runner,
            }),
        })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn runner(&self) -> &Arc<StageRunner> {
        &self.inner.runner
    }

    /// Run every per-item stage for `item`, skipping committed ones.
    ///
    /// Returns `Err` only for cancellation and item-fatal errors; collaborator
    /// failures show up as degraded stages in the outcome.
    #[instrument(skip_all, fields(item = %item))]
    pub async fn run_item(
        &self,
        item: &WorkItem,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        let mut outcome = ItemOutcome::new(item.clone());

        for wave in self.inner.graph.item_waves() {
            if cancel.is_cancelled() {
                return Err(DealDriverError::Cancelled);
            }

            let mut set = JoinSet::new();
            for stage in wave {
                let this = self.clone();
                let item = item.clone();
                let opts = opts.clone();
                let cancel = cancel.clone();
                set.spawn(async move { this.step(&item, stage, &opts, &cancel).await });
            }

            let mut first_error = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(step)) => outcome.record(&step),
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        first_error.get_or_insert(DealDriverError::Storage(format!(
                            "stage task for {item} did not finish: {e}"
                        )));
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        info!(
            status = outcome.status.as_str(),
            executed = outcome.executed.len(),
            skipped = outcome.skipped.len(),
            "item finished"
        );
        Ok(outcome)
    }

    /// Run a single stage against already-committed upstream artifacts.
    ///
    /// Returns the artifact now committed for the stage (the existing one if
    /// the stage was skipped).
    pub async fn run_stage(
        &self,
        item: &WorkItem,
        stage: Stage,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        if !stage.is_per_item() {
            return Err(DealDriverError::validation(format!(
                "{stage} is not a per-item stage"
            )));
        }
        self.step(item, stage, opts, cancel)
            .await
            .map(|step| step.artifact)
    }

    async fn step(
        &self,
        item: &WorkItem,
        stage: Stage,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<StageStep> {
        if !opts.force {
            if let Some(artifact) = self.inner.store.read(item, stage).await? {
                debug!(item = %item, stage = %stage, "artifact exists, skipping stage");
                if let Some(observer) = &opts.observer {
                    observer.stage_finished(item, &artifact, false);
                }
                return Ok(StageStep {
                    artifact,
                    executed: false,
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(DealDriverError::Cancelled);
        }

        let inputs = self.inputs(item, stage).await?;
        if let Some(observer) = &opts.observer {
            observer.stage_started(item, stage);
        }

        let artifact = self.execute_guarded(item, stage, inputs, opts, cancel).await?;
        self.inner.store.write(&artifact).await?;

        if let Some(observer) = &opts.observer {
            observer.stage_finished(item, &artifact, true);
        }
        Ok(StageStep {
            artifact,
            executed: true,
        })
    }

    async fn inputs(&self, item: &WorkItem, stage: Stage) -> Result<StageInputs> {
        let mut inputs = StageInputs::new();
        for &upstream in self.inner.graph.dependencies(stage) {
            let artifact = self.inner.store.read(item, upstream).await?.ok_or_else(|| {
                DealDriverError::DependencyMissing {
                    item: item.id().to_string(),
                    stage: stage.to_string(),
                    upstream: upstream.to_string(),
                }
            })?;
            inputs.insert(upstream, artifact);
        }
        Ok(inputs)
    }

    /// Execute on a separate task so a panicking collaborator still yields
    /// a failure artifact.
    async fn execute_guarded(
        &self,
        item: &WorkItem,
        stage: Stage,
        inputs: StageInputs,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let runner = self.inner.runner.clone();
        let task_item = item.clone();
        let targets = opts.targets.clone();
        let task_cancel = cancel.clone();

        let mut task = JoinSet::new();
        task.spawn(async move {
            runner
                .execute(stage, &task_item, &inputs, &targets, &task_cancel)
                .await
        });

        match task.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) if e.is_panic() => {
                error!(item = %item, stage = %stage, "stage panicked");
                Artifact::failed(
                    item,
                    stage,
                    &serde_json::Value::Null,
                    format!("{stage} failed: stage panicked"),
                )
            }
            Some(Err(_)) | None => Err(DealDriverError::Cancelled),
        }
    }
}
