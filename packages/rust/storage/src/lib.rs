//! Filesystem artifact store.
//!
//! The [`ArtifactStore`] keeps one JSON file per (work item, stage) under
//! `<root>/<stage>/<item>.json`. The existence of that file is the only
//! signal the scheduler uses to skip a stage, so every write goes through
//! [`write_atomic`]: readers see either the previous file or the complete
//! new one, never a partial write.
//!
//! **Access rules:**
//! - Pipeline runs and workers: read-write via [`ArtifactStore::open`]
//! - `dealdriver status`: read-only via [`ArtifactStore::open_readonly`]

mod markers;

use std::path::{Path, PathBuf};

use dealdriver_shared::{Artifact, DealDriverError, Result, Stage, WorkItem};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use markers::{marker_path, read_marker, write_marker};

/// Primary storage handle for stage artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    readonly: bool,
}

impl ArtifactStore {
    /// Open or create an artifact store at `root` in read-write mode.
    pub async fn open(root: &Path) -> Result<Self> {
        for stage in Stage::PER_ITEM {
            let dir = root.join(stage.as_str());
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| DealDriverError::io(&dir, e))?;
        }
        tracing::debug!(root = %root.display(), "opened artifact store");
        Ok(Self {
            root: root.to_path_buf(),
            readonly: false,
        })
    }

    /// Open an existing store without creating anything.
    pub fn open_readonly(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            readonly: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the artifact file for `item` at `stage`.
    pub fn artifact_path(&self, item: &WorkItem, stage: Stage) -> PathBuf {
        self.root
            .join(stage.as_str())
            .join(format!("{}.json", item.file_stem()))
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DealDriverError::Storage(
                "artifact store is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Artifact operations
    // -----------------------------------------------------------------------

    /// Whether any artifact (success or failure) exists for `item` at `stage`.
    pub async fn has(&self, item: &WorkItem, stage: Stage) -> Result<bool> {
        let path = self.artifact_path(item, stage);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| DealDriverError::io(&path, e))
    }

    /// Read the artifact, or `None` if the stage has not committed one.
    pub async fn read(&self, item: &WorkItem, stage: Stage) -> Result<Option<Artifact>> {
        let path = self.artifact_path(item, stage);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DealDriverError::io(&path, e)),
        };

        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            DealDriverError::Storage(format!("corrupt artifact {}: {e}", path.display()))
        })
    }

    /// Commit an artifact, replacing any previous one for the same key.
    pub async fn write(&self, artifact: &Artifact) -> Result<()> {
        self.check_writable()?;
        if !artifact.stage.is_per_item() {
            return Err(DealDriverError::Storage(format!(
                "{} has no per-item artifact",
                artifact.stage
            )));
        }

        let item = WorkItem {
            raw: artifact.item_id.clone(),
            domain: artifact.item_id.clone(),
        };
        let path = self.artifact_path(&item, artifact.stage);
        let json = serde_json::to_vec_pretty(artifact)
            .map_err(|e| DealDriverError::Storage(e.to_string()))?;

        write_atomic(&path, &json).await?;
        tracing::debug!(
            item = %artifact.item_id,
            stage = %artifact.stage,
            success = artifact.success,
            "committed artifact"
        );
        Ok(())
    }

    /// Whether every stage in `stages` has an artifact for `item`.
    pub async fn is_complete(&self, item: &WorkItem, stages: &[Stage]) -> Result<bool> {
        for &stage in stages {
            if !self.has(item, stage).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Item stems that have an artifact at `stage`, sorted.
    pub async fn list(&self, stage: Stage) -> Result<Vec<String>> {
        let dir = self.root.join(stage.as_str());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DealDriverError::io(&dir, e)),
        };

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DealDriverError::io(&dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if !stem.starts_with('.') {
                    items.push(stem.to_string());
                }
            }
        }
        items.sort();
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Atomic commit
// ---------------------------------------------------------------------------

/// Write `bytes` to `path` via a uniquely named sibling temp file, fsync and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| DealDriverError::Storage(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| storage_io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| storage_io(&tmp, e))?;
        file.write_all(bytes).await.map_err(|e| storage_io(&tmp, e))?;
        file.sync_all().await.map_err(|e| storage_io(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_io(path, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

fn storage_io(path: &Path, e: std::io::Error) -> DealDriverError {
    DealDriverError::Storage(format!("{}: {e}", path.display()))
}
