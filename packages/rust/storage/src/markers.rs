//! Import markers: the report of a CRM import, stored next to the CSV it covers.

use std::path::{Path, PathBuf};

use dealdriver_shared::{DealDriverError, ImportReport, Result};

use crate::write_atomic;

/// `<dir>/.imported_<stem>.json` for `<dir>/<stem>.csv`.
pub fn marker_path(csv_path: &Path) -> PathBuf {
    let stem = csv_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    csv_path.with_file_name(format!(".imported_{stem}.json"))
}

pub async fn read_marker(csv_path: &Path) -> Result<Option<ImportReport>> {
    let path = marker_path(csv_path);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            DealDriverError::Storage(format!("corrupt import marker {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DealDriverError::io(&path, e)),
    }
}

pub async fn write_marker(csv_path: &Path, report: &ImportReport) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(report).map_err(|e| DealDriverError::Storage(e.to_string()))?;
    write_atomic(&marker_path(csv_path), &json).await
}
