//! CSV export for the Export stages.
//!
//! All items of a batch append to the same two files. Each append is
//! serialized into memory first and written with a single call under a
//! per-file lock, so rows from concurrent items never interleave.
//!
//! Rows are keyed (companies by domain, leads by company domain). A row whose
//! key is already in the file is dropped, so an item re-exported after a
//! crash between append and artifact commit does not duplicate itself.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;
use serde::{Deserialize, Serialize};

use dealdriver_shared::{CompanyEnrichment, DealDriverError, Lead, LeadsEnrichment, Result};

pub const COMPANY_HEADERS: &[&str] = &[
    "domain",
    "enriched_at",
    "success",
    "error",
    "scraped_url",
    "emails_found",
    "business_type",
    "naics_code",
    "target_market",
    "products_services",
    "value_propositions",
    "competitive_advantages",
    "technologies",
    "certifications",
    "pain_points",
    "confidence_score",
];

pub const LEAD_HEADERS: &[&str] = &[
    "email",
    "first_name",
    "last_name",
    "company_domain",
    "enriched_at",
    "error",
    "buyer_persona",
    "lead_score_adjustment",
];

/// Destination files for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTargets {
    pub companies: PathBuf,
    pub leads: PathBuf,
}

impl ExportTargets {
    /// `companies.csv` and `leads.csv` inside `output_dir`.
    pub fn in_dir(output_dir: &Path) -> Self {
        Self {
            companies: output_dir.join("companies.csv"),
            leads: output_dir.join("leads.csv"),
        }
    }
}

/// Column holding the dedup key in each file.
const COMPANY_KEY: usize = 0;
const LEAD_KEY: usize = 3;

/// Keys already in a file, valid while the file is `len` bytes long.
#[derive(Debug)]
struct KnownKeys {
    keys: HashSet<String>,
    len: u64,
}

type FileSlot = Arc<tokio::sync::Mutex<Option<KnownKeys>>>;

/// Appends rows to CSV files, one writer at a time per file.
#[derive(Debug, Default)]
pub struct CsvExporter {
    files: Mutex<HashMap<PathBuf, FileSlot>>,
}

impl CsvExporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_for(&self, path: &Path) -> Result<FileSlot> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| DealDriverError::Storage("export lock table is poisoned".into()))?;
        Ok(files.entry(path.to_path_buf()).or_default().clone())
    }

    /// Create both files with headers if they do not exist yet.
    pub async fn prepare(&self, targets: &ExportTargets) -> Result<()> {
        self.append(&targets.companies, COMPANY_HEADERS, COMPANY_KEY, Vec::new())
            .await?;
        self.append(&targets.leads, LEAD_HEADERS, LEAD_KEY, Vec::new())
            .await?;
        Ok(())
    }

    /// Append `rows`, writing `headers` first when the file is new or empty.
    ///
    /// Rows whose `key_column` value already appears in the file are
    /// skipped. Returns how many rows were written.
    pub async fn append(
        &self,
        path: &Path,
        headers: &[&str],
        key_column: usize,
        rows: Vec<Vec<String>>,
    ) -> Result<usize> {
        let slot = self.slot_for(path)?;
        let mut known = slot.lock().await;

        let len = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(DealDriverError::io(path, e)),
        };
        // Another process may have appended since we last looked.
        let stale = known.as_ref().is_none_or(|k| k.len != len);
        if stale {
            *known = Some(KnownKeys {
                keys: read_keys(path, key_column, len).await?,
                len,
            });
        }
        let Some(known) = known.as_mut() else {
            return Ok(0);
        };

        // Empty keys (a lead without an e-mail) are never deduplicated.
        let before = rows.len();
        let mut batch = HashSet::new();
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .filter(|row| match row.get(key_column) {
                Some(key) if !key.is_empty() => {
                    !known.keys.contains(key) && batch.insert(key.clone())
                }
                _ => true,
            })
            .collect();
        if rows.len() < before {
            debug!(
                file = %path.display(),
                skipped = before - rows.len(),
                "rows already exported"
            );
        }

        let needs_header = len == 0;
        if !needs_header && rows.is_empty() {
            return Ok(0);
        }

        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        if needs_header {
            writer.write_record(headers).map_err(csv_error)?;
        }
        for row in &rows {
            writer.write_record(row).map_err(csv_error)?;
        }
        let buffer = writer
            .into_inner()
            .map_err(|e| DealDriverError::Storage(format!("csv buffer: {e}")))?;

        let written = buffer.len() as u64;
        let path_owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(dir) = path_owned.parent() {
                std::fs::create_dir_all(dir).map_err(|e| DealDriverError::io(dir, e))?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path_owned)
                .map_err(|e| DealDriverError::io(&path_owned, e))?;
            file.write_all(&buffer)
                .and_then(|_| file.flush())
                .map_err(|e| DealDriverError::io(&path_owned, e))
        })
        .await
        .map_err(|e| DealDriverError::Storage(format!("export task failed: {e}")))??;

        known.len = len + written;
        known.keys.extend(batch);
        Ok(rows.len())
    }

    pub async fn append_company(
        &self,
        path: &Path,
        enrichment: &CompanyEnrichment,
        error: Option<&str>,
    ) -> Result<usize> {
        self.append(
            path,
            COMPANY_HEADERS,
            COMPANY_KEY,
            vec![company_row(enrichment, error)],
        )
        .await
    }

    pub async fn append_leads(
        &self,
        path: &Path,
        enrichment: &LeadsEnrichment,
        error: Option<&str>,
    ) -> Result<usize> {
        self.append(path, LEAD_HEADERS, LEAD_KEY, lead_rows(enrichment, error))
            .await
    }
}

/// Values of `key_column` in the data rows of `path`.
async fn read_keys(path: &Path, key_column: usize, len: u64) -> Result<HashSet<String>> {
    if len == 0 {
        return Ok(HashSet::new());
    }
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<HashSet<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .map_err(csv_error)?;
        let mut keys = HashSet::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            if let Some(key) = record.get(key_column).filter(|k| !k.is_empty()) {
                keys.insert(key.to_string());
            }
        }
        Ok(keys)
    })
    .await
    .map_err(|e| DealDriverError::Storage(format!("export task failed: {e}")))?
}

fn csv_error(e: csv::Error) -> DealDriverError {
    DealDriverError::Storage(format!("csv encode: {e}"))
}

/// One company row; `error` is the upstream failure, if any.
pub fn company_row(enrichment: &CompanyEnrichment, error: Option<&str>) -> Vec<String> {
    let analysis = enrichment.analysis.clone().unwrap_or_default();
    vec![
        enrichment.domain.clone(),
        Utc::now().to_rfc3339(),
        error.is_none().to_string(),
        error.unwrap_or_default().to_string(),
        enrichment.scraped_url.clone(),
        enrichment.emails_found.join(";"),
        analysis.business_type_description,
        analysis.naics_code,
        analysis.target_market,
        analysis.primary_products_services.join(";"),
        analysis.value_propositions.join(";"),
        analysis.competitive_advantages.join(";"),
        analysis.technologies_used.join(";"),
        analysis.certifications_awards.join(";"),
        analysis.pain_points_addressed.join(";"),
        if enrichment.analysis.is_some() {
            format!("{:.2}", analysis.confidence_score)
        } else {
            String::new()
        },
    ]
}

/// Lead rows. A failed enrichment still yields one row carrying the error.
pub fn lead_rows(enrichment: &LeadsEnrichment, error: Option<&str>) -> Vec<Vec<String>> {
    if let Some(error) = error {
        return vec![lead_row(
            &Lead::default(),
            &enrichment.domain,
            Some(error),
        )];
    }
    enrichment
        .leads
        .iter()
        .map(|lead| lead_row(lead, &enrichment.domain, lead.error.as_deref()))
        .collect()
}

fn lead_row(lead: &Lead, domain: &str, error: Option<&str>) -> Vec<String> {
    let analysis = lead.analysis.clone().unwrap_or_default();
    vec![
        lead.email.clone(),
        lead.first_name.clone(),
        lead.last_name.clone(),
        domain.to_string(),
        Utc::now().to_rfc3339(),
        error.unwrap_or_default().to_string(),
        analysis.buyer_persona,
        if lead.analysis.is_some() {
            analysis.lead_score_adjustment.to_string()
        } else {
            String::new()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealdriver_shared::{CompanyAnalysis, LeadAnalysis};

    fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader.records().map(|r| r.unwrap()).collect()
    }

    #[tokio::test]
    async fn header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let targets = ExportTargets::in_dir(dir.path());
        let exporter = CsvExporter::new();
        exporter.prepare(&targets).await.unwrap();
        exporter.prepare(&targets).await.unwrap();

        let enrichment = CompanyEnrichment {
            domain: "acme.com".into(),
            scraped_url: "https://acme.com/".into(),
            emails_found: vec!["a@acme.com".into(), "b@acme.com".into()],
            analysis: Some(CompanyAnalysis {
                naics_code: "332".into(),
                value_propositions: vec!["Durable, forged".into(), "Fast".into()],
                confidence_score: 0.8,
                ..Default::default()
            }),
        };
        exporter
            .append_company(&targets.companies, &enrichment, None)
            .await
            .unwrap();

        let text = std::fs::read_to_string(&targets.companies).unwrap();
        assert_eq!(text.matches("domain,enriched_at").count(), 1);

        let rows = read_rows(&targets.companies);
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "acme.com");
        assert_eq!(&rows[0][2], "true");
        assert_eq!(&rows[0][5], "a@acme.com;b@acme.com");
        assert_eq!(&rows[0][10], "Durable, forged;Fast");
        assert_eq!(&rows[0][15], "0.80");
    }

    #[tokio::test]
    async fn failed_company_row_carries_error() {
        let dir = tempfile::tempdir().unwrap();
        let targets = ExportTargets::in_dir(dir.path());
        let exporter = CsvExporter::new();
        exporter
            .append_company(
                &targets.companies,
                &CompanyEnrichment::empty("acme.com"),
                Some("scrape failed: timeout"),
            )
            .await
            .unwrap();

        let rows = read_rows(&targets.companies);
        assert_eq!(&rows[0][2], "false");
        assert_eq!(&rows[0][3], "scrape failed: timeout");
    }

    #[tokio::test]
    async fn lead_rows_and_error_placeholder() {
        let enrichment = LeadsEnrichment {
            domain: "acme.com".into(),
            leads: vec![
                Lead {
                    email: "jane.doe@acme.com".into(),
                    first_name: "Jane".into(),
                    last_name: "Doe".into(),
                    analysis: Some(LeadAnalysis {
                        buyer_persona: "End User".into(),
                        lead_score_adjustment: -2,
                        ..Default::default()
                    }),
                    error: None,
                },
                Lead {
                    email: "info@acme.com".into(),
                    first_name: "Info".into(),
                    error: Some("rate limit timeout".into()),
                    ..Default::default()
                },
            ],
        };
        let rows = lead_rows(&enrichment, None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][7], "-2");
        assert_eq!(rows[1][5], "rate limit timeout");

        let failed = lead_rows(&LeadsEnrichment::empty("acme.com"), Some("scrape failed"));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0][3], "acme.com");
        assert_eq!(failed[0][5], "scrape failed");

        assert!(lead_rows(&LeadsEnrichment::empty("acme.com"), None).is_empty());
    }

    #[tokio::test]
    async fn reexport_skips_rows_already_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let targets = ExportTargets::in_dir(dir.path());
        let enrichment = CompanyEnrichment::empty("acme.com");
        let leads = LeadsEnrichment {
            domain: "acme.com".into(),
            leads: vec![Lead {
                email: "jane@acme.com".into(),
                ..Default::default()
            }],
        };

        let first = CsvExporter::new();
        first.prepare(&targets).await.unwrap();
        assert_eq!(first.append_company(&targets.companies, &enrichment, None).await.unwrap(), 1);
        assert_eq!(first.append_leads(&targets.leads, &leads, None).await.unwrap(), 1);
        assert_eq!(first.append_company(&targets.companies, &enrichment, None).await.unwrap(), 0);

        // A fresh exporter, as after a restart, reads the keys back from disk.
        let resumed = CsvExporter::new();
        assert_eq!(resumed.append_company(&targets.companies, &enrichment, None).await.unwrap(), 0);
        assert_eq!(resumed.append_leads(&targets.leads, &leads, None).await.unwrap(), 0);
        let other = CompanyEnrichment::empty("globex.io");
        assert_eq!(resumed.append_company(&targets.companies, &other, None).await.unwrap(), 1);

        assert_eq!(read_rows(&targets.companies).len(), 2);
        assert_eq!(read_rows(&targets.leads).len(), 1);
    }

    #[tokio::test]
    async fn blank_keys_are_kept_and_batch_duplicates_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.csv");
        let exporter = CsvExporter::new();
        let row = |email: &str| vec![email.to_string(), "x".to_string()];

        let written = exporter
            .append(&path, &["email", "note"], 0, vec![row(""), row("a@acme.com"), row("a@acme.com")])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let written = exporter
            .append(&path, &["email", "note"], 0, vec![row(""), row("a@acme.com")])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(read_rows(&path).len(), 3);
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.csv");
        let exporter = Arc::new(CsvExporter::new());

        let mut handles = Vec::new();
        for i in 0..20 {
            let exporter = exporter.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                let rows = (0..5)
                    .map(|j| vec![format!("user{i}-{j}@acme.com"), "x".repeat(200)])
                    .collect();
                exporter
                    .append(&path, &["email", "blob"], 0, rows)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rows = read_rows(&path);
        assert_eq!(rows.len(), 100);
        assert!(rows.iter().all(|r| r.len() == 2 && r[1].len() == 200));
    }
}
