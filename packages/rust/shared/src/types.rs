//! Core domain types for DealDriver pipelines.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::extract_domain;
use crate::error::{DealDriverError, Result};

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One domain flowing through the pipeline. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// The line as the user supplied it.
    pub raw: String,
    /// Normalized domain; doubles as the item id.
    pub domain: String,
}

impl WorkItem {
    /// Normalize `raw` (URL, e-mail or bare domain) into a work item.
    pub fn parse(raw: &str) -> Result<Self> {
        let domain = extract_domain(raw)?;
        Ok(Self {
            raw: raw.trim().to_string(),
            domain,
        })
    }

    pub fn id(&self) -> &str {
        &self.domain
    }

    /// Filesystem-safe name for per-item files.
    pub fn file_stem(&self) -> String {
        self.domain.replace('/', "_").replace(':', "")
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.domain)
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// The closed set of pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    EnrichCompany,
    EnrichLeads,
    ExportCompany,
    ExportLeads,
    /// Batch-level CRM import; has no per-item artifact.
    Import,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Scrape,
        Stage::EnrichCompany,
        Stage::EnrichLeads,
        Stage::ExportCompany,
        Stage::ExportLeads,
        Stage::Import,
    ];

    /// Stages that run once per work item and leave an artifact.
    pub const PER_ITEM: [Stage; 5] = [
        Stage::Scrape,
        Stage::EnrichCompany,
        Stage::EnrichLeads,
        Stage::ExportCompany,
        Stage::ExportLeads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::EnrichCompany => "enrich_company",
            Stage::EnrichLeads => "enrich_leads",
            Stage::ExportCompany => "export_company",
            Stage::ExportLeads => "export_leads",
            Stage::Import => "import",
        }
    }

    pub fn is_per_item(&self) -> bool {
        !matches!(self, Stage::Import)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = DealDriverError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DealDriverError::validation(format!("unknown stage '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// The committed output of one stage for one work item.
///
/// A failure artifact still marks the stage as done; downstream stages read
/// `success == false` and degrade instead of re-running it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub item_id: String,
    pub stage: Stage,
    pub success: bool,
    pub committed_at: DateTime<Utc>,
    /// Stage-specific payload; opaque to the scheduler.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Artifact {
    pub fn succeeded<T: Serialize>(item: &WorkItem, stage: Stage, payload: &T) -> Result<Self> {
        Ok(Self {
            item_id: item.id().to_string(),
            stage,
            success: true,
            committed_at: Utc::now(),
            payload: to_payload(payload)?,
            error: None,
        })
    }

    pub fn failed<T: Serialize>(
        item: &WorkItem,
        stage: Stage,
        payload: &T,
        error: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            item_id: item.id().to_string(),
            stage,
            success: false,
            committed_at: Utc::now(),
            payload: to_payload(payload)?,
            error: Some(error.into()),
        })
    }

    /// Decode the payload into the stage's output type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            DealDriverError::parse(format!(
                "{} payload for {}: {e}",
                self.stage, self.item_id
            ))
        })
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Result<serde_json::Value> {
    serde_json::to_value(payload).map_err(|e| DealDriverError::parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Stage payloads
// ---------------------------------------------------------------------------

/// Output of the Scrape stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutput {
    /// Entry URL the crawl started from.
    pub url: String,
    /// Visible text of all fetched pages.
    pub content: String,
    /// Addresses on the target domain found while crawling.
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub pages_scraped: usize,
    /// SHA-256 hex of `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Structured company profile returned by the analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyAnalysis {
    pub business_type_description: String,
    pub company_summary: String,
    pub industry: String,
    pub naics_code: String,
    pub target_market: String,
    pub primary_products_services: Vec<String>,
    pub value_propositions: Vec<String>,
    pub competitive_advantages: Vec<String>,
    pub technologies_used: Vec<String>,
    pub certifications_awards: Vec<String>,
    pub pain_points_addressed: Vec<String>,
    pub confidence_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headquarters_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_size: Option<String>,
}

/// Output of the EnrichCompany stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyEnrichment {
    pub domain: String,
    #[serde(default)]
    pub scraped_url: String,
    #[serde(default)]
    pub emails_found: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<CompanyAnalysis>,
}

impl CompanyEnrichment {
    pub fn empty(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Self::default()
        }
    }
}

/// Persona classification of one contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadAnalysis {
    pub buyer_persona: String,
    /// Clamped to -10..=10.
    pub lead_score_adjustment: i32,
    pub confidence: f64,
    pub reasoning: String,
}

/// One contact derived from a scraped e-mail address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<LeadAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of the EnrichLeads stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadsEnrichment {
    pub domain: String,
    #[serde(default)]
    pub leads: Vec<Lead>,
}

impl LeadsEnrichment {
    pub fn empty(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            leads: Vec::new(),
        }
    }
}

/// Output of the ExportCompany / ExportLeads stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportOutput {
    pub file: PathBuf,
    pub rows_written: usize,
    /// Upstream failure carried into the exported rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_error: Option<String>,
}

/// How a CRM import of one file ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    /// Every row was created, updated, or deliberately skipped.
    #[default]
    Completed,
    /// Some rows failed, some made it.
    Partial,
    /// Nothing made it.
    Failed,
    /// No CRM configured; the file was left alone.
    Skipped,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status report of one CRM import, persisted as the import marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    /// `companies` or `contacts`.
    pub object_type: String,
    pub status: ImportStatus,
    pub source_file: PathBuf,
    /// Data rows in the file when the import ran.
    pub rows_seen: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_status_is_snake_case_on_the_wire() {
        let report = ImportReport {
            status: ImportStatus::Partial,
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "partial");
        let back: ImportReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, ImportStatus::Partial);
        assert_eq!(ImportStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn work_item_normalizes_input() {
        let item = WorkItem::parse("https://www.Example.com/about").expect("parse");
        assert_eq!(item.id(), "example.com");
        assert_eq!(item.raw, "https://www.Example.com/about");
        assert_eq!(item.file_stem(), "example.com");
    }

    #[test]
    fn stage_names_roundtrip() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.as_str().parse().expect("parse stage");
            assert_eq!(parsed, stage);
        }
        assert!(!Stage::Import.is_per_item());
        assert_eq!(Stage::PER_ITEM.len(), 5);
    }

    #[test]
    fn artifact_payload_decodes() {
        let item = WorkItem::parse("acme.io").expect("parse");
        let out = ScrapeOutput {
            url: "https://acme.io".into(),
            content: "We build anvils".into(),
            emails: vec!["sales@acme.io".into()],
            pages_scraped: 1,
            content_hash: None,
        };
        let artifact = Artifact::succeeded(&item, Stage::Scrape, &out).expect("artifact");
        assert!(artifact.success);
        let decoded: ScrapeOutput = artifact.payload_as().expect("decode");
        assert_eq!(decoded, out);
    }

    #[test]
    fn failure_artifact_keeps_error() {
        let item = WorkItem::parse("acme.io").expect("parse");
        let artifact =
            Artifact::failed(&item, Stage::EnrichLeads, &LeadsEnrichment::empty("acme.io"), "boom")
                .expect("artifact");
        assert!(!artifact.success);
        assert_eq!(artifact.error_message(), "boom");
        let json = serde_json::to_string(&artifact).expect("serialize");
        assert!(json.contains("\"stage\":\"enrich_leads\""));
    }

    #[test]
    fn company_analysis_tolerates_missing_fields() {
        let analysis: CompanyAnalysis =
            serde_json::from_str(r#"{"industry":"Manufacturing","confidence_score":0.7}"#)
                .expect("parse");
        assert_eq!(analysis.industry, "Manufacturing");
        assert!(analysis.value_propositions.is_empty());
    }
}
