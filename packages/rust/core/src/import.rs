//! Batch-level CRM import.
//!
//! Runs once per batch after every export, reading the two CSV files back
//! and upserting each row into the CRM. Companies are keyed by domain and
//! contacts by e-mail, so re-importing the same file updates rather than
//! duplicates. Each file gets an [`ImportReport`] marker written next to
//! it; a file whose marker already covers its current row count is skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use dealdriver_shared::{
    CrmConfig, DealDriverError, ImportReport, ImportStatus, Result, resolve_secret,
};
use dealdriver_storage::{read_marker, write_marker};

use crate::export::ExportTargets;
use crate::ratelimit::RateLimiter;
use crate::stages::CRM_RESOURCE;

/// Whether an upsert created a new record or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// The Import stage collaborator.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn upsert_company(
        &self,
        domain: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome>;

    async fn upsert_contact(
        &self,
        email: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome>;
}

// ---------------------------------------------------------------------------
// HubSpot client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: String,
}

/// [`CrmClient`] for the HubSpot CRM v3 objects API.
pub struct HubSpotClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HubSpotClient {
    pub fn new(config: &CrmConfig, token: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DealDriverError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build from config, or `None` when the token env var is unset.
    pub fn from_config(config: &CrmConfig) -> Result<Option<Self>> {
        match resolve_secret(&config.token_env, "CRM token") {
            Ok(token) => Self::new(config, token).map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn find(&self, object: &str, property: &str, value: &str) -> Result<Option<String>> {
        let body = json!({
            "filterGroups": [{
                "filters": [{ "propertyName": property, "operator": "EQ", "value": value }]
            }],
            "properties": [property],
            "limit": 1,
        });
        let response = self
            .client
            .post(format!("{}/crm/v3/objects/{object}/search", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DealDriverError::Network(format!("CRM search failed: {e}")))?;
        let response = check(response).await?;
        let found: SearchResponse = response
            .json()
            .await
            .map_err(|e| DealDriverError::Crm(format!("malformed search response: {e}")))?;
        Ok(found.results.into_iter().next().map(|hit| hit.id))
    }

    async fn upsert(
        &self,
        object: &str,
        key_property: &str,
        key: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome> {
        let body = json!({ "properties": properties });
        let (request, outcome) = match self.find(object, key_property, key).await? {
            Some(id) => (
                self.client
                    .patch(format!("{}/crm/v3/objects/{object}/{id}", self.base_url)),
                UpsertOutcome::Updated,
            ),
            None => (
                self.client
                    .post(format!("{}/crm/v3/objects/{object}", self.base_url)),
                UpsertOutcome::Created,
            ),
        };
        let response = request
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DealDriverError::Network(format!("CRM upsert failed: {e}")))?;
        check(response).await?;
        debug!(object, key, ?outcome, "CRM upsert");
        Ok(outcome)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(DealDriverError::RateLimitTimeout {
            resource: CRM_RESOURCE.into(),
            waited: Duration::from_secs(1),
        });
    }
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(DealDriverError::Crm(format!("HTTP {status}: {message}")));
    }
    Ok(response)
}

#[async_trait]
impl CrmClient for HubSpotClient {
    async fn upsert_company(
        &self,
        domain: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome> {
        self.upsert("companies", "domain", domain, properties).await
    }

    async fn upsert_contact(
        &self,
        email: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome> {
        self.upsert("contacts", "email", email, properties).await
    }
}

// ---------------------------------------------------------------------------
// Importer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectType {
    Companies,
    Contacts,
}

impl ObjectType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Companies => "companies",
            Self::Contacts => "contacts",
        }
    }
}

type CsvRecord = BTreeMap<String, String>;

/// Imports a batch's CSV exports into the CRM.
pub struct Importer {
    crm: Option<Arc<dyn CrmClient>>,
    limiter: Arc<RateLimiter>,
}

impl Importer {
    /// `crm = None` records a skipped import (no token configured).
    pub fn new(crm: Option<Arc<dyn CrmClient>>, limiter: Arc<RateLimiter>) -> Self {
        Self { crm, limiter }
    }

    /// Import both files and return their reports.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        targets: &ExportTargets,
        cancel: &CancellationToken,
    ) -> Result<Vec<ImportReport>> {
        let companies = self
            .import_file(ObjectType::Companies, &targets.companies, cancel)
            .await?;
        let contacts = self
            .import_file(ObjectType::Contacts, &targets.leads, cancel)
            .await?;
        Ok(vec![companies, contacts])
    }

    async fn import_file(
        &self,
        object: ObjectType,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImportReport> {
        let records = read_records(path).await?;
        let mut report = ImportReport {
            object_type: object.as_str().to_string(),
            status: ImportStatus::Completed,
            source_file: path.to_path_buf(),
            rows_seen: records.len(),
            ..Default::default()
        };

        if let Some(previous) = read_marker(path).await? {
            if previous.status != ImportStatus::Skipped && previous.rows_seen == records.len() {
                info!(file = %path.display(), rows = records.len(), "already imported, skipping");
                return Ok(previous);
            }
        }

        let Some(crm) = &self.crm else {
            warn!(object = object.as_str(), "no CRM token configured, import skipped");
            report.status = ImportStatus::Skipped;
            report.errors.push("no CRM token configured".into());
            report.finished_at = Some(Utc::now());
            write_marker(path, &report).await?;
            return Ok(report);
        };

        for record in &records {
            let (key, properties) = match object {
                ObjectType::Companies => {
                    if field(record, "success") != "true" {
                        report.skipped += 1;
                        continue;
                    }
                    (field(record, "domain"), company_properties(record))
                }
                ObjectType::Contacts => {
                    if field(record, "email").is_empty() {
                        report.skipped += 1;
                        continue;
                    }
                    (field(record, "email"), contact_properties(record))
                }
            };

            let result = self
                .limiter
                .run(CRM_RESOURCE, cancel, || match object {
                    ObjectType::Companies => crm.upsert_company(key, &properties),
                    ObjectType::Contacts => crm.upsert_contact(key, &properties),
                })
                .await;

            match result {
                Ok(UpsertOutcome::Created) => report.created += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(DealDriverError::Cancelled) => return Err(DealDriverError::Cancelled),
                Err(e) => {
                    warn!(object = object.as_str(), key, error = %e, "CRM upsert failed");
                    report.failed += 1;
                    report.errors.push(format!("{key}: {e}"));
                }
            }
        }

        report.status = match (report.failed, report.created + report.updated) {
            (0, _) => ImportStatus::Completed,
            (_, 0) => ImportStatus::Failed,
            _ => ImportStatus::Partial,
        };
        report.finished_at = Some(Utc::now());
        write_marker(path, &report).await?;

        info!(
            object = object.as_str(),
            status = %report.status,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "import finished"
        );
        Ok(report)
    }
}

fn field<'a>(record: &'a CsvRecord, name: &str) -> &'a str {
    record.get(name).map(String::as_str).unwrap_or_default()
}

async fn read_records(path: &Path) -> Result<Vec<CsvRecord>> {
    let path_owned: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<CsvRecord>> {
        let mut reader = match csv::Reader::from_path(&path_owned) {
            Ok(reader) => reader,
            Err(e) => {
                if let csv::ErrorKind::Io(io) = e.kind() {
                    if io.kind() == std::io::ErrorKind::NotFound {
                        return Ok(Vec::new());
                    }
                }
                return Err(DealDriverError::Storage(format!(
                    "{}: {e}",
                    path_owned.display()
                )));
            }
        };
        reader
            .deserialize()
            .collect::<std::result::Result<Vec<CsvRecord>, _>>()
            .map_err(|e| DealDriverError::parse(format!("{}: {e}", path_owned.display())))
    })
    .await
    .map_err(|e| DealDriverError::Storage(format!("import read task failed: {e}")))?
}

/// CRM properties for one `companies.csv` row.
fn company_properties(record: &CsvRecord) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert("domain".to_string(), field(record, "domain").to_string());
    properties.insert("name".to_string(), field(record, "domain").to_string());
    for (column, property) in [
        ("business_type", "business_type_description"),
        ("naics_code", "naics_code"),
        ("target_market", "target_market"),
        ("confidence_score", "confidence_score"),
        ("products_services", "primary_products_services"),
        ("value_propositions", "value_propositions"),
        ("competitive_advantages", "competitive_advantages"),
        ("technologies", "technologies_used"),
        ("certifications", "certifications_awards"),
        ("pain_points", "pain_points_addressed"),
    ] {
        let value = field(record, column);
        if !value.is_empty() {
            properties.insert(property.to_string(), value.to_string());
        }
    }
    properties.insert("enrichment_status".to_string(), "completed".to_string());
    properties.insert(
        "enrichment_date".to_string(),
        field(record, "enriched_at").to_string(),
    );
    properties
}

/// CRM properties for one `leads.csv` row.
fn contact_properties(record: &CsvRecord) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert("email".to_string(), field(record, "email").to_string());
    for (column, property) in [
        ("first_name", "firstname"),
        ("last_name", "lastname"),
        ("company_domain", "company"),
        ("buyer_persona", "buyer_persona"),
        ("lead_score_adjustment", "lead_score_adjustment"),
    ] {
        let value = field(record, column);
        if !value.is_empty() {
            properties.insert(property.to_string(), value.to_string());
        }
    }
    properties.insert("enrichment_status".to_string(), "completed".to_string());
    properties.insert(
        "enrichment_date".to_string(),
        field(record, "enriched_at").to_string(),
    );
    properties
}
