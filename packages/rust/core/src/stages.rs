//! Per-stage execution.
//!
//! [`StageRunner::execute`] maps each [`Stage`] to the collaborator call
//! that produces its output and always turns the outcome into an
//! [`Artifact`]: collaborator failures (including exhausted rate-limit
//! retries) become `success = false` artifacts instead of errors. Only
//! cancellation and a missing upstream artifact escape as `Err`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dealdriver_crawler::{BrowserSession, Scraper};
use dealdriver_shared::{
    Artifact, CompanyEnrichment, DealDriverError, ExportOutput, Lead, LeadsEnrichment, Result,
    ScrapeOutput, Stage, WorkItem,
};

use crate::enrichment::{Analyzer, LeadContext, derive_lead_name};
use crate::export::{CsvExporter, ExportTargets};
use crate::pool::SessionPool;
use crate::ratelimit::RateLimiter;

/// Rate-limit bucket for site scraping.
pub const SCRAPE_RESOURCE: &str = "scrape";
/// Rate-limit bucket for the analysis API.
pub const AI_RESOURCE: &str = "ai-api";
/// Rate-limit bucket for CRM calls.
pub const CRM_RESOURCE: &str = "crm";

/// Upstream artifacts handed to a stage, keyed by stage.
pub type StageInputs = BTreeMap<Stage, Artifact>;

/// External systems the stages call into.
#[derive(Clone)]
pub struct Collaborators {
    pub scraper: Arc<dyn Scraper>,
    pub analyzer: Arc<dyn Analyzer>,
    pub exporter: Arc<CsvExporter>,
}

/// Executes individual stages against shared resources.
pub struct StageRunner {
    collaborators: Collaborators,
    sessions: SessionPool<BrowserSession>,
    limiter: Arc<RateLimiter>,
}

impl StageRunner {
    pub fn new(
        collaborators: Collaborators,
        sessions: SessionPool<BrowserSession>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            collaborators,
            sessions,
            limiter,
        }
    }

    pub fn sessions(&self) -> &SessionPool<BrowserSession> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run `stage` for `item` and return the artifact to commit.
    pub async fn execute(
        &self,
        stage: Stage,
        item: &WorkItem,
        inputs: &StageInputs,
        targets: &ExportTargets,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        match stage {
            Stage::Scrape => self.scrape(item, cancel).await,
            Stage::EnrichCompany => {
                let scrape = upstream(inputs, item, stage, Stage::Scrape)?;
                self.enrich_company(item, scrape, cancel).await
            }
            Stage::EnrichLeads => {
                let scrape = upstream(inputs, item, stage, Stage::Scrape)?;
                self.enrich_leads(item, scrape, cancel).await
            }
            Stage::ExportCompany => {
                let enriched = upstream(inputs, item, stage, Stage::EnrichCompany)?;
                self.export_company(item, enriched, &targets.companies).await
            }
            Stage::ExportLeads => {
                let enriched = upstream(inputs, item, stage, Stage::EnrichLeads)?;
                self.export_leads(item, enriched, &targets.leads).await
            }
            Stage::Import => Err(DealDriverError::validation(
                "import runs once per batch, not per item",
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Scrape
    // -----------------------------------------------------------------------

    async fn scrape(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<Artifact> {
        let outcome = async {
            self.limiter
                .acquire_with_retry(SCRAPE_RESOURCE, 1.0, cancel)
                .await?;
            let lease = self.sessions.checkout(cancel).await?;
            let result = self.collaborators.scraper.scrape(&lease, &item.domain).await;
            lease.finish(result.is_ok());
            result
        }
        .await;

        let fallback = ScrapeOutput {
            url: format!("https://{}/", item.domain),
            ..Default::default()
        };
        capture(item, Stage::Scrape, outcome, &fallback)
    }

    // -----------------------------------------------------------------------
    // Enrich
    // -----------------------------------------------------------------------

    async fn enrich_company(
        &self,
        item: &WorkItem,
        scrape: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let fallback = CompanyEnrichment::empty(&item.domain);
        if !scrape.success {
            return Artifact::failed(
                item,
                Stage::EnrichCompany,
                &fallback,
                format!("scrape failed: {}", scrape.error_message()),
            );
        }

        let outcome = async {
            let scraped: ScrapeOutput = scrape.payload_as()?;
            let analysis = self
                .limiter
                .run(AI_RESOURCE, cancel, || {
                    self.collaborators.analyzer.analyze_company(
                        &item.domain,
                        &scraped.content,
                        &scraped.emails,
                    )
                })
                .await?;
            Ok(CompanyEnrichment {
                domain: item.domain.clone(),
                scraped_url: scraped.url,
                emails_found: scraped.emails,
                analysis: Some(analysis),
            })
        }
        .await;

        capture(item, Stage::EnrichCompany, outcome, &fallback)
    }

    async fn enrich_leads(
        &self,
        item: &WorkItem,
        scrape: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let fallback = LeadsEnrichment::empty(&item.domain);
        if !scrape.success {
            return Artifact::failed(
                item,
                Stage::EnrichLeads,
                &fallback,
                format!("scrape failed: {}", scrape.error_message()),
            );
        }

        let scraped: ScrapeOutput = match scrape.payload_as() {
            Ok(scraped) => scraped,
            Err(e) => return capture::<LeadsEnrichment>(item, Stage::EnrichLeads, Err(e), &fallback),
        };

        let mut leads = Vec::with_capacity(scraped.emails.len());
        for email in &scraped.emails {
            let (first_name, last_name) = derive_lead_name(email);
            let context = LeadContext {
                email,
                first_name: &first_name,
                last_name: &last_name,
                company_domain: &item.domain,
                company_content: &scraped.content,
            };

            let analyzed = self
                .limiter
                .run(AI_RESOURCE, cancel, || {
                    self.collaborators.analyzer.analyze_lead(&context)
                })
                .await;

            let mut lead = Lead {
                email: email.clone(),
                first_name: first_name.clone(),
                last_name: last_name.clone(),
                analysis: None,
                error: None,
            };
            match analyzed {
                Ok(analysis) => lead.analysis = Some(analysis),
                Err(DealDriverError::Cancelled) => return Err(DealDriverError::Cancelled),
                Err(e) => {
                    warn!(item = %item, email, error = %e, "lead analysis failed");
                    lead.error = Some(e.to_string());
                }
            }
            leads.push(lead);
        }

        debug!(item = %item, leads = leads.len(), "leads enriched");
        Artifact::succeeded(
            item,
            Stage::EnrichLeads,
            &LeadsEnrichment {
                domain: item.domain.clone(),
                leads,
            },
        )
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    async fn export_company(
        &self,
        item: &WorkItem,
        enriched: &Artifact,
        file: &Path,
    ) -> Result<Artifact> {
        let upstream_error = (!enriched.success).then(|| enriched.error_message().to_string());
        let payload: CompanyEnrichment = enriched
            .payload_as()
            .unwrap_or_else(|_| CompanyEnrichment::empty(&item.domain));

        let outcome = self
            .collaborators
            .exporter
            .append_company(file, &payload, upstream_error.as_deref())
            .await
            .map(|rows_written| ExportOutput {
                file: file.to_path_buf(),
                rows_written,
                upstream_error: upstream_error.clone(),
            });

        let fallback = ExportOutput {
            file: file.to_path_buf(),
            rows_written: 0,
            upstream_error,
        };
        capture(item, Stage::ExportCompany, outcome, &fallback)
    }

    async fn export_leads(
        &self,
        item: &WorkItem,
        enriched: &Artifact,
        file: &Path,
    ) -> Result<Artifact> {
        let upstream_error = (!enriched.success).then(|| enriched.error_message().to_string());
        let payload: LeadsEnrichment = enriched
            .payload_as()
            .unwrap_or_else(|_| LeadsEnrichment::empty(&item.domain));

        let outcome = self
            .collaborators
            .exporter
            .append_leads(file, &payload, upstream_error.as_deref())
            .await
            .map(|rows_written| ExportOutput {
                file: file.to_path_buf(),
                rows_written,
                upstream_error: upstream_error.clone(),
            });

        let fallback = ExportOutput {
            file: file.to_path_buf(),
            rows_written: 0,
            upstream_error,
        };
        capture(item, Stage::ExportLeads, outcome, &fallback)
    }
}

fn upstream<'a>(
    inputs: &'a StageInputs,
    item: &WorkItem,
    stage: Stage,
    dependency: Stage,
) -> Result<&'a Artifact> {
    inputs
        .get(&dependency)
        .ok_or_else(|| DealDriverError::DependencyMissing {
            item: item.id().to_string(),
            stage: stage.to_string(),
            upstream: dependency.to_string(),
        })
}

/// Turn a collaborator outcome into an artifact. Cancellation is passed
/// through so the stage is re-run on resume.
fn capture<T: Serialize>(
    item: &WorkItem,
    stage: Stage,
    outcome: Result<T>,
    fallback: &T,
) -> Result<Artifact> {
    match outcome {
        Ok(payload) => Artifact::succeeded(item, stage, &payload),
        Err(DealDriverError::Cancelled) => Err(DealDriverError::Cancelled),
        Err(e) => {
            warn!(item = %item, stage = %stage, error = %e, "stage failed");
            let failure = DealDriverError::stage_failure(stage.as_str(), e.to_string());
            Artifact::failed(item, stage, fallback, failure.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Harness;
    use dealdriver_shared::LeadsEnrichment;

    #[tokio::test]
    async fn enrich_without_scrape_is_dependency_missing() {
        let h = Harness::new().await;
        let item = WorkItem::parse("acme.com").unwrap();
        let err = h
            .runner
            .execute(
                Stage::EnrichCompany,
                &item,
                &StageInputs::new(),
                &h.targets,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DealDriverError::DependencyMissing { .. }));
    }

    #[tokio::test]
    async fn scrape_failure_is_captured() {
        let h = Harness::new().await;
        h.scraper.fail("acme.com");
        let item = WorkItem::parse("acme.com").unwrap();
        let artifact = h
            .runner
            .execute(
                Stage::Scrape,
                &item,
                &StageInputs::new(),
                &h.targets,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!artifact.success);
        assert!(artifact.error_message().starts_with("scrape failed"));
        // The failed session was retired, not returned.
        assert_eq!(h.runner.sessions().stats().idle, 0);
    }

    #[tokio::test]
    async fn leads_without_emails_succeed_empty() {
        let h = Harness::new().await;
        h.scraper.without_emails("acme.com");
        let item = WorkItem::parse("acme.com").unwrap();
        let cancel = CancellationToken::new();
        let scrape = h
            .runner
            .execute(Stage::Scrape, &item, &StageInputs::new(), &h.targets, &cancel)
            .await
            .unwrap();
        let inputs = StageInputs::from([(Stage::Scrape, scrape)]);
        let leads = h
            .runner
            .execute(Stage::EnrichLeads, &item, &inputs, &h.targets, &cancel)
            .await
            .unwrap();
        assert!(leads.success);
        let payload: LeadsEnrichment = leads.payload_as().unwrap();
        assert!(payload.leads.is_empty());
        assert_eq!(h.analyzer.lead_calls(), 0);
    }

    #[tokio::test]
    async fn lead_failures_are_recorded_per_lead() {
        let h = Harness::new().await;
        h.analyzer.fail_leads();
        let item = WorkItem::parse("acme.com").unwrap();
        let cancel = CancellationToken::new();
        let scrape = h
            .runner
            .execute(Stage::Scrape, &item, &StageInputs::new(), &h.targets, &cancel)
            .await
            .unwrap();
        let inputs = StageInputs::from([(Stage::Scrape, scrape)]);
        let leads = h
            .runner
            .execute(Stage::EnrichLeads, &item, &inputs, &h.targets, &cancel)
            .await
            .unwrap();
        let payload: LeadsEnrichment = leads.payload_as().unwrap();
        assert!(leads.success);
        assert!(!payload.leads.is_empty());
        assert!(payload.leads.iter().all(|l| l.error.is_some()));
    }

    #[tokio::test]
    async fn import_is_not_a_per_item_stage() {
        let h = Harness::new().await;
        let item = WorkItem::parse("acme.com").unwrap();
        assert!(
            h.runner
                .execute(
                    Stage::Import,
                    &item,
                    &StageInputs::new(),
                    &h.targets,
                    &CancellationToken::new()
                )
                .await
                .is_err()
        );
    }
}
