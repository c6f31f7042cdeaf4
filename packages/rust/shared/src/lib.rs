//! Shared types, error model, and configuration for DealDriver.
//!
//! This crate is the foundation depended on by all other DealDriver crates.
//! It provides:
//! - [`DealDriverError`]: the unified error type
//! - Domain types ([`WorkItem`], [`Stage`], [`Artifact`] and the stage payloads)
//! - Domain-name normalization and input-file parsing ([`domain`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod domain;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnalysisConfig, AppConfig, BrokerConfig, BucketConfig, CrmConfig, DefaultsConfig,
    ExecutionMode, RateLimitsConfig, ScrapingConfig, SessionPoolConfig, config_dir,
    config_file_path, init_config, init_config_at, load_config, load_config_from, resolve_secret,
};
pub use domain::{DomainList, extract_domain, parse_domain_lines, read_domain_file};
pub use error::{DealDriverError, Result};
pub use types::{
    Artifact, CompanyAnalysis, CompanyEnrichment, ExportOutput, ImportReport, ImportStatus, Lead,
    LeadAnalysis, LeadsEnrichment, ScrapeOutput, Stage, WorkItem,
};
