//! DealDriver CLI: domain enrichment pipeline.
//!
//! Scrapes company websites, analyzes them with an LLM, exports companies
//! and leads to CSV, and optionally imports the results into the CRM.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
