//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use dealdriver_core::CancellationToken;
use dealdriver_core::dispatch::{WorkerOptions, run_worker};
use dealdriver_core::export::ExportTargets;
use dealdriver_core::pipeline::{
    BatchOptions, BatchSummary, Pipeline, ProgressReporter, artifacts_dir,
};
use dealdriver_core::scheduler::{ItemOutcome, ItemStatus};
use dealdriver_shared::{
    AppConfig, DomainList, ExecutionMode, Stage, WorkItem, config_file_path, init_config,
    init_config_at, load_config, load_config_from, parse_domain_lines, read_domain_file,
};
use dealdriver_storage::ArtifactStore;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DealDriver: scrape, analyze, and export company leads.
#[derive(Parser)]
#[command(
    name = "dealdriver",
    version,
    about = "Enrich company domains into CSV exports and CRM records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.dealdriver/dealdriver.toml).
    #[arg(long, global = true, env = "DEALDRIVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a batch of domains through the pipeline.
    Run {
        /// Domains or URLs to process.
        domains: Vec<String>,

        /// File with one domain per line.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Concurrent items in local mode.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Execution mode: local or distributed.
        #[arg(short, long)]
        mode: Option<ExecutionMode>,

        /// Link depth to follow from the home page.
        #[arg(long)]
        depth: Option<u32>,

        /// Import the exported CSVs into the CRM after the batch.
        #[arg(long)]
        import: bool,

        /// Re-run every stage even if its artifact exists.
        #[arg(long)]
        force: bool,

        /// Output directory for the CSV exports.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Distributed mode: worker slots to run in this process too.
        #[arg(long, default_value = "0")]
        embedded_workers: usize,
    },

    /// Claim and run tasks from the distributed broker until interrupted.
    Worker {
        /// Tasks to run at once (defaults to broker.worker_concurrency).
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Show committed artifact counts per stage.
    Status,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "dealdriver=info",
        1 => "dealdriver=debug",
        _ => "dealdriver=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            domains,
            input,
            workers,
            mode,
            depth,
            import,
            force,
            out,
            embedded_workers,
        } => {
            let mut config = resolve_config(config_path)?;
            if let Some(workers) = workers {
                config.defaults.workers = workers;
            }
            if let Some(mode) = mode {
                config.defaults.mode = mode;
            }
            if let Some(depth) = depth {
                config.defaults.crawl_depth = depth;
            }
            if let Some(out) = &out {
                config.defaults.output_dir = out.to_string_lossy().into_owned();
            }
            config.validate()?;

            let run = RunArgs {
                domains,
                input,
                import,
                force,
                embedded_workers,
            };
            cmd_run(&config, run).await
        }
        Command::Worker { concurrency } => {
            let mut config = resolve_config(config_path)?;
            if let Some(concurrency) = concurrency {
                config.broker.worker_concurrency = concurrency;
            }
            config.validate()?;
            cmd_worker(&config).await
        }
        Command::Status => cmd_status(&resolve_config(config_path)?).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            token.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunArgs {
    domains: Vec<String>,
    input: Option<PathBuf>,
    import: bool,
    force: bool,
    embedded_workers: usize,
}

async fn cmd_run(config: &AppConfig, args: RunArgs) -> Result<()> {
    let mut list = match &args.input {
        Some(path) => read_domain_file(path)?,
        None => DomainList::default(),
    };
    if !args.domains.is_empty() {
        let extra = parse_domain_lines(args.domains.iter().map(String::as_str));
        list.items.extend(extra.items);
        list.errors.extend(extra.errors);
    }
    for problem in &list.errors {
        warn!(problem, "skipping input line");
    }
    if list.items.is_empty() {
        return Err(eyre!(
            "no valid domains given; pass domains as arguments or use --input <file>"
        ));
    }

    let mode = config.defaults.mode;
    let targets = ExportTargets::in_dir(Path::new(&config.defaults.output_dir));
    let mut opts = BatchOptions::new(mode, targets.clone());
    opts.force = args.force;
    opts.import = args.import;
    opts.embedded_workers = args.embedded_workers;

    info!(
        items = list.items.len(),
        %mode,
        workers = config.defaults.workers,
        force = args.force,
        import = args.import,
        "starting batch"
    );

    let pipeline = Pipeline::from_config(config, mode).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let progress = Arc::new(CliProgress::new(list.items.len()));
    let summary = pipeline
        .run_batch(list.items, &opts, progress, &cancel)
        .await?;
    pipeline.shutdown()?;

    print_summary(&summary, &targets);
    if summary.count(ItemStatus::Cancelled) > 0 {
        return Err(eyre!("batch interrupted; rerun the same command to resume"));
    }
    Ok(())
}

fn print_summary(summary: &BatchSummary, targets: &ExportTargets) {
    println!();
    println!("  Batch finished ({} mode)", summary.mode);
    println!("  Items:     {}", summary.outcomes.len());
    println!("  Completed: {}", summary.count(ItemStatus::Completed));
    println!("  Degraded:  {}", summary.count(ItemStatus::Degraded));
    println!("  Failed:    {}", summary.count(ItemStatus::Failed));
    println!("  Cancelled: {}", summary.count(ItemStatus::Cancelled));
    println!("  Scraped:   {}", summary.executed(Stage::Scrape));
    println!("  Companies: {}", targets.companies.display());
    println!("  Leads:     {}", targets.leads.display());
    for report in &summary.imports {
        println!(
            "  Import {}: {} (created {}, updated {}, skipped {}, failed {})",
            report.object_type,
            report.status,
            report.created,
            report.updated,
            report.skipped,
            report.failed
        );
    }
    if let Some(error) = &summary.import_error {
        println!("  Import error: {error}");
    }
    println!("  Time:      {:.1}s", summary.elapsed.as_secs_f64());
    println!();

    for outcome in &summary.outcomes {
        if let Some(error) = &outcome.error {
            println!("  {} [{}]: {error}", outcome.item.id(), outcome.status.as_str());
        }
    }
}

// ---------------------------------------------------------------------------
// worker
// ---------------------------------------------------------------------------

async fn cmd_worker(config: &AppConfig) -> Result<()> {
    let pipeline = Pipeline::from_config(config, ExecutionMode::Distributed).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let opts = WorkerOptions::from(&config.broker);
    info!(
        concurrency = opts.concurrency,
        spool = %config.broker.spool_dir,
        "worker started"
    );

    let summary = run_worker(
        pipeline.broker().clone(),
        pipeline.scheduler().clone(),
        opts,
        cancel,
    )
    .await?;
    pipeline.shutdown()?;

    println!();
    println!("  Worker stopped");
    println!("  Processed: {}", summary.processed);
    println!("  Degraded:  {}", summary.degraded);
    println!("  Failed:    {}", summary.failed);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let root = artifacts_dir(config);
    let store = ArtifactStore::open_readonly(&root);

    println!();
    println!("  Artifacts: {}", root.display());
    for stage in Stage::PER_ITEM {
        let ids = store.list(stage).await?;
        println!("  {:<15} {}", stage.as_str(), ids.len());
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let target = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    if target.exists() {
        println!("Config already exists at {}", target.display());
        return Ok(());
    }
    let written = match path {
        Some(path) => init_config_at(path)?,
        None => init_config()?,
    };
    println!("Created config at {}", written.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let rendered = toml::to_string_pretty(&config)?;
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar over the batch.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn stage_started(&self, item: &WorkItem, stage: Stage) {
        self.bar.set_message(format!("{} {}", stage.as_str(), item.id()));
    }

    fn item_finished(&self, outcome: &ItemOutcome, completed: usize, _total: usize) {
        self.bar.set_position(completed as u64);
        if outcome.status != ItemStatus::Completed {
            self.bar.println(format!(
                "  {} {}",
                outcome.status.as_str(),
                outcome.item.id()
            ));
        }
    }

    fn done(&self, _summary: &BatchSummary) {
        self.bar.finish_and_clear();
    }
}
