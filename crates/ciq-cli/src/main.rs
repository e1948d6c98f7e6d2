use std::path::PathBuf;

use anyhow::{Context, Result};
use ciq_core::Domain;
use ciq_pipeline::{
    fetch_all_from_config, merge_from_config, read_domain_list, report_markdown, Orchestrator,
    PipelineConfig, RunError,
};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ciq")]
#[command(about = "Company intelligence extraction pipeline")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Overrides {
    /// YAML config file (defaults to $CIQ_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,
    #[arg(long, global = true)]
    model: Option<String>,
    #[arg(long, global = true)]
    inference_url: Option<String>,
    #[arg(long, global = true)]
    fetch_concurrency: Option<usize>,
    /// Fetch starts per second; 0 disables pacing.
    #[arg(long, global = true)]
    fetch_rate: Option<u32>,
    #[arg(long, global = true)]
    max_attempts: Option<usize>,
    #[arg(long, global = true)]
    max_passes: Option<usize>,
    /// Treat failure checkpoints as final instead of retrying them.
    #[arg(long, global = true)]
    no_retry_failed: bool,
}

#[derive(Debug, Args)]
struct DomainInput {
    /// Domain list: one domain per line, or CSV with a `domain` column.
    #[arg(long, short = 'f')]
    domains_file: Option<PathBuf>,
    /// Extra domains, repeatable.
    #[arg(long = "domain", value_parser = Domain::parse)]
    domains: Vec<Domain>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download raw pages for every domain that has no dump yet.
    FetchAll(DomainInput),
    /// Fetch, clean, extract and checkpoint every domain, then merge.
    Run(DomainInput),
    /// Rebuild the corpus from checkpoints.
    Merge,
    /// Print the most recent run briefs.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
    },
}

impl Overrides {
    fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;
        if let Some(v) = &self.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = &self.corpus {
            config.corpus_path = Some(v.clone());
        }
        if let Some(v) = &self.model {
            config.model = v.clone();
        }
        if let Some(v) = &self.inference_url {
            config.inference_url = v.clone();
        }
        if let Some(v) = self.fetch_concurrency {
            config.fetch_concurrency = v;
        }
        if let Some(v) = self.fetch_rate {
            config.fetch_rate_per_sec = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.max_passes {
            config.max_passes = v;
        }
        if self.no_retry_failed {
            config.retry_failed = false;
        }
        Ok(config)
    }
}

impl DomainInput {
    async fn collect(&self) -> Result<Vec<Domain>, RunError> {
        let mut domains = match &self.domains_file {
            Some(path) => read_domain_list(path).await?,
            None => Vec::new(),
        };
        domains.extend(self.domains.iter().cloned());
        if domains.is_empty() {
            return Err(RunError::EmptyInput);
        }
        Ok(domains)
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.overrides.resolve()?;

    match cli.command {
        Commands::FetchAll(input) => {
            let domains = input.collect().await?;
            let summary = fetch_all_from_config(&config, domains).await?;
            println!(
                "fetch-all complete: requested={} fetched={} skipped_existing={} failed={}",
                summary.requested,
                summary.fetched,
                summary.skipped_existing,
                summary.failed_by_kind.values().sum::<usize>()
            );
        }
        Commands::Run(input) => {
            let domains = input.collect().await?;
            let orchestrator = Orchestrator::from_config(&config)?;
            let summary = orchestrator.run(domains).await?;
            println!(
                "run complete: run_id={} domains={} extracted={} resumed={} failed={} merged={} reports={}",
                summary.run_id,
                summary.input_domains,
                summary.extracted,
                summary.resumed,
                summary.failed_by_stage.values().sum::<usize>(),
                summary.merged,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Merge => {
            let report = merge_from_config(&config).await?;
            println!(
                "merge complete: records={} failures={} skipped_corrupt={} corpus={}",
                report.total_records, report.failure_markers, report.skipped_corrupt, report.corpus_path
            );
        }
        Commands::Report { runs } => {
            let markdown = report_markdown(runs, &config.reports_dir())
                .with_context(|| format!("no run reports under {}", config.data_dir.display()))?;
            println!("{markdown}");
        }
    }

    Ok(())
}
