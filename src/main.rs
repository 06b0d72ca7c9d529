//! CLI entry point for the harvester tool.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::pipeline::RunObserver;
use harvester_core::{Catalog, HarvestConfig, Orchestrator, RunSummary};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod cli;
mod progress;

use cli::Args;
use progress::TermProgress;

/// Log file written inside the output directory.
const RUN_LOG_FILE_NAME: &str = "run.log";

/// Summary report written inside the output directory.
const REPORT_FILE_NAME: &str = "harvest_report.json";

/// Conventional exit status after SIGINT.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            args.output_dir.display()
        )
    })?;
    init_tracing(&args)?;
    debug!(?args, "CLI arguments parsed");

    let config = load_config(&args)?;
    debug!(?config, "effective configuration");

    let mut catalog = match &args.catalog {
        Some(path) => Catalog::load(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?,
        None => Catalog::builtin(),
    };
    if let Some(category) = &args.category {
        catalog = catalog.retain_category(category)?;
    }

    let mut orchestrator = Orchestrator::from_config(&config, &args.output_dir)
        .await
        .context("failed to set up harvest")?;

    let progress =
        (!args.quiet && std::io::stderr().is_terminal()).then(|| Arc::new(TermProgress::new()));
    if let Some(progress) = &progress {
        let observer: Arc<dyn RunObserver> = Arc::clone(progress) as Arc<dyn RunObserver>;
        orchestrator = orchestrator.with_observer(observer);
    }

    info!(
        output_dir = %args.output_dir.display(),
        categories = catalog.categories().len(),
        terms = catalog.term_count(),
        adapters = ?orchestrator.adapter_names(),
        "harvester starting"
    );

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });

    let result = orchestrator.run(&catalog).await;
    if let Some(progress) = &progress {
        progress.finish();
    }
    let summary = result.context("harvest aborted")?;

    let report_path = args.output_dir.join(REPORT_FILE_NAME);
    write_report(&report_path, &summary)?;
    print_summary(&summary, &report_path, orchestrator.manifest_path());

    if summary.cancelled {
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    Ok(ExitCode::SUCCESS)
}

/// Installs a stderr layer and a plain-text `run.log` layer.
///
/// Priority: `RUST_LOG` env var > `-q` > `-v` count > default (info).
fn init_tracing(args: &Args) -> Result<()> {
    let log_path = args.output_dir.join(RUN_LOG_FILE_NAME);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_log_level()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(log_file)),
        )
        .try_init()
        .context("failed to install logging")?;
    Ok(())
}

/// Config file (or defaults) with CLI overrides applied, then validated.
fn load_config(args: &Args) -> Result<HarvestConfig> {
    let mut config = match &args.config {
        Some(path) => HarvestConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => HarvestConfig::default(),
    };

    if let Some(max_results) = args.max_results {
        config.max_results_per_term = usize::from(max_results);
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = usize::from(concurrency);
    }
    if !args.seeds.is_empty() {
        config.seed_urls.clone_from(&args.seeds);
    }
    if args.no_engines {
        config.engines.clear();
    } else if !args.engines.is_empty() {
        config.engines.clone_from(&args.engines);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

#[allow(clippy::print_stdout)]
fn print_summary(summary: &RunSummary, report_path: &Path, manifest_path: &Path) {
    println!();
    let suffix = if summary.cancelled { " (cancelled)" } else { "" };
    println!("Harvest summary{suffix}");
    println!(
        "  terms processed:  {}/{}",
        summary.terms_processed, summary.terms_total
    );
    println!("  discovered:       {}", summary.discovered);
    println!("  saved:            {}", summary.saved);
    println!("  rejected:         {}", summary.rejected);
    println!("  skipped:          {}", summary.skipped);
    println!("  errors:           {}", summary.errors);
    println!("  discovery errors: {}", summary.discovery_errors);
    for (category, count) in &summary.categories {
        println!("    {category}: {count} files");
    }
    println!("  manifest: {}", manifest_path.display());
    println!("  report:   {}", report_path.display());
}
