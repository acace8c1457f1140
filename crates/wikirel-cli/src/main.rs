use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wikirel_sync::{report_markdown, Pipeline, PipelineConfig, RunSummary};

#[derive(Debug, Parser)]
#[command(name = "wikirel")]
#[command(about = "Build Wikipedia reliability datasets enriched with article-level features")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sample every dataset, fetch the article revisions, save the pages.
    Crawl {
        #[arg(long)]
        sample_size: Option<usize>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        pages_dir: Option<PathBuf>,
        /// Replay `{revision_id}.json` API responses instead of calling the live API.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Join saved pages against the enabled feature sources.
    Unify {
        #[arg(long)]
        feature: Option<String>,
    },
    /// Crawl, then unify every enabled feature source.
    Run,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let use_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str()));

    if use_json {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn print_summary(summary: &RunSummary) {
    let fetched: usize = summary.crawl.values().map(|s| s.fetched).sum();
    let unified: usize = summary
        .unify
        .values()
        .flat_map(|stats| stats.values())
        .map(|s| s.matched)
        .sum();
    println!(
        "{} complete: run_id={} datasets={} pages={} unified_rows={} skipped={} reports={}",
        summary.command,
        summary.run_id,
        summary.crawl.len(),
        fetched,
        unified,
        summary.skipped.len(),
        summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Crawl {
            sample_size,
            data_dir,
            pages_dir,
            fixtures,
        } => {
            if let Some(n) = sample_size {
                config.sample_size = n;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(dir) = pages_dir {
                config.pages_dir = dir;
            }
            if fixtures.is_some() {
                config.fixtures_dir = fixtures;
            }
            let summary = Pipeline::new(config)?.run_crawl().await?;
            print_summary(&summary);
        }
        Commands::Unify { feature } => {
            let summary = Pipeline::new(config)?.run_unify(feature.as_deref()).await?;
            print_summary(&summary);
        }
        Commands::Run => {
            let summary = Pipeline::new(config)?.run_all().await?;
            print_summary(&summary);
        }
        Commands::Report { runs } => {
            let reports_root = config.resolve(&config.reports_dir);
            println!("{}", report_markdown(runs, &reports_root)?);
        }
    }

    Ok(())
}
