use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vtrend_aggregate::{run_once, RunConfig, SiteRegistry};

#[derive(Debug, Parser)]
#[command(name = "vtrend-cli")]
#[command(about = "Reconstruct vacancy keyword trends from archived job boards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Traverse every configured site and write a report run.
    Run {
        /// Site registry; defaults to VTREND_SITES or ./sites.yaml.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Replay the snapshot store without network access.
        #[arg(long)]
        offline: bool,
    },
    /// List configured sites and their resolved board kinds.
    Sites {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn registry_path(config: &RunConfig, override_path: Option<PathBuf>) -> PathBuf {
    override_path.unwrap_or_else(|| config.registry_path.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RunConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        config: None,
        offline: false,
    }) {
        Commands::Run {
            config: path,
            offline,
        } => {
            config.offline |= offline;
            let registry = SiteRegistry::load(registry_path(&config, path))?;
            let (run, run_dir) = run_once(&config, &registry).await?;
            let observed: usize = run.stats.iter().map(|s| s.observed).sum();
            let days: usize = run.stats.iter().map(|s| s.days_total).sum();
            println!(
                "run complete: run_id={} sites={} observed_days={}/{} reports={}",
                run.run_id,
                run.stats.len(),
                observed,
                days,
                run_dir.display()
            );
        }
        Commands::Sites { config: path } => {
            let registry = SiteRegistry::load(registry_path(&config, path))?;
            for target in registry.resolve()? {
                println!(
                    "{}\t{}\t{}..{}\t{} keywords\t{}",
                    target.kind,
                    target.url,
                    target.start,
                    target.end,
                    target.keywords.len(),
                    vtrend_core::site_label(&target.url)
                );
            }
        }
    }

    Ok(())
}
