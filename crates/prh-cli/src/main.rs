use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prh_sync::{InvocationResult, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "prh-cli")]
#[command(about = "Parkrun club results harvester")]
struct Cli {
    /// Print invocation results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan recent results pages and store newly seen club members.
    Scrape {
        #[arg(long)]
        club_num: Option<u32>,
        #[arg(long)]
        club_name: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Fill in names for participants stored without one.
    Backfill {
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Scrape, then backfill.
    Run,
    /// Apply the embedded database migrations.
    Migrate,
    /// Run scrape and backfill on the configured cron until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    let results = match cli.command.unwrap_or(Commands::Run) {
        Commands::Scrape {
            club_num,
            club_name,
            dry_run,
        } => {
            config.dry_run = dry_run;
            let club = config.club_with_overrides(club_num, club_name);
            vec![prh_sync::scrape_recent_results(&config, &club).await]
        }
        Commands::Backfill { limit, dry_run } => {
            config.dry_run = dry_run;
            let limit = limit.unwrap_or(config.backfill_limit);
            vec![prh_sync::backfill_missing_names(&config, limit).await]
        }
        Commands::Run => prh_sync::scrape_then_backfill(&config).await,
        Commands::Migrate => {
            prh_sync::migrate(&config).await?;
            println!("migrations applied");
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Schedule => {
            let sched = prh_sync::build_scheduler(config.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scheduler_cron, "scheduler running, Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    report(&results, cli.json)?;
    Ok(if results.iter().all(|r| r.success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn report(results: &[InvocationResult], json: bool) -> Result<()> {
    for result in results {
        if json {
            println!("{}", serde_json::to_string(result)?);
        } else {
            println!("{} ({})", result.message, result.status_code);
        }
    }
    Ok(())
}
