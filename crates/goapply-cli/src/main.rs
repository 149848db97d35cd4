use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use goapply_storage::PgBackend;
use goapply_sync::{
    build_orchestrator, open_store, AppConfig, ScrapeOutcome, ScrapeScheduler,
};
use goapply_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "goapply-cli")]
#[command(about = "GoApply job cache command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape cycle and exit.
    Scrape,
    /// Serve the API with the daily scheduler.
    Serve,
    /// Apply Postgres store migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "goapply_cli=info,goapply_sync=info,goapply_storage=info,goapply_adapters=info,goapply_web=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let store = open_store(&config).await?;
            let orchestrator = build_orchestrator(&config, store).await?;
            match orchestrator.run_scrape_cycle().await? {
                ScrapeOutcome::Completed(summary) => println!(
                    "scrape complete: run_id={} jobs={} succeeded={} failed={}",
                    summary.run_id,
                    summary.total_jobs,
                    summary.succeeded.len(),
                    summary.failed.join(",")
                ),
                ScrapeOutcome::Skipped => println!("scrape skipped: another run holds the lock"),
            }
        }
        Commands::Migrate => {
            let backend = PgBackend::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            backend.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => serve(&config).await?,
    }

    Ok(())
}

async fn serve(config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    let orchestrator = build_orchestrator(config, store).await?;
    let scheduler = Arc::new(ScrapeScheduler::new(
        orchestrator.clone(),
        config.schedule_config()?,
    ));
    if config.scheduler_enabled {
        scheduler.start().await?;
    } else {
        warn!("scheduler disabled; scrapes run only on manual refresh");
    }

    let state = AppState::new(orchestrator.clone(), scheduler.clone());
    let served = tokio::select! {
        result = goapply_web::serve(state, config.web_port) => result,
        signal = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            signal.context("listening for ctrl-c")
        }
    };

    scheduler.stop().await?;
    orchestrator.drain_background_runs().await;
    served
}
