use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tcgp_storage::{CardStore, HttpClientConfig, HttpFetcher, PgCatalogStore};
use tcgp_sync::{collection, dict, SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tcgp-cli")]
#[command(about = "TCG Pocket catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one catalog sync against the configured source and database.
    Sync,
    /// Keep running, syncing on the configured cron schedule.
    Schedule,
    /// Import a player's third-party collection snapshot for a user.
    ImportCollection { user_id: String, url: String },
    /// Build the card-name localization table from the public species API.
    BuildDict {
        #[arg(long, default_value = "translations/cards-fr.json")]
        out: PathBuf,
    },
}

fn http_fetcher(config: &SyncConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = tcgp_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} status={:?} cards={} failures={} missing_terms={}",
                summary.run_id,
                summary.status,
                summary.cards_processed,
                summary.partition_failures.len(),
                summary.missing_card_terms.len() + summary.missing_set_terms.len(),
            );
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            let store = Arc::new(PgCatalogStore::connect(&config.database_url).await?);
            store.run_migrations().await?;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) =
                tcgp_sync::maybe_build_scheduler(pipeline, store.clone() as Arc<dyn CardStore>)
                    .await?
            else {
                eprintln!("scheduler disabled; set TCGP_SCHEDULER_ENABLED=1 to enable it");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
        }
        Commands::ImportCollection { user_id, url } => {
            let config = SyncConfig::from_env();
            let store = PgCatalogStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            let http = http_fetcher(&config)?;
            let snapshot =
                collection::import_collection(&http, &store, &config.collection_api, &user_id, &url)
                    .await?;
            println!(
                "collection import complete: player={} uniques={} copies={}",
                snapshot.player_id,
                snapshot.unique_cards(),
                snapshot.total_copies(),
            );
        }
        Commands::BuildDict { out } => {
            let config = SyncConfig::from_env();
            let http = http_fetcher(&config)?;
            let entries = dict::build_card_dictionary(&http, dict::DEFAULT_SPECIES_API, &out).await?;
            println!("dictionary written: {} entries -> {}", entries, out.display());
        }
    }

    Ok(())
}
