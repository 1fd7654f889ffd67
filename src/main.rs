//! mokkoji-sync CLI - operational entry point for the calendar sync engine.
//!
//! HTTP request routing and caller authentication are explicit external
//! collaborators (spec §1); this binary only exposes the operations the
//! CORE owns directly: schema migration, one-off pull/state for ops use,
//! and a long-running scheduler process.

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use mokkoji_sync::credentials::TokenEncryptor;
use mokkoji_sync::dispatcher::{PullRequest, SyncDispatcher};
use mokkoji_sync::engine::SyncEngine;
use mokkoji_sync::lease::LeaseRegistry;
use mokkoji_sync::providers::registry::ProviderRegistry;
use mokkoji_sync::{Config, Database};

#[derive(Parser)]
#[command(name = "mokkoji-sync")]
#[command(version, about = "Provider-neutral calendar synchronization engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Trigger a one-off pull for a user's connections
    Pull {
        /// User id (UUID)
        #[arg(long)]
        user_id: Uuid,

        /// Connection ids to sync (UUID, repeatable)
        #[arg(long = "connection")]
        connection_ids: Vec<Uuid>,

        /// Ignore any stored delta token and do a full window sync
        #[arg(long)]
        force_full: bool,
    },

    /// Print connection health and per-calendar sync state for a user
    State {
        #[arg(long)]
        user_id: Uuid,
    },

    /// Run the long-lived scheduler process (periodic pull sweeps)
    Serve {
        /// Cron expression for the sweep (tokio-cron-scheduler syntax)
        #[arg(long, default_value = "0 */15 * * * *")]
        cron: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    match cli.command {
        Commands::Migrate => {
            let db = Database::from_pool(pool);
            db.initialize().await?;
            println!("migrations applied");
        }
        Commands::Pull {
            user_id,
            connection_ids,
            force_full,
        } => {
            let dispatcher = build_dispatcher(pool, &config)?;
            let response = dispatcher
                .pull(
                    user_id,
                    PullRequest {
                        connection_ids,
                        calendar_ids: None,
                        force_full,
                        window_days_past: 90,
                        window_days_future: 180,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::State { user_id } => {
            let dispatcher = build_dispatcher(pool, &config)?;
            let state = dispatcher.state(user_id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Serve { cron } => {
            let dispatcher = std::sync::Arc::new(build_dispatcher(pool.clone(), &config)?);
            let mut scheduler = mokkoji_sync::scheduler::Scheduler::new(pool, dispatcher).await?;
            scheduler.start(&cron).await?;

            tracing::info!("mokkoji-sync scheduler running, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.stop().await?;
        }
    }

    Ok(())
}

fn build_dispatcher(
    pool: sqlx::PgPool,
    config: &mokkoji_sync::Config,
) -> Result<SyncDispatcher, Box<dyn std::error::Error>> {
    let encryptor = TokenEncryptor::from_base64_key(&config.encryption_key_b64)?;
    let timeout = std::time::Duration::from_secs(config.default_timeout_secs);
    let providers = std::sync::Arc::new(ProviderRegistry::new(timeout));

    let engine = std::sync::Arc::new(
        SyncEngine::new(pool.clone(), std::sync::Arc::clone(&providers), encryptor)
            .with_request_deadline(timeout),
    );
    let leases = std::sync::Arc::new(LeaseRegistry::new(std::time::Duration::from_secs(3600)));
    Ok(SyncDispatcher::new(pool, engine, providers, leases))
}
