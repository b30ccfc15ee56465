mod followers;
mod harvest;

use clap::{Parser, Subcommand};
use socdb_core::{AppConfig, CollectionType};
use tracing_subscriber::EnvFilter;

use crate::followers::FollowersCommands;

#[derive(Debug, Parser)]
#[command(name = "socdb-cli")]
#[command(about = "Incremental social-content harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Harvest every configured target, resuming from stored checkpoints
    Harvest {
        /// Restrict the run to one target (by id)
        #[arg(long)]
        target: Option<String>,

        /// Restrict the run to one collection type
        #[arg(long)]
        collection: Option<CollectionType>,

        /// Ignore stored checkpoints and start every collection from the beginning
        #[arg(long)]
        force: bool,

        /// Skip items the database already has instead of refreshing their counters
        #[arg(long)]
        skip_known: bool,

        /// Harvest into an in-memory store and report what would be written
        #[arg(long)]
        dry_run: bool,
    },
    /// Show stored harvest checkpoints
    Status {
        /// Only show checkpoints for one collection type
        #[arg(long)]
        collection: Option<CollectionType>,

        /// Print checkpoints as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the checkpoint for one target and collection
    Reset {
        #[arg(long)]
        target: String,

        #[arg(long)]
        collection: CollectionType,
    },
    /// Follower maintenance
    Followers {
        #[command(subcommand)]
        command: FollowersCommands,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommands {
    /// Check that the database is reachable
    Ping,
    /// Apply pending migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("socdb-cli: no command given (see --help)");
        return Ok(());
    };

    let config = socdb_core::load_app_config()?;
    init_tracing(&config.log_level);
    tracing::debug!(env = %config.env, "configuration loaded");

    match command {
        Commands::Db { command } => run_db(&config, command).await,
        Commands::Harvest {
            target,
            collection,
            force,
            skip_known,
            dry_run,
        } => {
            let args = harvest::HarvestArgs {
                target,
                collection,
                force,
                skip_known,
                dry_run,
            };
            harvest::run_harvest(&config, &args).await
        }
        Commands::Status { collection, json } => {
            harvest::run_status(&config, collection, json).await
        }
        Commands::Reset { target, collection } => {
            harvest::run_reset(&config, &target, collection).await
        }
        Commands::Followers { command } => followers::run(&config, command).await,
    }
}

/// `RUST_LOG` wins when set; otherwise the configured level applies.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub(crate) async fn connect(config: &AppConfig) -> anyhow::Result<sqlx::PgPool> {
    let pool = socdb_db::connect_pool(
        &config.database_url,
        socdb_db::PoolConfig::from_app_config(config),
    )
    .await?;
    Ok(pool)
}

async fn run_db(config: &AppConfig, command: DbCommands) -> anyhow::Result<()> {
    let pool = connect(config).await?;
    match command {
        DbCommands::Ping => {
            socdb_db::ping(&pool).await?;
            println!("database reachable");
        }
        DbCommands::Migrate => {
            let applied = socdb_db::run_migrations(&pool).await?;
            println!("applied {applied} migration(s)");
        }
    }
    Ok(())
}
