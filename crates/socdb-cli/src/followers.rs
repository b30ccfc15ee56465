//! Follower maintenance commands.
//!
//! Harvests only ever add or reactivate followers. Pruning is a separate,
//! explicit step run after a complete follower harvest.

use chrono::{Duration, Utc};
use clap::Subcommand;
use socdb_core::AppConfig;

#[derive(Debug, Subcommand)]
pub enum FollowersCommands {
    /// Mark followers that were not seen recently as inactive
    Prune {
        /// Profile external id
        #[arg(long)]
        profile: String,

        /// Followers last seen more than this many days ago are deactivated
        #[arg(long, default_value = "7")]
        older_than_days: u32,
    },
}

pub(crate) async fn run(config: &AppConfig, command: FollowersCommands) -> anyhow::Result<()> {
    match command {
        FollowersCommands::Prune {
            profile,
            older_than_days,
        } => prune(config, &profile, older_than_days).await,
    }
}

async fn prune(config: &AppConfig, profile: &str, older_than_days: u32) -> anyhow::Result<()> {
    let pool = crate::connect(config).await?;
    let seen_before = Utc::now() - Duration::days(i64::from(older_than_days));

    let deactivated = socdb_db::deactivate_unseen_followers(&pool, profile, seen_before).await?;
    let active = socdb_db::count_active_followers(&pool, profile).await?;

    tracing::info!(
        profile,
        deactivated,
        active,
        seen_before = %seen_before,
        "followers pruned"
    );
    println!(
        "{profile}: deactivated {deactivated} follower(s) not seen since {}; {active} active",
        seen_before.format("%Y-%m-%d %H:%M UTC")
    );
    Ok(())
}
