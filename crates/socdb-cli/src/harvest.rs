//! Harvest command handlers for the CLI.
//!
//! Every (target, collection) pair with an endpoint becomes one harvest on a
//! shared [`Harvester`]. Per-harvest failures are reported in the summary
//! rather than aborting the other harvests; the command exits non-zero if
//! any of them errored.

use std::time::Duration;

use socdb_core::{
    AppConfig, CheckpointStore, CollectionType, EndpointConfig, HarvestCheckpoint, HarvestKey,
    PersistenceSink, ProfileRecord, TargetConfig,
};
use socdb_db::PgStore;
use socdb_harvest::{
    CursorSource, HarvestError, HarvestHandle, HarvestOptions, HarvestState, HarvestStatus,
    HarvestTarget, Harvester, HttpCursorEndpoint, MemoryStore,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct HarvestArgs {
    pub target: Option<String>,
    pub collection: Option<CollectionType>,
    pub force: bool,
    pub skip_known: bool,
    pub dry_run: bool,
}

/// One (target, collection) harvest to run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Job {
    pub target_id: String,
    pub platform: String,
    pub collection: CollectionType,
    pub endpoint: EndpointConfig,
    pub profile: Option<ProfileRecord>,
}

#[derive(Debug)]
struct Outcome {
    key: HarvestKey,
    result: Result<HarvestState, HarvestError>,
    status: HarvestStatus,
}

/// Expands the targets file into jobs, applying the CLI filters.
///
/// A named target that does not exist, or that does not list the requested
/// collection, is an error. Targets without an endpoint are skipped with a
/// warning.
pub(crate) fn select_jobs(
    targets: &[TargetConfig],
    target_filter: Option<&str>,
    collection_filter: Option<CollectionType>,
) -> anyhow::Result<Vec<Job>> {
    let selected: Vec<&TargetConfig> = match target_filter {
        Some(id) => {
            let target = targets
                .iter()
                .find(|t| t.id == id)
                .ok_or_else(|| anyhow::anyhow!("target '{id}' not found in targets file"))?;
            if let Some(collection) = collection_filter {
                if !target.collections.contains(&collection) {
                    anyhow::bail!("target '{id}' does not list the {collection} collection");
                }
            }
            vec![target]
        }
        None => targets.iter().collect(),
    };

    let mut jobs = Vec::new();
    for target in selected {
        let Some(endpoint) = &target.endpoint else {
            tracing::warn!(target_id = %target.id, "skipping target: no endpoint configured");
            continue;
        };
        for &collection in &target.collections {
            if collection_filter.is_some_and(|c| c != collection) {
                continue;
            }
            jobs.push(Job {
                target_id: target.id.clone(),
                platform: target.platform.clone(),
                collection,
                endpoint: endpoint.clone(),
                profile: owning_profile(target, collection),
            });
        }
    }
    Ok(jobs)
}

/// Display fields for the profile a posts or followers harvest hangs off.
fn owning_profile(target: &TargetConfig, collection: CollectionType) -> Option<ProfileRecord> {
    if collection == CollectionType::Comments {
        return None;
    }
    Some(ProfileRecord {
        display_name: target.display_name.clone(),
        profile_url: target.profile_url.clone(),
        ..ProfileRecord::bare(target.id.clone(), target.platform.clone())
    })
}

/// Runs every selected harvest to a terminal state and prints a summary.
///
/// # Errors
///
/// Returns an error if the targets file or filters are invalid, the HTTP
/// client or database pool cannot be built, or any harvest ended errored.
pub(crate) async fn run_harvest(config: &AppConfig, args: &HarvestArgs) -> anyhow::Result<()> {
    let targets = socdb_core::load_targets(&config.targets_path)?;
    let jobs = select_jobs(&targets.targets, args.target.as_deref(), args.collection)?;
    if jobs.is_empty() {
        println!("no harvestable targets found; nothing to do");
        return Ok(());
    }

    let client = build_client(config)?;
    let outcomes = if args.dry_run {
        let harvester = Harvester::new(MemoryStore::new(), config.harvest_max_concurrent_targets);
        let outcomes = run_jobs(&harvester, &client, config, &jobs, args).await;
        let counts = harvester.store().counts();
        println!(
            "dry-run: would store {} profile(s), {} post(s), {} comment(s), {} follower(s)",
            counts.profiles, counts.posts, counts.comments, counts.followers
        );
        outcomes
    } else {
        let pool = crate::connect(config).await?;
        let harvester = Harvester::new(PgStore::new(pool), config.harvest_max_concurrent_targets);
        run_jobs(&harvester, &client, config, &jobs, args).await
    };

    for outcome in &outcomes {
        print_outcome(outcome);
    }

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} harvest(s) failed", outcomes.len());
    }
    Ok(())
}

fn build_client(config: &AppConfig) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.harvest_request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(config.harvest_user_agent.as_str())
        .build()?;
    Ok(client)
}

async fn run_jobs<S>(
    harvester: &Harvester<S>,
    client: &reqwest::Client,
    config: &AppConfig,
    jobs: &[Job],
    args: &HarvestArgs,
) -> Vec<Outcome>
where
    S: PersistenceSink + CheckpointStore + 'static,
{
    let mut handles = Vec::with_capacity(jobs.len());
    for job in jobs {
        let endpoint = HttpCursorEndpoint::with_client(
            client.clone(),
            &job.endpoint,
            &job.target_id,
            job.collection,
        );
        let target =
            HarvestTarget::new(job.target_id.clone(), job.platform.clone(), job.collection);

        let mut options = HarvestOptions::from_app_config(config);
        options.force_restart = args.force;
        options.refresh_known = !args.skip_known;
        options.profile = job.profile.clone();

        match harvester.start(target, CursorSource::new(endpoint), options) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::warn!(
                    target_id = %job.target_id,
                    collection = %job.collection,
                    error = %e,
                    "harvest not started"
                );
            }
        }
    }

    let tokens: Vec<_> = handles
        .iter()
        .map(HarvestHandle::cancellation_token)
        .collect();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling harvests");
            for token in &tokens {
                token.cancel();
            }
        }
    });

    let outcomes = futures::future::join_all(handles.into_iter().map(wait_for)).await;
    interrupt.abort();
    outcomes
}

async fn wait_for(handle: HarvestHandle) -> Outcome {
    let key = handle.key().clone();
    let status = handle.subscribe();
    let result = handle.wait().await;
    let status = status.borrow().clone();
    Outcome {
        key,
        result,
        status,
    }
}

fn print_outcome(outcome: &Outcome) {
    let s = &outcome.status;
    match &outcome.result {
        Ok(state) => println!(
            "{}: {state} (accepted {}, rejected {}, duplicates {}, iterations {})",
            outcome.key, s.items_accepted, s.items_rejected, s.duplicate_occurrences, s.iterations
        ),
        Err(e) => println!(
            "{}: errored after {} accepted: {e}",
            outcome.key, s.items_accepted
        ),
    }
}

/// Prints stored checkpoints, most recently updated first.
///
/// # Errors
///
/// Returns an error if the database is unreachable or a row is unreadable.
pub(crate) async fn run_status(
    config: &AppConfig,
    collection: Option<CollectionType>,
    json: bool,
) -> anyhow::Result<()> {
    let pool = crate::connect(config).await?;
    let checkpoints: Vec<HarvestCheckpoint> = socdb_db::list_checkpoints(&pool)
        .await?
        .into_iter()
        .filter(|c| collection.map_or(true, |wanted| c.collection == wanted))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!("no checkpoints stored");
        return Ok(());
    }
    for c in &checkpoints {
        println!("{}", format_checkpoint(c));
    }
    Ok(())
}

pub(crate) fn format_checkpoint(c: &HarvestCheckpoint) -> String {
    format!(
        "{}/{}  {}  accepted={}  streak={}  token={}  updated={}",
        c.target_id,
        c.collection,
        c.status,
        c.accepted_count,
        c.no_progress_streak,
        c.continuation_token.as_deref().unwrap_or("-"),
        c.updated_at.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Deletes one checkpoint so the next harvest starts from the beginning.
///
/// # Errors
///
/// Returns an error if the database is unreachable.
pub(crate) async fn run_reset(
    config: &AppConfig,
    target: &str,
    collection: CollectionType,
) -> anyhow::Result<()> {
    let pool = crate::connect(config).await?;
    let key = HarvestKey::new(target, collection);
    if socdb_db::reset_checkpoint(&pool, &key).await? {
        println!("{key}: checkpoint removed");
    } else {
        println!("{key}: no checkpoint stored");
    }
    Ok(())
}
