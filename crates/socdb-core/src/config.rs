use crate::app_config::{AppConfig, Environment};
use crate::ConfigError;

/// Load application configuration from environment variables.
///
/// Calls `dotenvy::dotenv().ok()` to load `.env` files before reading env vars.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_app_config_from_env()
}

/// Load application configuration from environment variables already in the process.
///
/// Unlike [`load_app_config`], this does NOT load `.env` files; useful for testing
/// or when the caller manages env setup.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Build application configuration using the provided env-var lookup function.
///
/// Parsing and validation live here, decoupled from the process environment,
/// so tests can drive it with a plain `HashMap` lookup.
fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    use std::path::PathBuf;

    let require = |var: &str| -> Result<String, ConfigError> {
        lookup(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
    };

    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    let parse_u32 = |var: &str, default: &str| -> Result<u32, ConfigError> {
        let raw = or_default(var, default);
        raw.parse::<u32>().map_err(|e| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: e.to_string(),
        })
    };

    let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
        let raw = or_default(var, default);
        raw.parse::<u64>().map_err(|e| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: e.to_string(),
        })
    };

    let parse_usize = |var: &str, default: &str| -> Result<usize, ConfigError> {
        let raw = or_default(var, default);
        raw.parse::<usize>()
            .map_err(|e| ConfigError::InvalidEnvVar {
                var: var.to_string(),
                reason: e.to_string(),
            })
    };

    let database_url = require("DATABASE_URL")?;

    let env = parse_environment(&or_default("SOCDB_ENV", "development"))?;
    let log_level = or_default("SOCDB_LOG_LEVEL", "info");
    let targets_path = PathBuf::from(or_default("SOCDB_TARGETS_PATH", "./config/targets.yaml"));

    let db_max_connections = parse_u32("SOCDB_DB_MAX_CONNECTIONS", "10")?;
    let db_min_connections = parse_u32("SOCDB_DB_MIN_CONNECTIONS", "1")?;
    let db_acquire_timeout_secs = parse_u64("SOCDB_DB_ACQUIRE_TIMEOUT_SECS", "10")?;

    let harvest_request_timeout_secs = parse_u64("SOCDB_HARVEST_REQUEST_TIMEOUT_SECS", "30")?;
    let harvest_user_agent = or_default(
        "SOCDB_HARVEST_USER_AGENT",
        "socdb/0.1 (content-harvester)",
    );
    let harvest_max_concurrent_targets =
        parse_usize("SOCDB_HARVEST_MAX_CONCURRENT_TARGETS", "1")?;
    let harvest_min_call_spacing_ms = parse_u64("SOCDB_HARVEST_MIN_CALL_SPACING_MS", "1000")?;
    let harvest_max_attempts = parse_u32("SOCDB_HARVEST_MAX_ATTEMPTS", "4")?;
    let harvest_backoff_base_ms = parse_u64("SOCDB_HARVEST_BACKOFF_BASE_MS", "1000")?;
    let harvest_sink_timeout_secs = parse_u64("SOCDB_HARVEST_SINK_TIMEOUT_SECS", "10")?;
    let harvest_max_items = parse_u64("SOCDB_HARVEST_MAX_ITEMS", "0")?;
    let harvest_max_iterations = parse_u32("SOCDB_HARVEST_MAX_ITERATIONS", "300")?;
    let harvest_stall_threshold = parse_u32("SOCDB_HARVEST_STALL_THRESHOLD", "20")?;
    let harvest_max_deferred_retries = parse_u32("SOCDB_HARVEST_MAX_DEFERRED_RETRIES", "3")?;

    if harvest_max_attempts == 0 {
        return Err(ConfigError::InvalidEnvVar {
            var: "SOCDB_HARVEST_MAX_ATTEMPTS".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    if harvest_stall_threshold == 0 {
        return Err(ConfigError::InvalidEnvVar {
            var: "SOCDB_HARVEST_STALL_THRESHOLD".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    Ok(AppConfig {
        database_url,
        env,
        log_level,
        targets_path,
        db_max_connections,
        db_min_connections,
        db_acquire_timeout_secs,
        harvest_request_timeout_secs,
        harvest_user_agent,
        harvest_max_concurrent_targets,
        harvest_min_call_spacing_ms,
        harvest_max_attempts,
        harvest_backoff_base_ms,
        harvest_sink_timeout_secs,
        harvest_max_items,
        harvest_max_iterations,
        harvest_stall_threshold,
        harvest_max_deferred_retries,
    })
}

/// Parse a string into an `Environment` variant.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEnvVar`] for anything other than
/// `development`, `test`, or `production`.
fn parse_environment(s: &str) -> Result<Environment, ConfigError> {
    match s {
        "development" => Ok(Environment::Development),
        "test" => Ok(Environment::Test),
        "production" => Ok(Environment::Production),
        other => Err(ConfigError::InvalidEnvVar {
            var: "SOCDB_ENV".to_string(),
            reason: format!("unknown environment '{other}'"),
        }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
