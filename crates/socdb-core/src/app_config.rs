use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub env: Environment,
    pub log_level: String,
    pub targets_path: PathBuf,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub harvest_request_timeout_secs: u64,
    pub harvest_user_agent: String,
    pub harvest_max_concurrent_targets: usize,
    pub harvest_min_call_spacing_ms: u64,
    pub harvest_max_attempts: u32,
    pub harvest_backoff_base_ms: u64,
    pub harvest_sink_timeout_secs: u64,
    /// `0` means unbounded.
    pub harvest_max_items: u64,
    pub harvest_max_iterations: u32,
    pub harvest_stall_threshold: u32,
    pub harvest_max_deferred_retries: u32,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("log_level", &self.log_level)
            .field("targets_path", &self.targets_path)
            .field("database_url", &"[redacted]")
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field(
                "harvest_request_timeout_secs",
                &self.harvest_request_timeout_secs,
            )
            .field("harvest_user_agent", &self.harvest_user_agent)
            .field(
                "harvest_max_concurrent_targets",
                &self.harvest_max_concurrent_targets,
            )
            .field(
                "harvest_min_call_spacing_ms",
                &self.harvest_min_call_spacing_ms,
            )
            .field("harvest_max_attempts", &self.harvest_max_attempts)
            .field("harvest_backoff_base_ms", &self.harvest_backoff_base_ms)
            .field("harvest_sink_timeout_secs", &self.harvest_sink_timeout_secs)
            .field("harvest_max_items", &self.harvest_max_items)
            .field("harvest_max_iterations", &self.harvest_max_iterations)
            .field("harvest_stall_threshold", &self.harvest_stall_threshold)
            .field(
                "harvest_max_deferred_retries",
                &self.harvest_max_deferred_retries,
            )
            .finish()
    }
}
