use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },

    #[error("failed to read targets file {path}: {source}")]
    TargetsFileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse targets file: {0}")]
    TargetsFileParse(#[from] serde_yaml::Error),

    #[error("targets validation failed: {0}")]
    Validation(String),
}

/// Errors surfaced by a [`crate::PersistenceSink`] or [`crate::CheckpointStore`].
///
/// Same-key write races are resolved inside the store and never show up here.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The owning row (profile, post, or parent comment) is not stored yet.
    /// Item-level: the caller may defer and retry the write.
    #[error("referential gap: {parent} does not exist yet")]
    ReferentialGap { parent: String },

    /// The write did not complete within its deadline.
    #[error("sink write timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The store is temporarily unreachable (pool exhausted, connection reset).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other storage failure. Not retried.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SinkError {
    /// Returns `true` for failures worth retrying after a back-off delay.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Timeout { .. } | SinkError::Unavailable(_))
    }
}
