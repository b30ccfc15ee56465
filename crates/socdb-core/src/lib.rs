pub mod app_config;
pub mod checkpoint;
pub mod config;
pub mod counts;
pub mod error;
pub mod models;
pub mod targets;
pub mod traits;

pub use app_config::{AppConfig, Environment};
pub use checkpoint::{CheckpointStatus, CollectionType, HarvestCheckpoint, HarvestKey};
pub use config::{load_app_config, load_app_config_from_env};
pub use counts::parse_count;
pub use error::{ConfigError, SinkError};
pub use models::{
    CanonicalKey, CommentRecord, EngagementCounts, Entity, EntityRef, FollowerRecord, KeyKind,
    PostRecord, PostRef, ProfileRecord, UpsertOutcome,
};
pub use targets::{load_targets, parse_targets, EndpointConfig, FieldMap, TargetConfig, TargetsFile};
pub use traits::{CheckpointStore, PersistenceSink};
