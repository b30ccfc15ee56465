use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CollectionType;
use crate::ConfigError;

/// JSON pointers (RFC 6901) into one item of a cursor endpoint response.
///
/// Every field is optional; unmapped fields are simply never observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub display_name: Option<String>,
    pub text: Option<String>,
    pub parent_id: Option<String>,
    pub published_at: Option<String>,
    pub thumbnail_url: Option<String>,
    pub likes: Option<String>,
    pub comments: Option<String>,
    pub shares: Option<String>,
    pub views: Option<String>,
}

/// A cursor-paginated JSON endpoint.
///
/// `url` may contain `{target}` and `{collection}` placeholders.
///
/// A comments endpoint may carry a `replies` endpoint for the reply thread
/// under each top-level comment. Its `url` and `query` values may also use
/// `{parent}`, filled with the parent comment's external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub items_pointer: String,
    pub cursor_pointer: Option<String>,
    pub has_more_pointer: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub replies: Option<Box<EndpointConfig>>,
}

fn default_cursor_param() -> String {
    "cursor".to_owned()
}

impl EndpointConfig {
    /// The endpoint URL with placeholders filled in.
    #[must_use]
    pub fn url_for(&self, target_id: &str, collection: CollectionType) -> String {
        self.url
            .replace("{target}", target_id)
            .replace("{collection}", collection.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Profile external id, or for comment harvests the post id or URL.
    pub id: String,
    pub platform: String,
    pub collections: Vec<CollectionType>,
    pub display_name: Option<String>,
    pub profile_url: Option<String>,
    pub endpoint: Option<EndpointConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TargetsFile {
    pub targets: Vec<TargetConfig>,
}

/// Load and validate the harvest targets from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
pub fn load_targets(path: &Path) -> Result<TargetsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::TargetsFileIo {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_targets(&content)
}

/// Parse and validate targets YAML already in memory.
///
/// # Errors
///
/// Returns `ConfigError` if the YAML is malformed or fails validation.
pub fn parse_targets(content: &str) -> Result<TargetsFile, ConfigError> {
    let targets_file: TargetsFile =
        serde_yaml::from_str(content).map_err(ConfigError::TargetsFileParse)?;

    validate_targets(&targets_file)?;

    Ok(targets_file)
}

fn validate_targets(targets_file: &TargetsFile) -> Result<(), ConfigError> {
    let mut seen_ids = HashSet::new();

    for target in &targets_file.targets {
        if target.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "target id must be non-empty".to_string(),
            ));
        }

        if target.platform.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "target '{}' has an empty platform",
                target.id
            )));
        }

        if target.collections.is_empty() {
            return Err(ConfigError::Validation(format!(
                "target '{}' lists no collections",
                target.id
            )));
        }

        // Comment harvests are addressed by post, profile collections by profile.
        if target.collections.contains(&CollectionType::Comments) && target.collections.len() > 1
        {
            return Err(ConfigError::Validation(format!(
                "target '{}' mixes comments with profile collections; \
                 a comments target is addressed by post",
                target.id
            )));
        }

        if !seen_ids.insert((target.platform.to_lowercase(), target.id.clone())) {
            return Err(ConfigError::Validation(format!(
                "duplicate target: '{}' on {}",
                target.id, target.platform
            )));
        }

        if let Some(endpoint) = &target.endpoint {
            validate_endpoint(&target.id, endpoint)?;

            if let Some(replies) = &endpoint.replies {
                if !target.collections.contains(&CollectionType::Comments) {
                    return Err(ConfigError::Validation(format!(
                        "target '{}': only a comments endpoint can have replies",
                        target.id
                    )));
                }
                if replies.replies.is_some() {
                    return Err(ConfigError::Validation(format!(
                        "target '{}': a replies endpoint cannot nest another",
                        target.id
                    )));
                }
                validate_endpoint(&target.id, replies)?;
            }
        }
    }

    Ok(())
}

fn validate_endpoint(target_id: &str, endpoint: &EndpointConfig) -> Result<(), ConfigError> {
    if endpoint.url.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "target '{target_id}' has an endpoint with an empty url"
        )));
    }
    if !endpoint.items_pointer.is_empty() && !endpoint.items_pointer.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "target '{target_id}': items_pointer must be a JSON pointer starting with '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "targets_test.rs"]
mod tests;
