//! Configuration surface for command routing.

use serde::{Deserialize, Serialize};

use crate::metadata::PropagationMode;

/// Which cache implementation the router uses for rebuilt state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheType {
    None,
    #[default]
    InMemory,
}

/// State-rebuilding cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheSettings {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_type: CacheType::InMemory,
            capacity: 1000,
        }
    }
}

/// Metadata propagation settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct PropagationSettings {
    pub propagation_mode: PropagationMode,
    pub propagation_keys: Vec<String>,
}

/// Configuration for the command router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CommandRoutingConfig {
    /// CloudEvents source attached to every published event.
    pub source: String,
    pub cache: CacheSettings,
    pub metadata: PropagationSettings,
}

impl Default for CommandRoutingConfig {
    fn default() -> Self {
        Self {
            source: "tag://cqrs-engine".to_string(),
            cache: CacheSettings::default(),
            metadata: PropagationSettings::default(),
        }
    }
}

impl CommandRoutingConfig {
    /// Load settings from environment variables, falling back to the
    /// defaults: `COMMAND_EVENT_SOURCE`, `COMMAND_CACHE_TYPE`
    /// (`none`|`in-memory`), `COMMAND_CACHE_CAPACITY`,
    /// `COMMAND_METADATA_PROPAGATION_MODE`
    /// (`none`|`keep-if-present`|`overwrite`), and
    /// `COMMAND_METADATA_PROPAGATION_KEYS` (comma-separated).
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Ok(source) = std::env::var("COMMAND_EVENT_SOURCE") {
            config.source = source;
        }
        if let Ok(cache_type) = std::env::var("COMMAND_CACHE_TYPE") {
            config.cache.cache_type = match cache_type.as_str() {
                "none" => CacheType::None,
                "in-memory" => CacheType::InMemory,
                other => return Err(format!("unknown cache type '{other}'")),
            };
        }
        if let Ok(capacity) = std::env::var("COMMAND_CACHE_CAPACITY") {
            config.cache.capacity = capacity
                .parse()
                .map_err(|_| format!("invalid cache capacity '{capacity}'"))?;
        }
        if let Ok(mode) = std::env::var("COMMAND_METADATA_PROPAGATION_MODE") {
            config.metadata.propagation_mode = match mode.as_str() {
                "none" => PropagationMode::None,
                "keep-if-present" => PropagationMode::KeepIfPresent,
                "overwrite" => PropagationMode::Overwrite,
                other => return Err(format!("unknown propagation mode '{other}'")),
            };
        }
        if let Ok(keys) = std::env::var("COMMAND_METADATA_PROPAGATION_KEYS") {
            config.metadata.propagation_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cache.cache_type == CacheType::InMemory && self.cache.capacity == 0 {
            return Err("cache.capacity must be positive".to_string());
        }
        if self.source.is_empty() {
            return Err("source must not be empty".to_string());
        }
        Ok(())
    }
}
