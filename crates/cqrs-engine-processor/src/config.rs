//! Configuration surface for event-handling groups.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

fn default_subject() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_partitions() -> u32 {
    1
}

/// What the group's observe request asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FetchSettings {
    pub subject: String,
    pub recursive: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            subject: default_subject(),
            recursive: true,
        }
    }
}

/// Who drives the processor's start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleController {
    /// Start and stop with the owning component.
    #[default]
    ApplicationContext,
    /// Only the elected leader of a fleet runs the group.
    LeaderElection,
    /// Started and stopped through an externally registered controller.
    ControllerRegistration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LifecycleSettings {
    #[serde(rename = "auto-start")]
    pub auto_start: bool,
    pub controller: LifecycleController,
    /// Name of the lock registry used under leader election.
    pub lock_registry: Option<String>,
    /// Name of the controller registration, when applicable.
    pub controller_registration: Option<String>,
    pub partitions: u32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            auto_start: default_true(),
            controller: LifecycleController::default(),
            lock_registry: None,
            controller_registration: None,
            partitions: default_partitions(),
        }
    }
}

/// Where checkpoints are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressTracking {
    #[default]
    InMemory,
    Jdbc,
    /// An externally provided tracker, referenced by name.
    TrackerRef(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProgressSettings {
    pub tracking: ProgressTracking,
}

/// How events map to sequence keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SequenceResolution {
    #[default]
    NoSequence,
    PerSubject,
    PerConfigurableLevel {
        levels: usize,
    },
    /// An externally provided resolver, referenced by name.
    ResolverRef(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct SequenceSettings {
    pub resolution: SequenceResolution,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetrySettings {
    pub policy: RetryPolicy,
}

/// Per-group configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventProcessingConfig {
    pub fetch: FetchSettings,
    #[serde(rename = "life-cycle")]
    pub life_cycle: LifecycleSettings,
    pub progress: ProgressSettings,
    pub sequence: SequenceSettings,
    pub retry: RetrySettings,
}

impl EventProcessingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.life_cycle.partitions == 0 {
            return Err("life-cycle.partitions must be positive".to_string());
        }
        if self.fetch.subject.is_empty() || !self.fetch.subject.starts_with('/') {
            return Err("fetch.subject must be an absolute slash-path".to_string());
        }
        if let SequenceResolution::PerConfigurableLevel { levels } = self.sequence.resolution {
            if levels == 0 {
                return Err("sequence.resolution levels must be positive".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = EventProcessingConfig::default();
        assert_eq!(config.fetch.subject, "/");
        assert!(config.fetch.recursive);
        assert!(config.life_cycle.auto_start);
        assert_eq!(config.life_cycle.partitions, 1);
        assert_eq!(config.progress.tracking, ProgressTracking::InMemory);
        assert_eq!(config.sequence.resolution, SequenceResolution::NoSequence);
        assert_eq!(config.retry.policy, RetryPolicy::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn kebab_case_surface_deserializes() {
        let config: EventProcessingConfig = serde_json::from_value(serde_json::json!({
            "fetch": {"subject": "/books", "recursive": false},
            "life-cycle": {"auto-start": false, "controller": "leader-election",
                            "lock-registry": "default", "partitions": 2},
            "progress": {"tracking": "jdbc"},
            "sequence": {"resolution": {"per-configurable-level": {"levels": 2}}},
            "retry": {"policy": {"fixed": {"interval-seconds": 1}}}
        }))
        .unwrap();
        assert_eq!(config.fetch.subject, "/books");
        assert!(!config.fetch.recursive);
        assert_eq!(
            config.life_cycle.controller,
            LifecycleController::LeaderElection
        );
        assert_eq!(config.life_cycle.partitions, 2);
        assert_eq!(config.progress.tracking, ProgressTracking::Jdbc);
        assert_eq!(
            config.sequence.resolution,
            SequenceResolution::PerConfigurableLevel { levels: 2 }
        );
        assert!(config.validate().is_ok());
    }
}
