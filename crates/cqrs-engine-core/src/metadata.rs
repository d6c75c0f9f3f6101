//! Command metadata and its propagation onto captured events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Free-form metadata attached to commands and events.
pub type MetaData = HashMap<String, serde_json::Value>;

/// How command metadata is attached to a captured event's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PropagationMode {
    /// Leave the captured event's metadata unchanged.
    #[default]
    None,
    /// Add a key only when the captured event does not already carry it.
    KeepIfPresent,
    /// Unconditionally add or replace.
    Overwrite,
}

/// Propagation policy: a mode plus the set of command-metadata keys that
/// are ever considered.
#[derive(Debug, Clone, Default)]
pub struct MetadataPropagation {
    pub mode: PropagationMode,
    pub keys: Vec<String>,
}

impl MetadataPropagation {
    pub fn new(mode: PropagationMode, keys: Vec<String>) -> Self {
        Self { mode, keys }
    }

    /// Apply the policy to one captured event's metadata. Only keys in the
    /// propagation set are considered.
    pub fn apply(&self, command_metadata: &MetaData, event_metadata: &mut MetaData) {
        if self.mode == PropagationMode::None {
            return;
        }
        for key in &self.keys {
            let Some(value) = command_metadata.get(key) else {
                continue;
            };
            match self.mode {
                PropagationMode::None => unreachable!(),
                PropagationMode::KeepIfPresent => {
                    event_metadata
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                PropagationMode::Overwrite => {
                    event_metadata.insert(key.clone(), value.clone());
                }
            }
        }
    }
}
