//! Health reporting as exposed by the store's health endpoint.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Overall health verdict. `pass` and `warn` both count as up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        !matches!(self, HealthStatus::Fail)
    }
}

/// Health report: a status plus arbitrary per-check details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    #[serde(default)]
    pub checks: HashMap<String, serde_json::Value>,
}
