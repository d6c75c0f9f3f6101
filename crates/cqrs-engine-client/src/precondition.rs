//! Optimistic-concurrency preconditions evaluated by the store at append
//! time.

use serde::{Deserialize, Serialize};

/// A precondition attached to a write request. Violation makes the store
/// reject the whole batch with HTTP 409.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Precondition {
    /// No event exists with exactly this subject. Events of recursive child
    /// subjects do not violate this.
    SubjectIsPristine { subject: String },
    /// The most recent event with exactly this subject has this id.
    SubjectIsOnEventId { subject: String, event_id: String },
}

impl Precondition {
    pub fn subject(&self) -> &str {
        match self {
            Precondition::SubjectIsPristine { subject }
            | Precondition::SubjectIsOnEventId { subject, .. } => subject,
        }
    }
}
