//! Command contract and sourcing behavior.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Assertion about the command's subject, checked against the sourced
/// history before the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectCondition {
    /// No assertion.
    #[default]
    None,
    /// The subject must not yet carry any event. Events of recursive child
    /// subjects do not violate this.
    Pristine,
    /// The subject must already carry at least one event.
    Exists,
}

/// Whether and how history is read before the command handler is invoked.
///
/// Under `None` no events are read, which also means the subject condition
/// cannot observe the store: EXISTS fails and PRISTINE passes vacuously.
/// Commands combining `None` with a subject condition are the caller's
/// responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SourcingMode {
    None,
    Local,
    #[default]
    Recursive,
}

/// A routable command.
///
/// The subject is an absolute slash-path naming the aggregate the command
/// targets; the associated `Result` is what the command handler returns on
/// success.
pub trait Command: Send + Sync + 'static {
    type Result: Send + 'static;

    fn subject(&self) -> String;

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::None
    }
}

/// Validate that a subject is an absolute slash-path.
pub(crate) fn validate_subject(subject: &str) -> EngineResult<()> {
    if !subject.starts_with('/') {
        return Err(EngineError::InvalidSubject {
            message: format!("subject '{subject}' must start with '/'"),
        });
    }
    Ok(())
}
