//! Error types for command routing and state rebuilding.
//!
//! Client-side failures pass through as [`EngineError::Client`]; everything
//! else is a framework failure. Transient kinds may succeed on retry;
//! non-transient kinds indicate a wiring or domain-rule problem that a
//! retry cannot fix.

use cqrs_engine_client::ClientError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error type for command routing, state rebuilding, and event handling.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A failure reported by the event store client.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A PRISTINE subject condition was violated: an event with exactly the
    /// command's subject already exists. Non-transient.
    #[error("Subject already exists: {subject}")]
    SubjectAlreadyExists { subject: String },

    /// An EXISTS subject condition was violated: no event with exactly the
    /// command's subject was sourced. Transient.
    #[error("Subject does not exist: {subject}")]
    SubjectDoesNotExist { subject: String },

    /// No command handler is registered for the command type.
    #[error("No command handler registered for {command}")]
    MissingCommandHandler { command: String },

    /// Conflicting registrations for one command type or event type tag.
    #[error("Ambiguous registration: {message}")]
    AmbiguousRegistration { message: String },

    /// An event type tag could not be resolved to a registered type.
    #[error("Unknown event type: {tag}")]
    UnknownEventType { tag: String },

    /// A state-rebuilding handler failed to produce an instance for an
    /// event. Non-transient.
    #[error("State rebuilding failed for event type {event_type}: {message}")]
    StateRebuildingFailed { event_type: String, message: String },

    /// A malformed subject or relative-subject suffix.
    #[error("Invalid subject: {message}")]
    InvalidSubject { message: String },

    /// The command handler rejected the command on domain grounds.
    #[error("Command rejected: {message}")]
    CommandRejected { message: String },

    /// A temporary sourcing or resolution failure that may succeed on
    /// retry.
    #[error("Transient failure: {message}")]
    Transient { message: String },
}

impl EngineError {
    /// Whether a retry of the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::SubjectDoesNotExist { .. } | EngineError::Transient { .. } => true,
            EngineError::Client(client) => matches!(
                client,
                ClientError::Transport { .. } | ClientError::HttpServerError { .. }
            ),
            _ => false,
        }
    }

    /// Whether this is a write-time precondition conflict (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Client(client) if client.is_conflict())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Client(ClientError::Marshalling {
            message: error.to_string(),
        })
    }
}
