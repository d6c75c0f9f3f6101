//! Error taxonomy for event store client operations.
//!
//! All failures surface as variants of [`ClientError`]. The variants map
//! one-to-one onto the failure modes of the wire protocol: transport-level
//! failures, caller-initiated cancellation, JSON (de)serialization problems,
//! illegal option combinations, and the three HTTP status classes. A write
//! rejected by a precondition arrives as an HTTP 409 and is recognized via
//! [`ClientError::is_conflict`].

/// Result type for all client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Error type covering every failure mode of the event store client.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ClientError {
    /// Connection failures, DNS failures, timeouts, protocol framing
    /// problems, and unexpected termination of an observe stream.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The caller cancelled the operation through its cancellation token.
    #[error("Operation interrupted")]
    Interrupted,

    /// JSON parse or type-conversion failure.
    #[error("Marshalling error: {message}")]
    Marshalling { message: String },

    /// Illegal option combinations, e.g. conflicting bounds or options that
    /// are not valid for observe.
    #[error("Invalid usage: {message}")]
    InvalidUsage { message: String },

    /// The server answered with a 4xx status. Status 409 signals a
    /// precondition conflict on write.
    #[error("HTTP client error {status}: {body}")]
    HttpClientError { status: u16, body: String },

    /// The server answered with a 5xx status.
    #[error("HTTP server error {status}: {body}")]
    HttpServerError { status: u16, body: String },

    /// The server answered with a non-200 status outside the 4xx/5xx
    /// classes.
    #[error("Unexpected HTTP status {status}: {body}")]
    HttpUnexpectedStatus { status: u16, body: String },
}

impl ClientError {
    /// Map a non-200 response onto the matching error variant, attaching
    /// the body text as diagnostic.
    pub(crate) fn from_status(status: u16, body: String) -> Self {
        match status {
            400..=499 => ClientError::HttpClientError { status, body },
            500..=599 => ClientError::HttpServerError { status, body },
            _ => ClientError::HttpUnexpectedStatus { status, body },
        }
    }

    /// Whether this error is a precondition conflict reported by the store
    /// at write time.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::HttpClientError { status: 409, .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        ClientError::Transport {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        ClientError::Marshalling {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_409_is_conflict() {
        let err = ClientError::from_status(409, "precondition failed".to_string());
        assert!(err.is_conflict());
        assert!(matches!(err, ClientError::HttpClientError { status: 409, .. }));
    }

    #[test]
    fn status_classes_map_to_distinct_variants() {
        assert!(matches!(
            ClientError::from_status(404, String::new()),
            ClientError::HttpClientError { .. }
        ));
        assert!(matches!(
            ClientError::from_status(503, String::new()),
            ClientError::HttpServerError { .. }
        ));
        assert!(matches!(
            ClientError::from_status(302, String::new()),
            ClientError::HttpUnexpectedStatus { .. }
        ));
    }
}
