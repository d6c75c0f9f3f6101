//! Streaming HTTP client for EventSourcingDB-compatible append-only event
//! stores.
//!
//! The client speaks the store's JSON-over-HTTP protocol: ping, API-token
//! verification, health, atomic precondition-checked writes, finite reads,
//! infinite observation, and streamed EventQL queries. Read, observe, and
//! query responses are newline-delimited `{type, payload}` frames decoded
//! into typed items.
//!
//! Consumers that only need the store contract (the command router and the
//! event-handling processors) depend on the [`EventStore`] trait rather
//! than on the HTTP implementation.

pub mod client;
pub mod error;
pub mod event;
pub mod health;
pub mod options;
pub mod precondition;
mod stream;

pub use client::{
    ClientConfig, EventStore, EventStoreClient, EventStream, RowStream, API_TOKEN_VERIFIED,
    PING_RECEIVED,
};
pub use error::{ClientError, ClientResult};
pub use event::{compare_event_ids, Event, EventCandidate};
pub use health::{Health, HealthStatus};
pub use options::{IfEventIsMissing, Order, ReadOption, ReadOptions};
pub use precondition::Precondition;
