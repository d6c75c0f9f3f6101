//! Command routing, state rebuilding, and event publication over an
//! append-only event store.
//!
//! The runtime accepts declarative handler registrations and, per command:
//! sources the subject's event history, rebuilds the write-model instance
//! through state-rebuilding handlers, invokes the command handler against
//! an event capturer, and atomically appends the captured events under
//! optimistic preconditions. Rebuilt state is cached per subject with a
//! monotonic, LRU-evicted cache so repeated commands only read the tail of
//! the history.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use cqrs_engine_core::*;
//! # use cqrs_engine_client::{ClientConfig, EventStoreClient};
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct BookPurchased;
//! # impl EventPayload for BookPurchased {
//! #     fn event_type() -> &'static str { "com.example.library.book-purchased" }
//! # }
//! # #[derive(Clone)]
//! # struct Book;
//! # struct PurchaseBook { id: u32 }
//! # impl Command for PurchaseBook {
//! #     type Result = ();
//! #     fn subject(&self) -> String { format!("/books/{}", self.id) }
//! #     fn subject_condition(&self) -> SubjectCondition { SubjectCondition::Pristine }
//! # }
//! # async fn wire() -> EngineResult<()> {
//! let store = Arc::new(EventStoreClient::new(ClientConfig::from_env()?)?);
//! let router = CommandRouter::builder(store)
//!     .register_event::<BookPurchased>()
//!     .on_event(StateRebuildingHandler::<Book, BookPurchased>::FromEvent(
//!         Box::new(|_, _| Book),
//!     ))
//!     .on_command(
//!         SourcingMode::Recursive,
//!         CommandHandler::<Book, PurchaseBook>::WithPublisher(Box::new(|_, publisher| {
//!             publisher.publish(BookPurchased)?;
//!             Ok(())
//!         })),
//!     )
//!     .build()?;
//! router.send(PurchaseBook { id: 42 }, Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod capturer;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod marshalling;
pub mod metadata;
pub mod publisher;
pub mod reader;
pub mod resolver;
pub mod router;
pub mod testing;
pub mod upcaster;

pub use cache::{
    fetch_and_merge, CacheKey, CacheValue, InMemoryStateCache, NoopStateCache,
    StateRebuildingCache,
};
pub use capturer::{CaptureOptions, CapturedEvent, CommandEventCapturer};
pub use command::{Command, SourcingMode, SubjectCondition};
pub use config::{CacheSettings, CacheType, CommandRoutingConfig, PropagationSettings};
pub use error::{EngineError, EngineResult};
pub use handler::{
    CommandHandler, CommandHandlerDefinition, StateRebuildingHandler,
    StateRebuildingHandlerDefinition,
};
pub use marshalling::EventDataMarshaller;
pub use metadata::{MetaData, MetadataPropagation, PropagationMode};
pub use publisher::ImmediatePublisher;
pub use reader::{EventConverter, EventReader, SourcedEvent, SourcedEventStream};
pub use resolver::{ErasedPayload, EventPayload, EventTypeResolver};
pub use router::{CommandRouter, CommandRouterBuilder};
pub use upcaster::{EventUpcaster, EventUpcasters, UpcastedEvent};
