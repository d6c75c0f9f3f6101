//! Partitioned, checkpointed event-handling groups over an append-only
//! event store.
//!
//! A group observes a subject, shards its events across partitions by a
//! stable hash of each event's sequence key, and delivers them to
//! registered handlers: in source order per sequence key, concurrently
//! across keys, with per-(group, partition) checkpoints that only move
//! forward. Delivery is at-least-once. Groups run under a plain lifecycle
//! or behind leader election across a fleet.

pub mod config;
pub mod group;
pub mod handler;
pub mod lifecycle;
pub mod processor;
pub mod progress;
pub mod retry;
pub mod sequence;

pub use config::{
    EventProcessingConfig, FetchSettings, LifecycleController, LifecycleSettings,
    ProgressSettings, ProgressTracking, RetrySettings, SequenceResolution, SequenceSettings,
};
pub use group::{EventProcessingGroup, EventProcessingGroupBuilder};
pub use handler::{EventHandler, EventHandlerDefinition};
pub use lifecycle::{
    start_leader_elected, start_processors, InMemoryLockRegistry, LockGuard, LockRegistry,
    ProcessorHandle,
};
pub use processor::EventProcessor;
pub use progress::{InMemoryProgressTracker, ProgressTracker, RelationalProgressTracker};
pub use retry::RetryPolicy;
pub use sequence::{
    partition_for, EventSequenceResolver, NoEventSequenceResolver,
    PerLevelEventSequenceResolver, PerSubjectEventSequenceResolver,
};
