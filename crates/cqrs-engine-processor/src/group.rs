//! Wiring of event-handling groups.
//!
//! A group owns a name, an event-type registry, handlers, and the per-group
//! configuration; building it yields one processor per partition plus the
//! lifecycle entry points.

use std::sync::Arc;

use cqrs_engine_client::EventStore;
use cqrs_engine_core::{
    EngineError, EngineResult, EventConverter, EventDataMarshaller, EventPayload,
    EventTypeResolver, EventUpcaster, EventUpcasters,
};

use crate::config::{EventProcessingConfig, ProgressTracking, SequenceResolution};
use crate::handler::{EventHandler, EventHandlerDefinition};
use crate::lifecycle::{
    start_leader_elected, start_processors, LockRegistry, ProcessorHandle,
    ELECTION_POLL_INTERVAL,
};
use crate::processor::EventProcessor;
use crate::progress::{InMemoryProgressTracker, ProgressTracker};
use crate::sequence::{
    EventSequenceResolver, NoEventSequenceResolver, PerLevelEventSequenceResolver,
    PerSubjectEventSequenceResolver,
};

/// A named, partitioned event-handling group.
pub struct EventProcessingGroup {
    name: String,
    processors: Vec<Arc<EventProcessor>>,
}

impl EventProcessingGroup {
    pub fn builder(name: impl Into<String>, store: Arc<dyn EventStore>) -> EventProcessingGroupBuilder {
        EventProcessingGroupBuilder::new(name, store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition processors, one per partition `0..N`.
    pub fn processors(&self) -> &[Arc<EventProcessor>] {
        &self.processors
    }

    /// Start all partitions under the plain lifecycle.
    pub fn start(&self) -> ProcessorHandle {
        start_processors(self.processors.clone())
    }

    /// Start under leader election: the partitions run only while this
    /// process holds the group lock.
    pub fn start_leader_elected(&self, registry: Arc<dyn LockRegistry>) -> ProcessorHandle {
        start_leader_elected(
            self.name.clone(),
            registry,
            self.processors.clone(),
            ELECTION_POLL_INTERVAL,
        )
    }
}

/// Builder for [`EventProcessingGroup`].
pub struct EventProcessingGroupBuilder {
    name: String,
    store: Arc<dyn EventStore>,
    resolver: EventTypeResolver,
    upcasters: Vec<EventUpcaster>,
    handlers: Vec<EventHandlerDefinition>,
    config: EventProcessingConfig,
    tracker: Option<Arc<dyn ProgressTracker>>,
    sequence_resolver: Option<Arc<dyn EventSequenceResolver>>,
    errors: Vec<EngineError>,
}

impl EventProcessingGroupBuilder {
    pub fn new(name: impl Into<String>, store: Arc<dyn EventStore>) -> Self {
        Self {
            name: name.into(),
            store,
            resolver: EventTypeResolver::new(),
            upcasters: Vec::new(),
            handlers: Vec::new(),
            config: EventProcessingConfig::default(),
            tracker: None,
            sequence_resolver: None,
            errors: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EventProcessingConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an event payload type under its declared tag.
    pub fn register_event<T: EventPayload>(mut self) -> Self {
        if let Err(error) = self.resolver.register::<T>() {
            self.errors.push(error);
        }
        self
    }

    pub fn with_upcaster(mut self, upcaster: EventUpcaster) -> Self {
        self.upcasters.push(upcaster);
        self
    }

    /// Register an event handler; handlers for one event type run in
    /// registration order.
    pub fn on_event<E: EventPayload>(mut self, handler: EventHandler<E>) -> Self {
        self.handlers.push(EventHandlerDefinition::new(handler));
        self
    }

    /// Use an externally provided progress tracker (`tracker-ref`).
    pub fn with_progress_tracker(mut self, tracker: Arc<dyn ProgressTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Use an externally provided sequence resolver (`resolver-ref`).
    pub fn with_sequence_resolver(mut self, resolver: Arc<dyn EventSequenceResolver>) -> Self {
        self.sequence_resolver = Some(resolver);
        self
    }

    pub fn build(self) -> EngineResult<EventProcessingGroup> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        self.config
            .validate()
            .map_err(|message| EngineError::AmbiguousRegistration { message })?;

        let tracker: Arc<dyn ProgressTracker> = match (&self.config.progress.tracking, self.tracker)
        {
            (_, Some(tracker)) => tracker,
            (ProgressTracking::InMemory, None) => Arc::new(InMemoryProgressTracker::new()),
            (ProgressTracking::Jdbc, None) => {
                return Err(EngineError::AmbiguousRegistration {
                    message: format!(
                        "group '{}' configures jdbc progress tracking but no tracker was provided",
                        self.name
                    ),
                })
            }
            (ProgressTracking::TrackerRef(reference), None) => {
                return Err(EngineError::AmbiguousRegistration {
                    message: format!(
                        "group '{}' references tracker '{reference}' but none was provided",
                        self.name
                    ),
                })
            }
        };

        let sequence_resolver: Arc<dyn EventSequenceResolver> =
            match (&self.config.sequence.resolution, self.sequence_resolver) {
                (_, Some(resolver)) => resolver,
                (SequenceResolution::NoSequence, None) => Arc::new(NoEventSequenceResolver),
                (SequenceResolution::PerSubject, None) => {
                    Arc::new(PerSubjectEventSequenceResolver)
                }
                (SequenceResolution::PerConfigurableLevel { levels }, None) => {
                    Arc::new(PerLevelEventSequenceResolver::new(*levels))
                }
                (SequenceResolution::ResolverRef(reference), None) => {
                    return Err(EngineError::AmbiguousRegistration {
                        message: format!(
                            "group '{}' references resolver '{reference}' but none was provided",
                            self.name
                        ),
                    })
                }
            };

        let converter = Arc::new(EventConverter::new(
            Arc::new(self.resolver),
            EventDataMarshaller,
            Arc::new(EventUpcasters::new(self.upcasters)),
        ));
        let handlers = Arc::new(self.handlers);
        let partitions = self.config.life_cycle.partitions;
        let processors = (0..partitions)
            .map(|partition| {
                Arc::new(EventProcessor::new(
                    self.name.clone(),
                    partition,
                    partitions,
                    self.config.fetch.subject.clone(),
                    self.config.fetch.recursive,
                    Arc::clone(&self.store),
                    Arc::clone(&converter),
                    Arc::clone(&handlers),
                    Arc::clone(&tracker),
                    Arc::clone(&sequence_resolver),
                    self.config.retry.policy.clone(),
                ))
            })
            .collect();

        Ok(EventProcessingGroup {
            name: self.name,
            processors,
        })
    }
}
