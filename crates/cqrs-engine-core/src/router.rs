//! The command-router pipeline.
//!
//! A command runs through six stages: handler lookup, sourcing through the
//! state cache, subject-condition enforcement, state rebuilding, handler
//! invocation against the event capturer, and atomic publication of the
//! captured events under synthesized preconditions. Any failure aborts the
//! pipeline before anything reaches the store.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use cqrs_engine_client::{EventStore, Precondition, ReadOption, ReadOptions};

use crate::cache::{
    fetch_and_merge, CacheKey, CacheValue, InMemoryStateCache, NoopStateCache,
    StateRebuildingCache,
};
use crate::capturer::CapturedEvent;
use crate::command::{validate_subject, Command, SourcingMode, SubjectCondition};
use crate::config::{CacheType, CommandRoutingConfig};
use crate::error::{EngineError, EngineResult};
use crate::handler::{
    CommandHandler, CommandHandlerDefinition, ErasedInstance, StateRebuildingHandler,
    StateRebuildingHandlerDefinition,
};
use crate::marshalling::EventDataMarshaller;
use crate::metadata::{MetaData, MetadataPropagation};
use crate::publisher::ImmediatePublisher;
use crate::reader::EventReader;
use crate::resolver::{EventPayload, EventTypeResolver};
use crate::upcaster::{EventUpcaster, EventUpcasters};

struct CommandEntry {
    definition: CommandHandlerDefinition,
    /// State-rebuilding handlers for this command's instance type, in
    /// registration order.
    rebuilders: Arc<Vec<Arc<StateRebuildingHandlerDefinition>>>,
}

/// Routes commands to their registered handlers.
pub struct CommandRouter {
    reader: EventReader,
    publisher: ImmediatePublisher,
    cache: Arc<dyn StateRebuildingCache>,
    commands: HashMap<TypeId, CommandEntry>,
    propagation: MetadataPropagation,
}

impl CommandRouter {
    pub fn builder(store: Arc<dyn EventStore>) -> CommandRouterBuilder {
        CommandRouterBuilder::new(store)
    }

    /// Execute a command and return its handler's result.
    ///
    /// On success the events captured by the handler have been appended to
    /// the store atomically, in capture order, under the synthesized and
    /// user-supplied preconditions. On failure nothing has been written;
    /// the cache keeps whatever the sourcing merge produced, which is
    /// consistent with the store.
    pub async fn send<C: Command>(
        &self,
        command: C,
        metadata: MetaData,
    ) -> EngineResult<C::Result> {
        let entry = self.commands.get(&TypeId::of::<C>()).ok_or_else(|| {
            EngineError::MissingCommandHandler {
                command: std::any::type_name::<C>().to_string(),
            }
        })?;
        let subject = command.subject();
        validate_subject(&subject)?;
        let condition = command.subject_condition();

        let key = CacheKey {
            subject: subject.clone(),
            instance_type: entry.definition.instance_type(),
            sourcing_mode: entry.definition.sourcing_mode(),
        };
        let merged = fetch_and_merge(self.cache.as_ref(), key, |current| {
            self.source_subject(entry, &subject, condition, current)
        })
        .await?;

        tracing::debug!(
            command = entry.definition.command_name(),
            subject = %subject,
            sourced_event_id = merged.event_id.as_deref().unwrap_or("<none>"),
            "invoking command handler"
        );
        let instance: Option<ErasedInstance> = merged
            .instance
            .as_ref()
            .map(|arc| entry.definition.clone_instance(arc.as_ref()));
        let outcome = entry
            .definition
            .invoke(&command, instance, &metadata, &subject, &entry.rebuilders)?;

        if !outcome.captured.is_empty() {
            let mut captured = outcome.captured;
            for event in &mut captured {
                self.propagation.apply(&metadata, &mut event.metadata);
            }
            let preconditions =
                synthesize_preconditions(&subject, &captured, &merged.sourced_subject_ids);
            self.publisher.publish(&captured, preconditions).await?;
        }

        outcome
            .result
            .downcast::<C::Result>()
            .map(|result| *result)
            .map_err(|_| EngineError::MissingCommandHandler {
                command: std::any::type_name::<C>().to_string(),
            })
    }

    /// The sourcing merge: read the history since the cached event id,
    /// enforce the subject condition, and fold the events through the
    /// relevant state-rebuilding handlers.
    async fn source_subject(
        &self,
        entry: &CommandEntry,
        subject: &str,
        condition: SubjectCondition,
        current: CacheValue,
    ) -> EngineResult<CacheValue> {
        let mode = entry.definition.sourcing_mode();
        let mut latest = current.event_id.clone();
        let mut sourced_subject_ids = current.sourced_subject_ids.clone();
        let mut raw_events = Vec::new();

        if mode != SourcingMode::None {
            let mut options = ReadOptions::new();
            if mode == SourcingMode::Recursive {
                options = options.recursive();
            }
            if let Some(event_id) = &current.event_id {
                options.push(ReadOption::LowerBoundExclusive(event_id.clone()));
            }
            let mut stream = self
                .reader
                .read_raw(subject, options, CancellationToken::new())
                .await?;
            while let Some(item) = stream.next().await {
                let event = item.map_err(EngineError::from)?;
                latest = Some(event.id.clone());
                sourced_subject_ids.insert(event.subject.clone(), event.id.clone());
                raw_events.push(event);
            }
        }

        // Conditions observe only what was sourced; under SourcingMode::None
        // nothing is read and the check is vacuous.
        match condition {
            SubjectCondition::None => {}
            SubjectCondition::Exists => {
                if !sourced_subject_ids.contains_key(subject) {
                    return Err(EngineError::SubjectDoesNotExist {
                        subject: subject.to_string(),
                    });
                }
            }
            SubjectCondition::Pristine => {
                if sourced_subject_ids.contains_key(subject) {
                    return Err(EngineError::SubjectAlreadyExists {
                        subject: subject.to_string(),
                    });
                }
            }
        }

        let mut instance: Option<ErasedInstance> = current
            .instance
            .as_ref()
            .map(|arc| entry.definition.clone_instance(arc.as_ref()));
        if !entry.rebuilders.is_empty() {
            for raw in &raw_events {
                for sourced in self.reader.converter().convert(raw)? {
                    let payload_type = sourced.payload.as_ref().type_id();
                    for definition in entry.rebuilders.iter() {
                        if definition.event_type() == payload_type {
                            let next = definition.apply(
                                instance.take(),
                                sourced.payload.as_ref(),
                                &sourced.metadata,
                                &sourced.raw.subject,
                                Some(&sourced.raw),
                            )?;
                            instance = Some(next);
                        }
                    }
                }
            }
        }

        Ok(CacheValue {
            event_id: latest,
            instance: instance.map(|boxed| boxed.into()),
            sourced_subject_ids,
        })
    }
}

/// Compose the write preconditions for a command's captured events:
/// pristine assertions for captured subjects below the command subject
/// that were not sourced, an event-id assertion per sourced subject, and
/// the user-supplied preconditions in capture order.
fn synthesize_preconditions(
    command_subject: &str,
    captured: &[CapturedEvent],
    sourced_subject_ids: &HashMap<String, String>,
) -> Vec<Precondition> {
    let mut preconditions = Vec::new();
    let mut pristine_subjects = HashSet::new();
    for event in captured {
        if subject_is_under(&event.subject, command_subject)
            && !sourced_subject_ids.contains_key(&event.subject)
            && pristine_subjects.insert(event.subject.clone())
        {
            preconditions.push(Precondition::SubjectIsPristine {
                subject: event.subject.clone(),
            });
        }
    }
    let mut sourced: Vec<(&String, &String)> = sourced_subject_ids.iter().collect();
    sourced.sort();
    for (subject, event_id) in sourced {
        preconditions.push(Precondition::SubjectIsOnEventId {
            subject: subject.clone(),
            event_id: event_id.clone(),
        });
    }
    for event in captured {
        preconditions.extend(event.preconditions.iter().cloned());
    }
    preconditions
}

fn subject_is_under(subject: &str, base: &str) -> bool {
    if base == "/" {
        return subject.starts_with('/');
    }
    subject == base
        || subject
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Wires event types, upcasters, and handlers into an immutable router.
pub struct CommandRouterBuilder {
    store: Arc<dyn EventStore>,
    resolver: EventTypeResolver,
    upcasters: Vec<EventUpcaster>,
    rebuilders: Vec<Arc<StateRebuildingHandlerDefinition>>,
    commands: Vec<CommandHandlerDefinition>,
    config: CommandRoutingConfig,
    errors: Vec<EngineError>,
}

impl CommandRouterBuilder {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            resolver: EventTypeResolver::new(),
            upcasters: Vec::new(),
            rebuilders: Vec::new(),
            commands: Vec::new(),
            config: CommandRoutingConfig::default(),
            errors: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: CommandRoutingConfig) -> Self {
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

    /// Register an event payload type under an explicit tag.
    pub fn register_event_with_tag<T: EventPayload>(mut self, tag: &str) -> Self {
        if let Err(error) = self.resolver.register_with_tag::<T>(tag) {
            self.errors.push(error);
        }
        self
    }

    pub fn with_upcaster(mut self, upcaster: EventUpcaster) -> Self {
        self.upcasters.push(upcaster);
        self
    }

    /// Register a state-rebuilding handler.
    pub fn on_event<I, E>(mut self, handler: StateRebuildingHandler<I, E>) -> Self
    where
        I: Send + Sync + 'static,
        E: EventPayload,
    {
        self.rebuilders
            .push(Arc::new(StateRebuildingHandlerDefinition::new(handler)));
        self
    }

    /// Register a command handler with its sourcing mode.
    pub fn on_command<I, C>(mut self, sourcing_mode: SourcingMode, handler: CommandHandler<I, C>) -> Self
    where
        I: Clone + Send + Sync + 'static,
        C: Command,
    {
        self.commands
            .push(CommandHandlerDefinition::new(sourcing_mode, handler));
        self
    }

    pub fn build(self) -> EngineResult<CommandRouter> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        self.config
            .validate()
            .map_err(|message| EngineError::AmbiguousRegistration { message })?;

        let mut commands: HashMap<TypeId, CommandEntry> = HashMap::new();
        for definition in self.commands {
            let rebuilders: Vec<Arc<StateRebuildingHandlerDefinition>> = self
                .rebuilders
                .iter()
                .filter(|r| r.instance_type() == definition.instance_type())
                .cloned()
                .collect();
            let command_type = definition.command_type();
            let entry = CommandEntry {
                rebuilders: Arc::new(rebuilders),
                definition,
            };
            if let Some(previous) = commands.insert(command_type, entry) {
                return Err(EngineError::AmbiguousRegistration {
                    message: format!(
                        "command type {} registered twice",
                        previous.definition.command_name()
                    ),
                });
            }
        }

        let resolver = Arc::new(self.resolver);
        let converter = Arc::new(crate::reader::EventConverter::new(
            Arc::clone(&resolver),
            EventDataMarshaller,
            Arc::new(EventUpcasters::new(self.upcasters)),
        ));
        let reader = EventReader::new(Arc::clone(&self.store), Arc::clone(&converter));
        let publisher = ImmediatePublisher::new(
            Arc::clone(&self.store),
            Arc::clone(&resolver),
            EventDataMarshaller,
            self.config.source.clone(),
        );
        let cache: Arc<dyn StateRebuildingCache> = match self.config.cache.cache_type {
            CacheType::None => Arc::new(NoopStateCache),
            CacheType::InMemory => Arc::new(InMemoryStateCache::new(self.config.cache.capacity)),
        };
        let propagation = MetadataPropagation::new(
            self.config.metadata.propagation_mode,
            self.config.metadata.propagation_keys.clone(),
        );

        Ok(CommandRouter {
            reader,
            publisher,
            cache,
            commands,
            propagation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_containment_ignores_siblings() {
        assert!(subject_is_under("/books/42", "/books/42"));
        assert!(subject_is_under("/books/42/loans/1", "/books/42"));
        assert!(!subject_is_under("/books/421", "/books/42"));
        assert!(!subject_is_under("/members/7", "/books/42"));
        assert!(subject_is_under("/books/42", "/"));
    }
}
