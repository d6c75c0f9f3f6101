//! Event capture inside a command handler.
//!
//! The capturer is the publisher a command handler sees. Nothing is written
//! through it: captured events accumulate in call order and are appended to
//! the store atomically after the handler returns. Each capture is folded
//! through the relevant state-rebuilding handlers right away, so the
//! handler always observes the instance as it will look once the events are
//! stored.

use std::any::{Any, TypeId};
use std::sync::Arc;

use cqrs_engine_client::Precondition;

use crate::error::{EngineError, EngineResult};
use crate::handler::{ErasedInstance, StateRebuildingHandlerDefinition};
use crate::metadata::MetaData;
use crate::resolver::{ErasedPayload, EventPayload};

/// An event captured by a command handler, pending publication.
pub struct CapturedEvent {
    pub subject: String,
    pub payload: ErasedPayload,
    pub metadata: MetaData,
    pub preconditions: Vec<Precondition>,
}

/// Per-capture metadata and user-supplied preconditions.
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub metadata: MetaData,
    pub preconditions: Vec<Precondition>,
}

impl CaptureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: MetaData) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }
}

/// Captures events published by a command handler and keeps the rebuilt
/// instance current.
pub struct CommandEventCapturer<I> {
    command_subject: String,
    instance: Option<I>,
    rebuilders: Arc<Vec<Arc<StateRebuildingHandlerDefinition>>>,
    captured: Vec<CapturedEvent>,
}

impl<I> CommandEventCapturer<I>
where
    I: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        command_subject: String,
        instance: Option<I>,
        rebuilders: Arc<Vec<Arc<StateRebuildingHandlerDefinition>>>,
    ) -> Self {
        Self {
            command_subject,
            instance,
            rebuilders,
            captured: Vec::new(),
        }
    }

    /// The instance as of the most recent capture.
    pub fn instance(&self) -> Option<&I> {
        self.instance.as_ref()
    }

    /// Capture an event for the command's subject. Returns the updated
    /// instance.
    pub fn publish<E: EventPayload>(&mut self, event: E) -> EngineResult<Option<&I>> {
        self.publish_with(event, CaptureOptions::default())
    }

    pub fn publish_with<E: EventPayload>(
        &mut self,
        event: E,
        options: CaptureOptions,
    ) -> EngineResult<Option<&I>> {
        let subject = self.command_subject.clone();
        self.capture(subject, event, options)
    }

    /// Capture an event for a subject below the command's subject. The
    /// suffix must not start with `/`.
    pub fn publish_relative<E: EventPayload>(
        &mut self,
        suffix: &str,
        event: E,
    ) -> EngineResult<Option<&I>> {
        self.publish_relative_with(suffix, event, CaptureOptions::default())
    }

    pub fn publish_relative_with<E: EventPayload>(
        &mut self,
        suffix: &str,
        event: E,
        options: CaptureOptions,
    ) -> EngineResult<Option<&I>> {
        if suffix.starts_with('/') {
            return Err(EngineError::InvalidSubject {
                message: format!("relative subject suffix '{suffix}' must not start with '/'"),
            });
        }
        if suffix.is_empty() {
            return Err(EngineError::InvalidSubject {
                message: "relative subject suffix must not be empty".to_string(),
            });
        }
        let subject = format!("{}/{}", self.command_subject.trim_end_matches('/'), suffix);
        self.capture(subject, event, options)
    }

    fn capture<E: EventPayload>(
        &mut self,
        subject: String,
        event: E,
        options: CaptureOptions,
    ) -> EngineResult<Option<&I>> {
        let mut instance: Option<ErasedInstance> = self
            .instance
            .take()
            .map(|i| Box::new(i) as ErasedInstance);
        for definition in self.rebuilders.iter() {
            if definition.event_type() == TypeId::of::<E>() {
                let next = definition.apply(
                    instance.take(),
                    &event as &(dyn Any + Send + Sync),
                    &options.metadata,
                    &subject,
                    None,
                )?;
                instance = Some(next);
            }
        }
        self.instance = match instance {
            Some(boxed) => Some(*boxed.downcast::<I>().map_err(|_| {
                EngineError::StateRebuildingFailed {
                    event_type: E::event_type().to_string(),
                    message: "state rebuilding produced an unexpected instance type".to_string(),
                }
            })?),
            None => None,
        };
        self.captured.push(CapturedEvent {
            subject,
            payload: Box::new(event),
            metadata: options.metadata,
            preconditions: options.preconditions,
        });
        Ok(self.instance.as_ref())
    }

    pub(crate) fn into_captured(self) -> Vec<CapturedEvent> {
        self.captured
    }
}
