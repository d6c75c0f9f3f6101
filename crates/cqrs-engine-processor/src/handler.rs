//! Event-handler definitions for processing groups.
//!
//! Handlers are registered per event payload type as tagged variants, one
//! per parameter shape, and invoked in registration order for every event
//! of their type that reaches the group's partition. Delivery is
//! at-least-once; handlers own their side effects.

use std::any::TypeId;

use futures_util::future::BoxFuture;

use cqrs_engine_client::Event;
use cqrs_engine_core::reader::SourcedEvent;
use cqrs_engine_core::{EngineError, EngineResult, EventPayload, MetaData};

/// The parameter shapes of an event handler. Arguments are owned; the
/// handler may move them into its future.
pub enum EventHandler<E> {
    /// `(event)`
    FromEvent(Box<dyn Fn(E) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>),
    /// `(event, metadata)`
    FromEventAndMetaData(
        Box<dyn Fn(E, MetaData) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>,
    ),
    /// `(event, raw event)`
    FromEventAndRawEvent(
        Box<dyn Fn(E, Event) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>,
    ),
    /// `(event, metadata, raw event)`
    FromEventMetaDataAndRawEvent(
        Box<dyn Fn(E, MetaData, Event) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>,
    ),
}

type HandleFn =
    Box<dyn Fn(&SourcedEvent) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;

/// A registered event handler, erased for dispatch by payload type.
pub struct EventHandlerDefinition {
    event_type: TypeId,
    event_type_name: &'static str,
    handle: HandleFn,
}

impl EventHandlerDefinition {
    pub fn new<E: EventPayload>(handler: EventHandler<E>) -> Self {
        let handle: HandleFn = Box::new(move |sourced| {
            let payload = match sourced.payload.downcast_ref::<E>() {
                Some(payload) => payload.clone(),
                None => {
                    let event_type = E::event_type().to_string();
                    return Box::pin(async move {
                        Err(EngineError::StateRebuildingFailed {
                            event_type,
                            message: "event payload does not match the declared handler type"
                                .to_string(),
                        })
                    });
                }
            };
            match &handler {
                EventHandler::FromEvent(f) => f(payload),
                EventHandler::FromEventAndMetaData(f) => f(payload, sourced.metadata.clone()),
                EventHandler::FromEventAndRawEvent(f) => f(payload, sourced.raw.clone()),
                EventHandler::FromEventMetaDataAndRawEvent(f) => {
                    f(payload, sourced.metadata.clone(), sourced.raw.clone())
                }
            }
        });
        Self {
            event_type: TypeId::of::<E>(),
            event_type_name: E::event_type(),
            handle,
        }
    }

    pub fn event_type(&self) -> TypeId {
        self.event_type
    }

    pub fn event_type_name(&self) -> &'static str {
        self.event_type_name
    }

    pub fn handle(&self, sourced: &SourcedEvent) -> BoxFuture<'static, EngineResult<()>> {
        (self.handle)(sourced)
    }
}
