//! Handler definitions for state rebuilding and command handling.
//!
//! Handlers are registered as tagged variants, one per parameter shape; the
//! variant switch at invocation time is the only place parameter-set
//! branching appears. Registration erases the concrete instance, event, and
//! command types into definitions the router can dispatch over; matching at
//! runtime is exact type identity against the registration table.

use std::any::{Any, TypeId};
use std::sync::Arc;

use cqrs_engine_client::Event;

use crate::capturer::{CapturedEvent, CommandEventCapturer};
use crate::command::{Command, SourcingMode};
use crate::error::{EngineError, EngineResult};
use crate::metadata::MetaData;
use crate::resolver::EventPayload;

/// A type-erased, owned write-model instance.
pub type ErasedInstance = Box<dyn Any + Send + Sync>;

/// The five parameter shapes of a state-rebuilding handler.
///
/// Every shape receives the instance accumulated so far (absent on the
/// first event) and must produce the next instance.
pub enum StateRebuildingHandler<I, E> {
    /// `(instance, event)`
    FromEvent(Box<dyn Fn(Option<I>, &E) -> I + Send + Sync>),
    /// `(instance, event, metadata)`
    FromEventAndMetaData(Box<dyn Fn(Option<I>, &E, &MetaData) -> I + Send + Sync>),
    /// `(instance, event, subject)`
    FromEventAndSubject(Box<dyn Fn(Option<I>, &E, &str) -> I + Send + Sync>),
    /// `(instance, event, metadata, subject)`
    FromEventMetaDataAndSubject(Box<dyn Fn(Option<I>, &E, &MetaData, &str) -> I + Send + Sync>),
    /// `(instance, event, metadata, subject, raw event)`; the raw event is
    /// absent for events captured inside a command handler, which have not
    /// been written yet.
    FromEventMetaDataSubjectAndRawEvent(
        Box<dyn Fn(Option<I>, &E, &MetaData, &str, Option<&Event>) -> I + Send + Sync>,
    ),
}

type ApplyFn = Box<
    dyn Fn(
            Option<ErasedInstance>,
            &(dyn Any + Send + Sync),
            &MetaData,
            &str,
            Option<&Event>,
        ) -> EngineResult<ErasedInstance>
        + Send
        + Sync,
>;

/// A registered state-rebuilding handler, erased for dispatch.
pub struct StateRebuildingHandlerDefinition {
    instance_type: TypeId,
    instance_type_name: &'static str,
    event_type: TypeId,
    event_type_name: &'static str,
    apply: ApplyFn,
}

impl StateRebuildingHandlerDefinition {
    pub fn new<I, E>(handler: StateRebuildingHandler<I, E>) -> Self
    where
        I: Send + Sync + 'static,
        E: EventPayload,
    {
        let apply: ApplyFn = Box::new(move |instance, event, metadata, subject, raw| {
            let instance = match instance {
                Some(boxed) => Some(*boxed.downcast::<I>().map_err(|_| {
                    EngineError::StateRebuildingFailed {
                        event_type: E::event_type().to_string(),
                        message: format!(
                            "accumulated instance is not a {}",
                            std::any::type_name::<I>()
                        ),
                    }
                })?),
                None => None,
            };
            let event =
                event
                    .downcast_ref::<E>()
                    .ok_or_else(|| EngineError::StateRebuildingFailed {
                        event_type: E::event_type().to_string(),
                        message: "event payload does not match the declared event type"
                            .to_string(),
                    })?;
            let next = match &handler {
                StateRebuildingHandler::FromEvent(f) => f(instance, event),
                StateRebuildingHandler::FromEventAndMetaData(f) => f(instance, event, metadata),
                StateRebuildingHandler::FromEventAndSubject(f) => f(instance, event, subject),
                StateRebuildingHandler::FromEventMetaDataAndSubject(f) => {
                    f(instance, event, metadata, subject)
                }
                StateRebuildingHandler::FromEventMetaDataSubjectAndRawEvent(f) => {
                    f(instance, event, metadata, subject, raw)
                }
            };
            Ok(Box::new(next) as ErasedInstance)
        });
        Self {
            instance_type: TypeId::of::<I>(),
            instance_type_name: std::any::type_name::<I>(),
            event_type: TypeId::of::<E>(),
            event_type_name: E::event_type(),
            apply,
        }
    }

    pub fn instance_type(&self) -> TypeId {
        self.instance_type
    }

    pub fn event_type(&self) -> TypeId {
        self.event_type
    }

    pub fn event_type_name(&self) -> &'static str {
        self.event_type_name
    }

    pub fn instance_type_name(&self) -> &'static str {
        self.instance_type_name
    }

    /// Fold one event into the accumulated instance.
    pub fn apply(
        &self,
        instance: Option<ErasedInstance>,
        event: &(dyn Any + Send + Sync),
        metadata: &MetaData,
        subject: &str,
        raw: Option<&Event>,
    ) -> EngineResult<ErasedInstance> {
        (self.apply)(instance, event, metadata, subject, raw)
    }
}

/// The three parameter shapes of a command handler. Every shape receives
/// the event capturer as its publisher.
pub enum CommandHandler<I, C: Command> {
    /// `(command, publisher)`
    WithPublisher(
        Box<dyn Fn(&C, &mut CommandEventCapturer<I>) -> EngineResult<C::Result> + Send + Sync>,
    ),
    /// `(command, instance, publisher)`
    WithInstance(
        Box<
            dyn Fn(&C, Option<I>, &mut CommandEventCapturer<I>) -> EngineResult<C::Result>
                + Send
                + Sync,
        >,
    ),
    /// `(command, instance, metadata, publisher)`
    WithInstanceAndMetaData(
        Box<
            dyn Fn(
                    &C,
                    Option<I>,
                    &MetaData,
                    &mut CommandEventCapturer<I>,
                ) -> EngineResult<C::Result>
                + Send
                + Sync,
        >,
    ),
}

/// What a command handler invocation produced: the typed result (erased)
/// and the captured events in publication order.
pub(crate) struct InvokeOutcome {
    pub(crate) result: Box<dyn Any + Send>,
    pub(crate) captured: Vec<CapturedEvent>,
}

type InvokeFn = Box<
    dyn Fn(
            &(dyn Any + Send + Sync),
            Option<ErasedInstance>,
            &MetaData,
            &str,
            &Arc<Vec<Arc<StateRebuildingHandlerDefinition>>>,
        ) -> EngineResult<InvokeOutcome>
        + Send
        + Sync,
>;

type CloneInstanceFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> ErasedInstance + Send + Sync>;

/// A registered command handler, erased for dispatch by command type.
pub struct CommandHandlerDefinition {
    command_type: TypeId,
    command_name: &'static str,
    instance_type: TypeId,
    instance_type_name: &'static str,
    sourcing_mode: SourcingMode,
    clone_instance: CloneInstanceFn,
    invoke: InvokeFn,
}

impl CommandHandlerDefinition {
    pub fn new<I, C>(sourcing_mode: SourcingMode, handler: CommandHandler<I, C>) -> Self
    where
        I: Clone + Send + Sync + 'static,
        C: Command,
    {
        let invoke: InvokeFn = Box::new(move |command, instance, metadata, subject, rebuilders| {
            let command = command.downcast_ref::<C>().ok_or_else(|| {
                EngineError::MissingCommandHandler {
                    command: std::any::type_name::<C>().to_string(),
                }
            })?;
            let instance: Option<I> = match instance {
                Some(boxed) => {
                    Some(*boxed.downcast::<I>().map_err(|_| EngineError::Transient {
                        message: format!(
                            "cached instance is not a {}",
                            std::any::type_name::<I>()
                        ),
                    })?)
                }
                None => None,
            };
            let mut capturer = CommandEventCapturer::new(
                subject.to_string(),
                instance.clone(),
                Arc::clone(rebuilders),
            );
            let result = match &handler {
                CommandHandler::WithPublisher(f) => f(command, &mut capturer)?,
                CommandHandler::WithInstance(f) => f(command, instance, &mut capturer)?,
                CommandHandler::WithInstanceAndMetaData(f) => {
                    f(command, instance, metadata, &mut capturer)?
                }
            };
            Ok(InvokeOutcome {
                result: Box::new(result),
                captured: capturer.into_captured(),
            })
        });
        Self {
            command_type: TypeId::of::<C>(),
            command_name: std::any::type_name::<C>(),
            instance_type: TypeId::of::<I>(),
            instance_type_name: std::any::type_name::<I>(),
            sourcing_mode,
            clone_instance: Box::new(|instance| {
                let instance = instance
                    .downcast_ref::<I>()
                    .expect("cached instance type verified at lookup");
                Box::new(instance.clone()) as ErasedInstance
            }),
            invoke,
        }
    }

    pub fn command_type(&self) -> TypeId {
        self.command_type
    }

    pub fn command_name(&self) -> &'static str {
        self.command_name
    }

    pub fn instance_type(&self) -> TypeId {
        self.instance_type
    }

    pub fn instance_type_name(&self) -> &'static str {
        self.instance_type_name
    }

    pub fn sourcing_mode(&self) -> SourcingMode {
        self.sourcing_mode
    }

    pub(crate) fn clone_instance(&self, instance: &(dyn Any + Send + Sync)) -> ErasedInstance {
        (self.clone_instance)(instance)
    }

    pub(crate) fn invoke(
        &self,
        command: &(dyn Any + Send + Sync),
        instance: Option<ErasedInstance>,
        metadata: &MetaData,
        subject: &str,
        rebuilders: &Arc<Vec<Arc<StateRebuildingHandlerDefinition>>>,
    ) -> EngineResult<InvokeOutcome> {
        (self.invoke)(command, instance, metadata, subject, rebuilders)
    }
}
