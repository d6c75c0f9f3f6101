//! Staged consumption of stored events: raw, upcasted, converted.
//!
//! Sourcing and event handling want different amounts of work per event.
//! The raw stage is the client's stream untouched; the upcasted stage has
//! decoded `data` and run the upcaster pipeline; the converted stage has
//! resolved the payload into its registered in-process type. Callers pick
//! the cheapest stage that serves them and pay for nothing beyond it.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use cqrs_engine_client::{Event, EventStore, EventStream, ReadOptions};

use crate::error::EngineResult;
use crate::marshalling::EventDataMarshaller;
use crate::metadata::MetaData;
use crate::resolver::{ErasedPayload, EventTypeResolver};
use crate::upcaster::EventUpcasters;

/// A fully converted event: the raw record plus the resolved payload.
///
/// One raw event can convert into zero or more of these when upcasters
/// drop or fan out tuples.
pub struct SourcedEvent {
    pub raw: Event,
    pub event_type: String,
    pub metadata: MetaData,
    pub payload: ErasedPayload,
}

/// A stream of converted events.
pub type SourcedEventStream = Pin<Box<dyn Stream<Item = EngineResult<SourcedEvent>> + Send>>;

/// Applies marshalling, upcasting, and type resolution to raw events.
pub struct EventConverter {
    resolver: Arc<EventTypeResolver>,
    marshaller: EventDataMarshaller,
    upcasters: Arc<EventUpcasters>,
}

impl EventConverter {
    pub fn new(
        resolver: Arc<EventTypeResolver>,
        marshaller: EventDataMarshaller,
        upcasters: Arc<EventUpcasters>,
    ) -> Self {
        Self {
            resolver,
            marshaller,
            upcasters,
        }
    }

    pub fn resolver(&self) -> &EventTypeResolver {
        &self.resolver
    }

    /// Decode and upcast one raw event without resolving payload types.
    pub fn upcast(&self, raw: &Event) -> EngineResult<Vec<crate::upcaster::UpcastedEvent>> {
        let (metadata, payload) = self.marshaller.from_wire(&raw.data)?;
        Ok(self.upcasters.apply(raw, metadata, payload))
    }

    /// Fully convert one raw event into typed payloads.
    pub fn convert(&self, raw: &Event) -> EngineResult<Vec<SourcedEvent>> {
        self.upcast(raw)?
            .into_iter()
            .map(|tuple| {
                let payload = self.resolver.deserialize(&tuple.event_type, &tuple.payload)?;
                Ok(SourcedEvent {
                    raw: raw.clone(),
                    event_type: tuple.event_type,
                    metadata: tuple.metadata,
                    payload,
                })
            })
            .collect()
    }
}

/// Reads event streams from the store at any of the three stages.
pub struct EventReader {
    store: Arc<dyn EventStore>,
    converter: Arc<EventConverter>,
}

impl EventReader {
    pub fn new(store: Arc<dyn EventStore>, converter: Arc<EventConverter>) -> Self {
        Self { store, converter }
    }

    pub fn converter(&self) -> &Arc<EventConverter> {
        &self.converter
    }

    /// Raw stage: the client's finite read stream, untouched.
    pub async fn read_raw(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> EngineResult<EventStream> {
        Ok(self.store.read(subject, options, token).await?)
    }

    /// Raw stage over an infinite observation.
    pub async fn observe_raw(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> EngineResult<EventStream> {
        Ok(self.store.observe(subject, options, token).await?)
    }

    /// Converted stage: every raw event fully resolved. Raw events that
    /// upcast to nothing vanish from the stream.
    pub async fn read_converted(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> EngineResult<SourcedEventStream> {
        let mut raw = self.store.read(subject, options, token).await?;
        let converter = Arc::clone(&self.converter);
        let stream = async_stream::stream! {
            while let Some(item) = raw.next().await {
                match item {
                    Ok(event) => match converter.convert(&event) {
                        Ok(converted) => {
                            for sourced in converted {
                                yield Ok(sourced);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    },
                    Err(e) => {
                        yield Err(e.into());
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
