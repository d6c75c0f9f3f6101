//! Immediate publication of captured events.

use std::sync::Arc;

use cqrs_engine_client::{Event, EventCandidate, EventStore, Precondition};

use crate::capturer::CapturedEvent;
use crate::error::EngineResult;
use crate::marshalling::EventDataMarshaller;
use crate::resolver::EventTypeResolver;

/// Serializes captured events into candidates and writes them through the
/// store in one atomic call. Precondition evaluation is the store's job.
pub struct ImmediatePublisher {
    store: Arc<dyn EventStore>,
    resolver: Arc<EventTypeResolver>,
    marshaller: EventDataMarshaller,
    source: String,
}

impl ImmediatePublisher {
    pub fn new(
        store: Arc<dyn EventStore>,
        resolver: Arc<EventTypeResolver>,
        marshaller: EventDataMarshaller,
        source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            resolver,
            marshaller,
            source: source.into(),
        }
    }

    /// Write all captured events, in capture order, subject to the given
    /// preconditions.
    pub async fn publish(
        &self,
        events: &[CapturedEvent],
        preconditions: Vec<Precondition>,
    ) -> EngineResult<Vec<Event>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut candidates = Vec::with_capacity(events.len());
        for event in events {
            let (tag, payload) = self.resolver.serialize(event.payload.as_ref())?;
            let data = self.marshaller.to_wire(&event.metadata, &payload);
            candidates.push(EventCandidate::new(
                self.source.clone(),
                event.subject.clone(),
                tag,
                data,
            ));
        }
        tracing::debug!(
            events = candidates.len(),
            preconditions = preconditions.len(),
            "writing captured events"
        );
        Ok(self.store.write(candidates, preconditions).await?)
    }
}
