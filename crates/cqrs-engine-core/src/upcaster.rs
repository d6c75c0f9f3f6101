//! Upcasting of historical events to their current shape.
//!
//! Upcasters form an ordered pipeline of rules keyed by source type tag.
//! Each rule receives the raw event together with the current metadata and
//! payload and may emit zero, one, or many replacement tuples, which feed
//! the next rule. Rules whose source tag does not match pass the tuple
//! through unchanged.

use cqrs_engine_client::Event;

use crate::metadata::MetaData;

/// One intermediate tuple flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct UpcastedEvent {
    pub event_type: String,
    pub metadata: MetaData,
    pub payload: serde_json::Value,
}

type UpcastFn = Box<dyn Fn(&Event, &MetaData, &serde_json::Value) -> Vec<UpcastedEvent> + Send + Sync>;

/// A single upcasting rule for one source type tag.
pub struct EventUpcaster {
    source_type: String,
    transform: UpcastFn,
}

impl EventUpcaster {
    pub fn new<F>(source_type: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Event, &MetaData, &serde_json::Value) -> Vec<UpcastedEvent> + Send + Sync + 'static,
    {
        Self {
            source_type: source_type.into(),
            transform: Box::new(transform),
        }
    }
}

/// The ordered upcaster pipeline.
#[derive(Default)]
pub struct EventUpcasters {
    rules: Vec<EventUpcaster>,
}

impl EventUpcasters {
    pub fn new(rules: Vec<EventUpcaster>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run the pipeline over one raw event's decoded metadata and payload.
    pub fn apply(
        &self,
        raw: &Event,
        metadata: MetaData,
        payload: serde_json::Value,
    ) -> Vec<UpcastedEvent> {
        let mut current = vec![UpcastedEvent {
            event_type: raw.event_type.clone(),
            metadata,
            payload,
        }];
        for rule in &self.rules {
            current = current
                .into_iter()
                .flat_map(|tuple| {
                    if tuple.event_type == rule.source_type {
                        (rule.transform)(raw, &tuple.metadata, &tuple.payload)
                    } else {
                        vec![tuple]
                    }
                })
                .collect();
        }
        current
    }
}
