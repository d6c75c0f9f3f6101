//! Serialization of event payload and metadata into the stored `data`
//! object.
//!
//! Stored events carry `{"metadata": {...}, "payload": {...}}` in their
//! CloudEvents `data` field.

use serde_json::{json, Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::metadata::MetaData;

/// Marshals `(metadata, payload)` pairs to and from the wire `data` object.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDataMarshaller;

impl EventDataMarshaller {
    /// Build the stored `data` object.
    pub fn to_wire(&self, metadata: &MetaData, payload: &Value) -> Value {
        json!({
            "metadata": Value::Object(
                metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<String, Value>>()
            ),
            "payload": payload,
        })
    }

    /// Split a stored `data` object into metadata and payload.
    pub fn from_wire(&self, data: &Value) -> EngineResult<(MetaData, Value)> {
        let object = data.as_object().ok_or_else(|| {
            EngineError::Client(cqrs_engine_client::ClientError::Marshalling {
                message: "event data is not an object".to_string(),
            })
        })?;
        let metadata = match object.get("metadata") {
            None | Some(Value::Null) => MetaData::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(_) => {
                return Err(EngineError::Client(
                    cqrs_engine_client::ClientError::Marshalling {
                        message: "event metadata is not an object".to_string(),
                    },
                ))
            }
        };
        let payload = object.get("payload").cloned().unwrap_or(Value::Null);
        Ok((metadata, payload))
    }
}
