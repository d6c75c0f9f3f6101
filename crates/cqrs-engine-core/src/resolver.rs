//! Resolution between in-process event payload types and wire type tags.
//!
//! The registry is the explicit registration table the runtime dispatches
//! over: each entry binds a tag to a concrete Rust type together with its
//! (de)serialization functions. Matching is exact type identity; a
//! duplicate registration for either side of the mapping is rejected at
//! wiring time.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// An event payload that can cross the wire.
///
/// `event_type` is the reverse-DNS-style tag stored in the event's `type`
/// field.
pub trait EventPayload:
    Serialize + DeserializeOwned + Clone + Send + Sync + Any + 'static
{
    fn event_type() -> &'static str;
}

/// A type-erased, owned event payload.
pub type ErasedPayload = Box<dyn Any + Send + Sync>;

struct Registration {
    tag: String,
    type_name: &'static str,
    type_id: TypeId,
    deserialize: Box<dyn Fn(&serde_json::Value) -> EngineResult<ErasedPayload> + Send + Sync>,
    serialize: Box<dyn Fn(&(dyn Any + Send + Sync)) -> EngineResult<serde_json::Value> + Send + Sync>,
}

/// Bidirectional map between type tags and registered payload types.
#[derive(Default)]
pub struct EventTypeResolver {
    by_tag: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
    registrations: Vec<Registration>,
}

impl EventTypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under its declared tag.
    pub fn register<T: EventPayload>(&mut self) -> EngineResult<()> {
        self.register_with_tag::<T>(T::event_type())
    }

    /// Register a payload type under the fully-qualified Rust type name.
    pub fn register_type_name<T: EventPayload>(&mut self) -> EngineResult<()> {
        self.register_with_tag::<T>(std::any::type_name::<T>())
    }

    /// Register a payload type under an explicit tag.
    pub fn register_with_tag<T: EventPayload>(&mut self, tag: &str) -> EngineResult<()> {
        if self.by_tag.contains_key(tag) {
            return Err(EngineError::AmbiguousRegistration {
                message: format!("event type tag '{tag}' registered twice"),
            });
        }
        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(EngineError::AmbiguousRegistration {
                message: format!(
                    "event payload type {} registered twice",
                    std::any::type_name::<T>()
                ),
            });
        }
        let index = self.registrations.len();
        self.registrations.push(Registration {
            tag: tag.to_string(),
            type_name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            deserialize: Box::new(|value| {
                let payload: T = serde_json::from_value(value.clone())?;
                Ok(Box::new(payload) as ErasedPayload)
            }),
            serialize: Box::new(|payload| {
                let payload =
                    payload
                        .downcast_ref::<T>()
                        .ok_or_else(|| EngineError::UnknownEventType {
                            tag: std::any::type_name::<T>().to_string(),
                        })?;
                Ok(serde_json::to_value(payload)?)
            }),
        });
        self.by_tag.insert(tag.to_string(), index);
        self.by_type.insert(TypeId::of::<T>(), index);
        Ok(())
    }

    /// The type id registered for a tag, if any.
    pub fn type_id_of(&self, tag: &str) -> Option<TypeId> {
        self.by_tag
            .get(tag)
            .map(|&index| self.registrations[index].type_id)
    }

    /// The tag registered for a concrete payload type.
    pub fn tag_of(&self, type_id: TypeId) -> EngineResult<&str> {
        self.by_type
            .get(&type_id)
            .map(|&index| self.registrations[index].tag.as_str())
            .ok_or_else(|| EngineError::UnknownEventType {
                tag: format!("{type_id:?}"),
            })
    }

    /// Deserialize a payload by its tag.
    pub fn deserialize(&self, tag: &str, value: &serde_json::Value) -> EngineResult<ErasedPayload> {
        let &index = self
            .by_tag
            .get(tag)
            .ok_or_else(|| EngineError::UnknownEventType {
                tag: tag.to_string(),
            })?;
        (self.registrations[index].deserialize)(value)
    }

    /// Serialize an erased payload, returning the tag and the JSON value.
    pub fn serialize(
        &self,
        payload: &(dyn Any + Send + Sync),
    ) -> EngineResult<(String, serde_json::Value)> {
        let type_id = payload.type_id();
        let &index = self
            .by_type
            .get(&type_id)
            .ok_or_else(|| EngineError::UnknownEventType {
                tag: format!("unregistered payload type {type_id:?}"),
            })?;
        let registration = &self.registrations[index];
        Ok((registration.tag.clone(), (registration.serialize)(payload)?))
    }

    /// The registered type name for diagnostics.
    pub fn type_name_of(&self, type_id: TypeId) -> Option<&'static str> {
        self.by_type
            .get(&type_id)
            .map(|&index| self.registrations[index].type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct BookPurchased {
        isbn: String,
    }

    impl EventPayload for BookPurchased {
        fn event_type() -> &'static str {
            "com.example.library.book-purchased"
        }
    }

    #[test]
    fn round_trips_a_registered_type() {
        let mut resolver = EventTypeResolver::new();
        resolver.register::<BookPurchased>().unwrap();

        let original = BookPurchased { isbn: "978-0".into() };
        let (tag, value) = resolver.serialize(&original).unwrap();
        assert_eq!(tag, BookPurchased::event_type());

        let erased = resolver.deserialize(&tag, &value).unwrap();
        let payload = erased.downcast_ref::<BookPurchased>().unwrap();
        assert_eq!(payload, &original);
    }

    #[test]
    fn rejects_duplicate_registrations() {
        let mut resolver = EventTypeResolver::new();
        resolver.register::<BookPurchased>().unwrap();
        assert!(matches!(
            resolver.register::<BookPurchased>(),
            Err(EngineError::AmbiguousRegistration { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let resolver = EventTypeResolver::new();
        assert!(matches!(
            resolver.deserialize("com.example.unknown", &serde_json::json!({})),
            Err(EngineError::UnknownEventType { .. })
        ));
    }
}
