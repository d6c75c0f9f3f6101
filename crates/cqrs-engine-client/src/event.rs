//! Event records as stored and retrieved over the wire.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A stored event, CloudEvents-compatible.
///
/// Ids are decimal integers encoded as strings; within one store they are
/// totally ordered by numeric value, and `predecessor_hash` equals the
/// previous event's `hash` in the store's global order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub subject: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    #[serde(rename = "specversion")]
    pub spec_version: String,
    pub id: String,
    pub time: DateTime<FixedOffset>,
    #[serde(rename = "datacontenttype")]
    pub data_content_type: String,
    #[serde(default)]
    pub hash: String,
    #[serde(rename = "predecessorhash", default)]
    pub predecessor_hash: String,
}

/// A not-yet-written event, handed to the store's write endpoint. The store
/// populates the remaining CloudEvents fields on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub source: String,
    pub subject: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl EventCandidate {
    pub fn new(
        source: impl Into<String>,
        subject: impl Into<String>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            source: source.into(),
            subject: subject.into(),
            event_type: event_type.into(),
            data,
        }
    }
}

/// Compare two decimal-integer-encoded event ids by numeric value.
///
/// Works for ids of arbitrary magnitude: a longer digit string is the larger
/// number, equal lengths compare lexicographically.
pub fn compare_event_ids(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_compare_numerically() {
        assert_eq!(compare_event_ids("2", "10"), Ordering::Less);
        assert_eq!(compare_event_ids("10", "2"), Ordering::Greater);
        assert_eq!(compare_event_ids("7", "7"), Ordering::Equal);
        assert_eq!(compare_event_ids("0", "00"), Ordering::Equal);
        assert_eq!(
            compare_event_ids("99999999999999999999999", "100000000000000000000000"),
            Ordering::Less
        );
    }

    #[test]
    fn event_round_trips_through_wire_names() {
        let json = serde_json::json!({
            "source": "tag://library",
            "subject": "/books/42",
            "type": "com.example.library.book-purchased",
            "data": {"isbn": "978-0"},
            "specversion": "1.0",
            "id": "3",
            "time": "2024-01-15T10:30:00+00:00",
            "datacontenttype": "application/json",
            "hash": "abc",
            "predecessorhash": "def"
        });
        let event: Event = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(event.event_type, "com.example.library.book-purchased");
        assert_eq!(event.spec_version, "1.0");
        assert_eq!(event.predecessor_hash, "def");
        assert_eq!(serde_json::to_value(&event).unwrap(), json);
    }
}
