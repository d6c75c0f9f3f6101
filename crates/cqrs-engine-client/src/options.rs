//! Read/observe option sets and their wire representation.
//!
//! Options serialize as a single JSON object with snake-case keys matching
//! the option kind. Invalid combinations (conflicting bounds, options not
//! supported by observe) are rejected before a request is issued.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ClientError, ClientResult};

/// Delivery order for read requests. Not valid for observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    Chronological,
    Antichronological,
}

/// Fallback behavior of `FromLatestEvent` when no matching event exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfEventIsMissing {
    ReadEverything,
    ReadNothing,
}

/// A single read/observe option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOption {
    /// Include events of subjects below the requested subject.
    Recursive,
    /// Delivery order; read only.
    Order(Order),
    LowerBoundInclusive(String),
    LowerBoundExclusive(String),
    UpperBoundInclusive(String),
    UpperBoundExclusive(String),
    /// Start from the latest event with the given subject and type.
    FromLatestEvent {
        subject: String,
        event_type: String,
        if_event_is_missing: IfEventIsMissing,
    },
}

impl ReadOption {
    fn wire_key(&self) -> &'static str {
        match self {
            ReadOption::Recursive => "recursive",
            ReadOption::Order(_) => "order",
            ReadOption::LowerBoundInclusive(_) => "lower_bound_inclusive",
            ReadOption::LowerBoundExclusive(_) => "lower_bound_exclusive",
            ReadOption::UpperBoundInclusive(_) => "upper_bound_inclusive",
            ReadOption::UpperBoundExclusive(_) => "upper_bound_exclusive",
            ReadOption::FromLatestEvent { .. } => "from_latest_event",
        }
    }

    fn is_lower_bound(&self) -> bool {
        matches!(
            self,
            ReadOption::LowerBoundInclusive(_) | ReadOption::LowerBoundExclusive(_)
        )
    }

    fn is_upper_bound(&self) -> bool {
        matches!(
            self,
            ReadOption::UpperBoundInclusive(_) | ReadOption::UpperBoundExclusive(_)
        )
    }

    /// Whether this option is allowed on an observe request.
    fn valid_for_observe(&self) -> bool {
        matches!(
            self,
            ReadOption::Recursive
                | ReadOption::LowerBoundInclusive(_)
                | ReadOption::LowerBoundExclusive(_)
                | ReadOption::FromLatestEvent { .. }
        )
    }
}

/// An ordered set of read/observe options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions(Vec<ReadOption>);

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, option: ReadOption) -> Self {
        self.0.push(option);
        self
    }

    pub fn push(&mut self, option: ReadOption) {
        self.0.push(option);
    }

    pub fn recursive(self) -> Self {
        self.with(ReadOption::Recursive)
    }

    pub fn is_recursive(&self) -> bool {
        self.0.iter().any(|o| matches!(o, ReadOption::Recursive))
    }

    pub fn contains(&self, option: &ReadOption) -> bool {
        self.0.contains(option)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadOption> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self, for_observe: bool) -> ClientResult<()> {
        let lower_bounds = self.0.iter().filter(|o| o.is_lower_bound()).count();
        let upper_bounds = self.0.iter().filter(|o| o.is_upper_bound()).count();
        if lower_bounds > 1 {
            return Err(ClientError::InvalidUsage {
                message: "at most one lower bound may be given".to_string(),
            });
        }
        if upper_bounds > 1 {
            return Err(ClientError::InvalidUsage {
                message: "at most one upper bound may be given".to_string(),
            });
        }
        if for_observe {
            if let Some(option) = self.0.iter().find(|o| !o.valid_for_observe()) {
                return Err(ClientError::InvalidUsage {
                    message: format!("option '{}' is not valid for observe", option.wire_key()),
                });
            }
        }
        Ok(())
    }

    /// Serialize into the request's `options` object, rejecting invalid
    /// combinations. `for_observe` applies the stricter observe rules.
    pub fn to_wire(&self, for_observe: bool) -> ClientResult<Value> {
        self.validate(for_observe)?;
        let mut object = Map::new();
        for option in &self.0 {
            if object.contains_key(option.wire_key()) {
                return Err(ClientError::InvalidUsage {
                    message: format!("option '{}' given more than once", option.wire_key()),
                });
            }
            let value = match option {
                ReadOption::Recursive => Value::Bool(true),
                ReadOption::Order(order) => serde_json::to_value(order)?,
                ReadOption::LowerBoundInclusive(id)
                | ReadOption::LowerBoundExclusive(id)
                | ReadOption::UpperBoundInclusive(id)
                | ReadOption::UpperBoundExclusive(id) => Value::String(id.clone()),
                ReadOption::FromLatestEvent {
                    subject,
                    event_type,
                    if_event_is_missing,
                } => json!({
                    "subject": subject,
                    "type": event_type,
                    "if_event_is_missing": if_event_is_missing,
                }),
            };
            object.insert(option.wire_key().to_string(), value);
        }
        Ok(Value::Object(object))
    }

    /// Parse a wire-format options object back into an option set.
    pub fn from_wire(value: &Value) -> ClientResult<Self> {
        let object = value.as_object().ok_or_else(|| ClientError::Marshalling {
            message: "options must be a JSON object".to_string(),
        })?;
        let mut options = ReadOptions::new();
        for (key, value) in object {
            let option = match key.as_str() {
                "recursive" => ReadOption::Recursive,
                "order" => ReadOption::Order(serde_json::from_value(value.clone())?),
                "lower_bound_inclusive" => ReadOption::LowerBoundInclusive(expect_str(value)?),
                "lower_bound_exclusive" => ReadOption::LowerBoundExclusive(expect_str(value)?),
                "upper_bound_inclusive" => ReadOption::UpperBoundInclusive(expect_str(value)?),
                "upper_bound_exclusive" => ReadOption::UpperBoundExclusive(expect_str(value)?),
                "from_latest_event" => ReadOption::FromLatestEvent {
                    subject: expect_str(&value["subject"])?,
                    event_type: expect_str(&value["type"])?,
                    if_event_is_missing: serde_json::from_value(
                        value["if_event_is_missing"].clone(),
                    )?,
                },
                other => {
                    return Err(ClientError::Marshalling {
                        message: format!("unknown option '{other}'"),
                    })
                }
            };
            options.push(option);
        }
        Ok(options)
    }
}

fn expect_str(value: &Value) -> ClientResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::Marshalling {
            message: "expected a string value".to_string(),
        })
}

impl FromIterator<ReadOption> for ReadOptions {
    fn from_iter<T: IntoIterator<Item = ReadOption>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
