//! Test support: an in-memory event store honoring the full store
//! contract.
//!
//! The store keeps one globally ordered event log, evaluates write
//! preconditions (violations surface as HTTP-409-shaped conflicts, exactly
//! like the wire client), serves bounded/recursive reads, and supports
//! observe through a broadcast channel. It backs the scenario tests of the
//! command router and the event-handling processors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use cqrs_engine_client::{
    ClientError, ClientResult, Event, EventCandidate, EventStore, EventStream, IfEventIsMissing,
    Order, Precondition, ReadOption, ReadOptions,
};

const OBSERVE_CHANNEL_CAPACITY: usize = 256;

/// In-memory [`EventStore`] with precondition checking and observe
/// support.
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<Event>>>,
    last_preconditions: Arc<RwLock<Vec<Precondition>>>,
    tx: broadcast::Sender<Event>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(OBSERVE_CHANNEL_CAPACITY);
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            last_preconditions: Arc::new(RwLock::new(Vec::new())),
            tx,
        }
    }

    /// Snapshot of the full log, for assertions.
    pub async fn stored_events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// The preconditions the most recent write carried, for assertions.
    pub async fn last_write_preconditions(&self) -> Vec<Precondition> {
        self.last_preconditions.read().await.clone()
    }

    fn subject_matches(filter: &str, recursive: bool, subject: &str) -> bool {
        if subject == filter {
            return true;
        }
        if !recursive {
            return false;
        }
        if filter == "/" {
            return subject.starts_with('/');
        }
        subject
            .strip_prefix(filter)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    fn check_preconditions(
        events: &[Event],
        preconditions: &[Precondition],
    ) -> Result<(), ClientError> {
        for precondition in preconditions {
            match precondition {
                Precondition::SubjectIsPristine { subject } => {
                    if events.iter().any(|e| &e.subject == subject) {
                        return Err(ClientError::HttpClientError {
                            status: 409,
                            body: format!("subject '{subject}' is not pristine"),
                        });
                    }
                }
                Precondition::SubjectIsOnEventId { subject, event_id } => {
                    let last = events.iter().rev().find(|e| &e.subject == subject);
                    match last {
                        Some(event) if &event.id == event_id => {}
                        _ => {
                            return Err(ClientError::HttpClientError {
                                status: 409,
                                body: format!(
                                    "subject '{subject}' is not on event id {event_id}"
                                ),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Select matching events in chronological order and compute the floor
    /// id below which broadcast events are duplicates of the backlog.
    fn select(
        events: &[Event],
        subject: &str,
        options: &ReadOptions,
    ) -> ClientResult<(Vec<Event>, i128)> {
        let recursive = options.is_recursive();
        let mut lower: Option<(u64, bool)> = None;
        let mut upper: Option<(u64, bool)> = None;
        let mut order = Order::Chronological;
        let mut from_latest: Option<(&str, &str, IfEventIsMissing)> = None;
        for option in options.iter() {
            match option {
                ReadOption::Recursive => {}
                ReadOption::Order(o) => order = *o,
                ReadOption::LowerBoundInclusive(id) => lower = Some((numeric_id(id)?, true)),
                ReadOption::LowerBoundExclusive(id) => lower = Some((numeric_id(id)?, false)),
                ReadOption::UpperBoundInclusive(id) => upper = Some((numeric_id(id)?, true)),
                ReadOption::UpperBoundExclusive(id) => upper = Some((numeric_id(id)?, false)),
                ReadOption::FromLatestEvent {
                    subject,
                    event_type,
                    if_event_is_missing,
                } => from_latest = Some((subject, event_type, *if_event_is_missing)),
            }
        }

        let mut floor: i128 = match lower {
            Some((id, true)) => id as i128 - 1,
            Some((id, false)) => id as i128,
            None => -1,
        };

        if let Some((latest_subject, latest_type, if_missing)) = from_latest {
            let latest = events
                .iter()
                .rev()
                .find(|e| e.subject == latest_subject && e.event_type == latest_type);
            match latest {
                Some(event) => {
                    let id = numeric_id(&event.id)?;
                    floor = floor.max(id as i128 - 1);
                }
                None => match if_missing {
                    IfEventIsMissing::ReadEverything => {}
                    IfEventIsMissing::ReadNothing => {
                        let current_floor =
                            events.last().map(|e| numeric_id(&e.id)).transpose()?;
                        return Ok((
                            Vec::new(),
                            current_floor.map_or(-1, |id| id as i128),
                        ));
                    }
                },
            }
        }

        let mut selected: Vec<Event> = events
            .iter()
            .filter(|e| Self::subject_matches(subject, recursive, &e.subject))
            .cloned()
            .collect();
        let ids: Vec<u64> = selected
            .iter()
            .map(|e| numeric_id(&e.id))
            .collect::<ClientResult<_>>()?;
        let mut kept = Vec::with_capacity(selected.len());
        for (event, id) in selected.drain(..).zip(ids) {
            if (id as i128) <= floor {
                continue;
            }
            if let Some((bound, inclusive)) = upper {
                if id > bound || (!inclusive && id == bound) {
                    continue;
                }
            }
            kept.push(event);
        }
        let last_kept = kept
            .last()
            .map(|e| numeric_id(&e.id))
            .transpose()?
            .map_or(floor, |id| id as i128);
        if order == Order::Antichronological {
            kept.reverse();
        }
        Ok((kept, last_kept))
    }
}

fn numeric_id(id: &str) -> ClientResult<u64> {
    id.parse().map_err(|_| ClientError::Marshalling {
        message: format!("event id '{id}' is not a decimal integer"),
    })
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn read(
        &self,
        subject: &str,
        options: ReadOptions,
        _token: CancellationToken,
    ) -> ClientResult<EventStream> {
        options.to_wire(false)?;
        let events = self.events.read().await;
        let (selected, _) = Self::select(&events, subject, &options)?;
        Ok(Box::pin(futures_util::stream::iter(
            selected.into_iter().map(Ok),
        )))
    }

    async fn observe(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        options.to_wire(true)?;
        // Subscribe before the snapshot so nothing written in between is
        // lost; the floor filters out what the backlog already covers.
        let mut rx = self.tx.subscribe();
        let events = self.events.read().await;
        let (backlog, mut floor) = Self::select(&events, subject, &options)?;
        drop(events);
        let subject = subject.to_string();
        let recursive = options.is_recursive();
        let stream = async_stream::stream! {
            for event in backlog {
                yield Ok(event);
            }
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        yield Err(ClientError::Interrupted);
                        return;
                    }
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if !Self::subject_matches(&subject, recursive, &event.subject) {
                                continue;
                            }
                            let Ok(id) = event.id.parse::<u64>() else {
                                continue;
                            };
                            if (id as i128) <= floor {
                                continue;
                            }
                            floor = id as i128;
                            yield Ok(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            yield Err(ClientError::Transport {
                                message: format!("observe stream lagged by {missed} events"),
                            });
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            yield Err(ClientError::Transport {
                                message: "observe stream ended unexpectedly".to_string(),
                            });
                            return;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn write(
        &self,
        candidates: Vec<EventCandidate>,
        preconditions: Vec<Precondition>,
    ) -> ClientResult<Vec<Event>> {
        let mut events = self.events.write().await;
        Self::check_preconditions(&events, &preconditions)?;
        *self.last_preconditions.write().await = preconditions;
        let mut stored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let id = events.len().to_string();
            let predecessor_hash = events.last().map(|e| e.hash.clone()).unwrap_or_default();
            let hash = format!(
                "{:x}",
                md5::compute(format!(
                    "{id}|{}|{}|{}",
                    candidate.subject, candidate.event_type, candidate.data
                ))
            );
            let event = Event {
                source: candidate.source,
                subject: candidate.subject,
                event_type: candidate.event_type,
                data: candidate.data,
                spec_version: "1.0".to_string(),
                id,
                time: Utc::now().fixed_offset(),
                data_content_type: "application/json".to_string(),
                hash,
                predecessor_hash,
            };
            events.push(event.clone());
            stored.push(event);
        }
        drop(events);
        for event in &stored {
            let _ = self.tx.send(event.clone());
        }
        Ok(stored)
    }
}
