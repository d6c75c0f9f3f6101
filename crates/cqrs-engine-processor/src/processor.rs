//! The per-(group, partition) event-processing loop.
//!
//! Each processor loads its checkpoint, observes the configured subject
//! from just past it, drops events assigned to other partitions, and hands
//! the rest to per-sequence-key workers: events with equal keys run in
//! source order, different keys run concurrently. A handled event advances
//! the checkpoint; a transient handler failure retries the same event under
//! the backoff policy; a non-transient failure stops the partition and is
//! escalated to the lifecycle controller. A terminated observe stream is
//! restarted after backoff.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use cqrs_engine_client::{ClientError, Event, EventStore, ReadOption, ReadOptions};
use cqrs_engine_core::reader::SourcedEvent;
use cqrs_engine_core::{EngineError, EngineResult, EventConverter};

use crate::handler::EventHandlerDefinition;
use crate::progress::ProgressTracker;
use crate::retry::RetryPolicy;
use crate::sequence::{partition_for, EventSequenceResolver};

/// Queue depth per sequence key; dispatch blocks when a worker falls this
/// far behind.
const SEQUENCE_QUEUE_CAPACITY: usize = 64;

pub struct EventProcessor {
    group: String,
    partition: u32,
    partitions: u32,
    subject: String,
    recursive: bool,
    store: Arc<dyn EventStore>,
    converter: Arc<EventConverter>,
    handlers: Arc<Vec<EventHandlerDefinition>>,
    tracker: Arc<dyn ProgressTracker>,
    sequence_resolver: Arc<dyn EventSequenceResolver>,
    retry: RetryPolicy,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        group: String,
        partition: u32,
        partitions: u32,
        subject: String,
        recursive: bool,
        store: Arc<dyn EventStore>,
        converter: Arc<EventConverter>,
        handlers: Arc<Vec<EventHandlerDefinition>>,
        tracker: Arc<dyn ProgressTracker>,
        sequence_resolver: Arc<dyn EventSequenceResolver>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            group,
            partition,
            partitions,
            subject,
            recursive,
            store,
            converter,
            handlers,
            tracker,
            sequence_resolver,
            retry,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Run until the token is cancelled or a non-transient failure
    /// escapes. Transient failures, including a terminated observe stream,
    /// restart the loop after backoff.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> EngineResult<()> {
        let mut restart_attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            match self.clone().run_stream(token.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() => {
                    restart_attempt += 1;
                    let delay = self.retry.delay(restart_attempt);
                    tracing::warn!(
                        group = %self.group,
                        partition = self.partition,
                        attempt = restart_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "observe stream failed, restarting after backoff"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    tracing::error!(
                        group = %self.group,
                        partition = self.partition,
                        error = %error,
                        "stopping partition on non-transient failure"
                    );
                    return Err(error);
                }
            }
        }
    }

    /// One observe pass: stream events and feed the sequencer until the
    /// stream ends, a worker fails fatally, or the token fires.
    async fn run_stream(self: Arc<Self>, token: CancellationToken) -> EngineResult<()> {
        let checkpoint = self.tracker.load(&self.group, self.partition).await?;
        let mut options = ReadOptions::new();
        if self.recursive {
            options = options.recursive();
        }
        if let Some(checkpoint) = &checkpoint {
            options.push(ReadOption::LowerBoundExclusive(checkpoint.clone()));
        }
        tracing::info!(
            group = %self.group,
            partition = self.partition,
            subject = %self.subject,
            checkpoint = checkpoint.as_deref().unwrap_or("<beginning>"),
            "starting observe stream"
        );

        let stream_token = token.child_token();
        let mut stream = self
            .store
            .observe(&self.subject, options, stream_token.clone())
            .await?;

        let mut sequencer = Sequencer::new(self.clone(), token.clone());
        let fatal_token = sequencer.fatal_token();
        let outcome = loop {
            tokio::select! {
                biased;
                _ = fatal_token.cancelled() => {
                    break Err(sequencer.take_fatal().await);
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let key = self.sequence_resolver.sequence_key(&event);
                        if partition_for(&key, self.partitions) != self.partition {
                            continue;
                        }
                        if let Err(error) = sequencer.dispatch(key, event).await {
                            break Err(error);
                        }
                    }
                    Some(Err(ClientError::Interrupted)) => {
                        break Ok(());
                    }
                    Some(Err(error)) => {
                        break Err(EngineError::from(error));
                    }
                    None => {
                        break Err(EngineError::Transient {
                            message: "observe stream ended without error".to_string(),
                        });
                    }
                }
            }
        };
        stream_token.cancel();
        // Let in-flight handlers finish before returning to the lifecycle.
        let drained = sequencer.shutdown().await;
        match outcome {
            Ok(()) => drained,
            Err(error) => match drained {
                // A worker's non-transient failure outranks a stream error.
                Err(fatal) if !fatal.is_transient() && error.is_transient() => Err(fatal),
                _ => Err(error),
            },
        }
    }

    /// Deliver one raw event to the group's handlers, converting lazily:
    /// types without a registered handler are skipped without
    /// deserialization.
    async fn dispatch_event(&self, raw: &Event) -> EngineResult<()> {
        for tuple in self.converter.upcast(raw)? {
            let Some(type_id) = self.converter.resolver().type_id_of(&tuple.event_type) else {
                tracing::debug!(
                    group = %self.group,
                    event_type = %tuple.event_type,
                    "skipping event of unregistered type"
                );
                continue;
            };
            if !self.handlers.iter().any(|h| h.event_type() == type_id) {
                continue;
            }
            let payload = self
                .converter
                .resolver()
                .deserialize(&tuple.event_type, &tuple.payload)?;
            let sourced = SourcedEvent {
                raw: raw.clone(),
                event_type: tuple.event_type,
                metadata: tuple.metadata,
                payload,
            };
            for handler in self.handlers.iter() {
                if handler.event_type() == type_id {
                    handler.handle(&sourced).await?;
                }
            }
        }
        Ok(())
    }

    /// Handle one event with retries, then advance the checkpoint.
    async fn handle_with_retry(&self, event: &Event, token: &CancellationToken) -> EngineResult<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.dispatch_event(event).await {
                Ok(()) => {
                    self.tracker
                        .save(&self.group, self.partition, &event.id)
                        .await?;
                    tracing::debug!(
                        group = %self.group,
                        partition = self.partition,
                        event_id = %event.id,
                        "checkpoint advanced"
                    );
                    return Ok(());
                }
                Err(error) if error.is_transient() => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        group = %self.group,
                        partition = self.partition,
                        event_id = %event.id,
                        attempt,
                        error = %error,
                        "event handler failed, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Per-sequence-key FIFO workers for one partition.
struct Sequencer {
    processor: Arc<EventProcessor>,
    token: CancellationToken,
    senders: HashMap<String, mpsc::Sender<Event>>,
    workers: JoinSet<EngineResult<()>>,
    fatal: Arc<Mutex<Option<EngineError>>>,
    fatal_token: CancellationToken,
}

impl Sequencer {
    fn new(processor: Arc<EventProcessor>, token: CancellationToken) -> Self {
        Self {
            processor,
            token,
            senders: HashMap::new(),
            workers: JoinSet::new(),
            fatal: Arc::new(Mutex::new(None)),
            fatal_token: CancellationToken::new(),
        }
    }

    /// Enqueue an event onto its key's worker, spawning the worker on
    /// first use. Blocks when the worker's queue is full.
    async fn dispatch(&mut self, key: String, event: Event) -> EngineResult<()> {
        let sender = match self.senders.get(&key) {
            Some(sender) => sender.clone(),
            None => {
                let (tx, rx) = mpsc::channel(SEQUENCE_QUEUE_CAPACITY);
                self.spawn_worker(rx);
                self.senders.insert(key.clone(), tx.clone());
                tx
            }
        };
        sender.send(event).await.map_err(|_| EngineError::Transient {
            message: "sequence worker stopped accepting events".to_string(),
        })
    }

    fn spawn_worker(&mut self, mut rx: mpsc::Receiver<Event>) {
        let processor = Arc::clone(&self.processor);
        let token = self.token.clone();
        let fatal = Arc::clone(&self.fatal);
        let fatal_token = self.fatal_token.clone();
        self.workers.spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(()),
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => return Ok(()),
                    }
                };
                if let Err(error) = processor.handle_with_retry(&event, &token).await {
                    *fatal.lock().await = Some(error);
                    fatal_token.cancel();
                    return Err(EngineError::Transient {
                        message: "sequence worker stopped after fatal handler error".to_string(),
                    });
                }
            }
        });
    }

    /// Cancelled once a worker hits a non-transient failure.
    fn fatal_token(&self) -> CancellationToken {
        self.fatal_token.clone()
    }

    async fn take_fatal(&self) -> EngineError {
        self.fatal
            .lock()
            .await
            .take()
            .unwrap_or_else(|| EngineError::Transient {
                message: "sequence worker failed".to_string(),
            })
    }

    /// Close all queues and wait for the workers to drain.
    async fn shutdown(mut self) -> EngineResult<()> {
        self.senders.clear();
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(_) => {}
                Err(error) => {
                    return Err(EngineError::Transient {
                        message: format!("sequence worker panicked: {error}"),
                    })
                }
            }
        }
        if let Some(error) = self.fatal.lock().await.take() {
            return Err(error);
        }
        Ok(())
    }
}
