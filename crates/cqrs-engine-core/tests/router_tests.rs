//! End-to-end command routing against the in-memory store, built around a
//! small book-lending domain.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cqrs_engine_client::{
    ClientResult, Event, EventCandidate, EventStore, EventStream, Precondition, ReadOption,
    ReadOptions,
};
use cqrs_engine_core::testing::InMemoryEventStore;
use cqrs_engine_core::{
    CacheSettings, CacheType, Command, CommandHandler, CommandRouter, CommandRoutingConfig,
    EngineError, EventPayload, MetaData, PropagationMode, PropagationSettings, SourcingMode,
    StateRebuildingHandler, SubjectCondition,
};

// ---------------------------------------------------------------------------
// Domain fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BookPurchased {
    id: u32,
    isbn: String,
    title: String,
    author: String,
    pages: u32,
}

impl EventPayload for BookPurchased {
    fn event_type() -> &'static str {
        "com.example.library.book-purchased"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BookLent {
    id: u32,
    due_at: String,
}

impl EventPayload for BookLent {
    fn event_type() -> &'static str {
        "com.example.library.book-lent"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LoanOpened {
    member: String,
}

impl EventPayload for LoanOpened {
    fn event_type() -> &'static str {
        "com.example.library.loan-opened"
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Book {
    isbn: String,
    lent: bool,
    due_at: Option<String>,
}

struct PurchaseBook {
    id: u32,
    isbn: String,
    title: String,
    author: String,
    pages: u32,
}

impl Command for PurchaseBook {
    type Result = u32;

    fn subject(&self) -> String {
        format!("/books/{}", self.id)
    }

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::Pristine
    }
}

struct BorrowBook {
    id: u32,
}

impl Command for BorrowBook {
    type Result = String;

    fn subject(&self) -> String {
        format!("/books/{}", self.id)
    }

    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::Exists
    }
}

struct ExamineBook {
    id: u32,
}

impl Command for ExamineBook {
    type Result = Option<Book>;

    fn subject(&self) -> String {
        format!("/books/{}", self.id)
    }
}

const DUE_AT: &str = "2024-02-01T00:00:00Z";

fn build_router(store: Arc<dyn EventStore>, config: CommandRoutingConfig) -> CommandRouter {
    CommandRouter::builder(store)
        .with_config(config)
        .register_event::<BookPurchased>()
        .register_event::<BookLent>()
        .register_event::<LoanOpened>()
        .on_event(StateRebuildingHandler::<Book, BookPurchased>::FromEvent(
            Box::new(|_, event| Book {
                isbn: event.isbn.clone(),
                lent: false,
                due_at: None,
            }),
        ))
        .on_event(StateRebuildingHandler::<Book, BookLent>::FromEvent(
            Box::new(|book, event| {
                let book = book.expect("a book must be purchased before it is lent");
                Book {
                    lent: true,
                    due_at: Some(event.due_at.clone()),
                    ..book
                }
            }),
        ))
        .on_command(
            SourcingMode::Recursive,
            CommandHandler::<Book, PurchaseBook>::WithPublisher(Box::new(|command, publisher| {
                publisher.publish(BookPurchased {
                    id: command.id,
                    isbn: command.isbn.clone(),
                    title: command.title.clone(),
                    author: command.author.clone(),
                    pages: command.pages,
                })?;
                Ok(command.id)
            })),
        )
        .on_command(
            SourcingMode::Recursive,
            CommandHandler::<Book, BorrowBook>::WithInstance(Box::new(
                |command, book, publisher| {
                    let book = book.ok_or_else(|| EngineError::CommandRejected {
                        message: format!("book {} is unknown", command.id),
                    })?;
                    if book.lent {
                        return Err(EngineError::CommandRejected {
                            message: format!("book {} is already lent", command.id),
                        });
                    }
                    publisher.publish(BookLent {
                        id: command.id,
                        due_at: DUE_AT.to_string(),
                    })?;
                    Ok(DUE_AT.to_string())
                },
            )),
        )
        .on_command(
            SourcingMode::Recursive,
            CommandHandler::<Book, ExamineBook>::WithInstance(Box::new(|_, book, _| Ok(book))),
        )
        .build()
        .unwrap()
}

fn default_router(store: Arc<dyn EventStore>) -> CommandRouter {
    build_router(store, CommandRoutingConfig::default())
}

fn purchase(id: u32) -> PurchaseBook {
    PurchaseBook {
        id,
        isbn: "978-0".into(),
        title: "The Pragmatic Programmer".into(),
        author: "Hunt & Thomas".into(),
        pages: 352,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pristine_purchase_writes_one_event_with_a_pristine_precondition() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = default_router(store.clone());

    let result = router.send(purchase(42), MetaData::new()).await.unwrap();
    assert_eq!(result, 42);

    let events = store.stored_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, "/books/42");
    assert_eq!(events[0].event_type, BookPurchased::event_type());
    assert_eq!(events[0].data["payload"]["isbn"], "978-0");
    assert_eq!(events[0].data["payload"]["pages"], 352);

    let preconditions = store.last_write_preconditions().await;
    assert_eq!(
        preconditions,
        vec![Precondition::SubjectIsPristine {
            subject: "/books/42".into()
        }]
    );
}

#[tokio::test]
async fn borrow_after_purchase_sources_state_and_pins_the_sourced_event_id() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = default_router(store.clone());

    router.send(purchase(42), MetaData::new()).await.unwrap();
    let due = router
        .send(BorrowBook { id: 42 }, MetaData::new())
        .await
        .unwrap();
    assert_eq!(due, DUE_AT);

    let events = store.stored_events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event_type, BookLent::event_type());
    assert_eq!(events[1].data["payload"]["due_at"], DUE_AT);

    let preconditions = store.last_write_preconditions().await;
    assert!(preconditions.contains(&Precondition::SubjectIsOnEventId {
        subject: "/books/42".into(),
        event_id: "0".into(),
    }));
    // The lent event targets the sourced subject itself, so no pristine
    // assertion is synthesized.
    assert!(!preconditions
        .iter()
        .any(|p| matches!(p, Precondition::SubjectIsPristine { .. })));
}

#[tokio::test]
async fn double_borrow_is_rejected_without_touching_the_store() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = default_router(store.clone());

    router.send(purchase(42), MetaData::new()).await.unwrap();
    router
        .send(BorrowBook { id: 42 }, MetaData::new())
        .await
        .unwrap();
    let before = store.event_count().await;

    let err = router
        .send(BorrowBook { id: 42 }, MetaData::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CommandRejected { .. }));
    assert_eq!(store.event_count().await, before);

    // The cache still matches the store: examining the book sees the lent
    // state without a stale read.
    let book = router
        .send(ExamineBook { id: 42 }, MetaData::new())
        .await
        .unwrap()
        .unwrap();
    assert!(book.lent);
}

/// Store wrapper that appends a competing event after the first sourcing
/// read completes, so the next write runs into its precondition.
struct RacingStore {
    inner: Arc<InMemoryEventStore>,
    injected: AtomicBool,
}

#[async_trait]
impl EventStore for RacingStore {
    async fn read(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        let stream = self.inner.read(subject, options, token).await?;
        if !self.injected.swap(true, AtomicOrdering::SeqCst) {
            self.inner
                .write(
                    vec![EventCandidate::new(
                        "tag://rival",
                        subject,
                        BookLent::event_type(),
                        json!({"metadata": {}, "payload": {"id": 42, "due_at": DUE_AT}}),
                    )],
                    vec![],
                )
                .await?;
        }
        Ok(stream)
    }

    async fn observe(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        self.inner.observe(subject, options, token).await
    }

    async fn write(
        &self,
        candidates: Vec<EventCandidate>,
        preconditions: Vec<Precondition>,
    ) -> ClientResult<Vec<Event>> {
        self.inner.write(candidates, preconditions).await
    }
}

#[tokio::test]
async fn losing_a_write_race_surfaces_a_conflict_and_the_retry_sees_fresh_state() {
    let inner = Arc::new(InMemoryEventStore::new());
    inner
        .write(
            vec![EventCandidate::new(
                "tag://test",
                "/books/42",
                BookPurchased::event_type(),
                json!({"metadata": {}, "payload": {
                    "id": 42, "isbn": "978-0", "title": "T", "author": "A", "pages": 1
                }}),
            )],
            vec![],
        )
        .await
        .unwrap();

    let racing = Arc::new(RacingStore {
        inner: inner.clone(),
        injected: AtomicBool::new(false),
    });
    let router = default_router(racing);

    // The competing lent event lands between sourcing and publication, so
    // the synthesized SubjectIsOnEventId("/books/42", "0") no longer holds.
    let err = router
        .send(BorrowBook { id: 42 }, MetaData::new())
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err:?}");
    assert_eq!(inner.event_count().await, 2);

    // The retry re-sources past the cached id, picks up the rival's event,
    // and now fails on domain grounds instead.
    let err = router
        .send(BorrowBook { id: 42 }, MetaData::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CommandRejected { .. }));
}

/// Store wrapper recording each read's subject and whether it carried a
/// lower bound, to observe cache hits and misses.
struct RecordingStore {
    inner: Arc<InMemoryEventStore>,
    reads: Mutex<Vec<(String, bool)>>,
}

impl RecordingStore {
    fn new(inner: Arc<InMemoryEventStore>) -> Self {
        Self {
            inner,
            reads: Mutex::new(Vec::new()),
        }
    }

    fn reads(&self) -> Vec<(String, bool)> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for RecordingStore {
    async fn read(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        let has_lower_bound = options
            .iter()
            .any(|o| matches!(o, ReadOption::LowerBoundExclusive(_) | ReadOption::LowerBoundInclusive(_)));
        self.reads
            .lock()
            .unwrap()
            .push((subject.to_string(), has_lower_bound));
        self.inner.read(subject, options, token).await
    }

    async fn observe(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        self.inner.observe(subject, options, token).await
    }

    async fn write(
        &self,
        candidates: Vec<EventCandidate>,
        preconditions: Vec<Precondition>,
    ) -> ClientResult<Vec<Event>> {
        self.inner.write(candidates, preconditions).await
    }
}

#[tokio::test]
async fn lru_eviction_forces_a_full_sourcing_read_for_evicted_subjects() {
    let inner = Arc::new(InMemoryEventStore::new());
    let recording = Arc::new(RecordingStore::new(inner));
    let config = CommandRoutingConfig {
        cache: CacheSettings {
            cache_type: CacheType::InMemory,
            capacity: 5,
        },
        ..CommandRoutingConfig::default()
    };
    let router = build_router(recording.clone(), config);

    for id in 1..=7 {
        router.send(purchase(id), MetaData::new()).await.unwrap();
    }
    // Examining each book sources its history and populates the cache;
    // with capacity 5, subjects 1 and 2 fall out again.
    for id in 1..=7 {
        router
            .send(ExamineBook { id }, MetaData::new())
            .await
            .unwrap();
    }

    // Keys 6 and 7 are the most recent; examining book 7 again resumes
    // from the cached event id.
    router
        .send(ExamineBook { id: 7 }, MetaData::new())
        .await
        .unwrap();
    let reads = recording.reads();
    let last = reads.last().unwrap();
    assert_eq!(last.0, "/books/7");
    assert!(last.1, "cached subject must source with a lower bound");

    // Key 1 was evicted; examining book 1 re-populates with a full read.
    router
        .send(ExamineBook { id: 1 }, MetaData::new())
        .await
        .unwrap();
    let reads = recording.reads();
    let last = reads.last().unwrap();
    assert_eq!(last.0, "/books/1");
    assert!(!last.1, "evicted subject must source from the beginning");

    // Re-populated now: the next examination reads only the tail.
    router
        .send(ExamineBook { id: 1 }, MetaData::new())
        .await
        .unwrap();
    let reads = recording.reads();
    assert!(reads.last().unwrap().1);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replaying_a_subject_yields_the_instance_the_handler_saw() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = default_router(store.clone());
    router.send(purchase(42), MetaData::new()).await.unwrap();
    router
        .send(BorrowBook { id: 42 }, MetaData::new())
        .await
        .unwrap();

    let cached_view = router
        .send(ExamineBook { id: 42 }, MetaData::new())
        .await
        .unwrap();

    // A cacheless router replays the full history from scratch.
    let config = CommandRoutingConfig {
        cache: CacheSettings {
            cache_type: CacheType::None,
            capacity: 1,
        },
        ..CommandRoutingConfig::default()
    };
    let fresh_view = build_router(store.clone(), config)
        .send(ExamineBook { id: 42 }, MetaData::new())
        .await
        .unwrap();

    assert_eq!(cached_view, fresh_view);
    assert_eq!(
        fresh_view.unwrap(),
        Book {
            isbn: "978-0".into(),
            lent: true,
            due_at: Some(DUE_AT.into()),
        }
    );
}

struct OpenLoan {
    id: u32,
    member: String,
}

impl Command for OpenLoan {
    type Result = ();

    fn subject(&self) -> String {
        format!("/books/{}", self.id)
    }
}

#[tokio::test]
async fn captured_events_are_written_in_capture_order_including_relative_subjects() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = CommandRouter::builder(store.clone())
        .register_event::<BookLent>()
        .register_event::<LoanOpened>()
        .on_command(
            SourcingMode::Local,
            CommandHandler::<Book, OpenLoan>::WithPublisher(Box::new(|command, publisher| {
                publisher.publish(BookLent {
                    id: command.id,
                    due_at: DUE_AT.to_string(),
                })?;
                publisher.publish_relative(
                    "loans/1",
                    LoanOpened {
                        member: command.member.clone(),
                    },
                )?;
                Ok(())
            })),
        )
        .build()
        .unwrap();

    router
        .send(
            OpenLoan {
                id: 42,
                member: "alice".into(),
            },
            MetaData::new(),
        )
        .await
        .unwrap();

    let events = store.stored_events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].subject, "/books/42");
    assert_eq!(events[0].event_type, BookLent::event_type());
    assert_eq!(events[1].subject, "/books/42/loans/1");
    assert_eq!(events[1].event_type, LoanOpened::event_type());

    // The new descendant subject gets a pristine assertion.
    let preconditions = store.last_write_preconditions().await;
    assert!(preconditions.contains(&Precondition::SubjectIsPristine {
        subject: "/books/42/loans/1".into()
    }));
}

struct FailLate {
    id: u32,
}

impl Command for FailLate {
    type Result = ();

    fn subject(&self) -> String {
        format!("/books/{}", self.id)
    }
}

#[tokio::test]
async fn a_throwing_handler_publishes_nothing() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = CommandRouter::builder(store.clone())
        .register_event::<BookLent>()
        .on_command(
            SourcingMode::Local,
            CommandHandler::<Book, FailLate>::WithPublisher(Box::new(|command, publisher| {
                publisher.publish(BookLent {
                    id: command.id,
                    due_at: DUE_AT.to_string(),
                })?;
                Err(EngineError::CommandRejected {
                    message: "validation failed after publishing".into(),
                })
            })),
        )
        .build()
        .unwrap();

    let err = router
        .send(FailLate { id: 42 }, MetaData::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CommandRejected { .. }));
    assert_eq!(store.event_count().await, 0);
}

#[tokio::test]
async fn pristine_fails_only_on_the_exact_subject() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = default_router(store.clone());

    // A descendant event does not violate PRISTINE for the parent.
    store
        .write(
            vec![EventCandidate::new(
                "tag://test",
                "/books/42/loans/1",
                LoanOpened::event_type(),
                json!({"metadata": {}, "payload": {"member": "alice"}}),
            )],
            vec![],
        )
        .await
        .unwrap();
    router.send(purchase(42), MetaData::new()).await.unwrap();

    // A second purchase of the same subject violates it.
    let err = router.send(purchase(42), MetaData::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::SubjectAlreadyExists { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn exists_condition_fails_transiently_for_unknown_subjects() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = default_router(store.clone());

    let err = router
        .send(BorrowBook { id: 99 }, MetaData::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SubjectDoesNotExist { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn unregistered_commands_are_a_non_transient_failure() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = default_router(store.clone());

    let err = router
        .send(OpenLoan {
            id: 1,
            member: "bob".into(),
        }, MetaData::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingCommandHandler { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn command_metadata_propagates_onto_captured_events() {
    let store = Arc::new(InMemoryEventStore::new());
    let config = CommandRoutingConfig {
        metadata: PropagationSettings {
            propagation_mode: PropagationMode::Overwrite,
            propagation_keys: vec!["user".into()],
        },
        ..CommandRoutingConfig::default()
    };
    let router = build_router(store.clone(), config);

    let metadata = MetaData::from([
        ("user".to_string(), json!("alice")),
        ("secret".to_string(), json!("do-not-propagate")),
    ]);
    router.send(purchase(42), metadata).await.unwrap();

    let events = store.stored_events().await;
    assert_eq!(events[0].data["metadata"]["user"], "alice");
    assert!(events[0].data["metadata"].get("secret").is_none());
}

#[tokio::test]
async fn handler_variants_with_equal_inputs_capture_equal_events() {
    // The same domain logic registered through two different variant
    // shapes must produce identical stored sequences.
    async fn run<F>(wire: F) -> Vec<(String, String, serde_json::Value)>
    where
        F: FnOnce(Arc<InMemoryEventStore>) -> CommandRouter,
    {
        let store = Arc::new(InMemoryEventStore::new());
        let router = wire(store.clone());
        router.send(purchase(42), MetaData::new()).await.unwrap();
        router
            .send(BorrowBook { id: 42 }, MetaData::new())
            .await
            .unwrap();
        store
            .stored_events()
            .await
            .into_iter()
            .map(|e| (e.subject, e.event_type, e.data["payload"].clone()))
            .collect()
    }

    let with_instance = run(|store| default_router(store)).await;

    let with_metadata_variant = run(|store| {
        CommandRouter::builder(store)
            .register_event::<BookPurchased>()
            .register_event::<BookLent>()
            .on_event(
                StateRebuildingHandler::<Book, BookPurchased>::FromEventMetaDataSubjectAndRawEvent(
                    Box::new(|_, event, _, _, _| Book {
                        isbn: event.isbn.clone(),
                        lent: false,
                        due_at: None,
                    }),
                ),
            )
            .on_event(
                StateRebuildingHandler::<Book, BookLent>::FromEventAndMetaData(Box::new(
                    |book, event, _| {
                        let book = book.expect("a book must be purchased before it is lent");
                        Book {
                            lent: true,
                            due_at: Some(event.due_at.clone()),
                            ..book
                        }
                    },
                )),
            )
            .on_command(
                SourcingMode::Recursive,
                CommandHandler::<Book, PurchaseBook>::WithInstanceAndMetaData(Box::new(
                    |command, _, _, publisher| {
                        publisher.publish(BookPurchased {
                            id: command.id,
                            isbn: command.isbn.clone(),
                            title: command.title.clone(),
                            author: command.author.clone(),
                            pages: command.pages,
                        })?;
                        Ok(command.id)
                    },
                )),
            )
            .on_command(
                SourcingMode::Recursive,
                CommandHandler::<Book, BorrowBook>::WithInstance(Box::new(
                    |command, book, publisher| {
                        let book = book.ok_or_else(|| EngineError::CommandRejected {
                            message: format!("book {} is unknown", command.id),
                        })?;
                        if book.lent {
                            return Err(EngineError::CommandRejected {
                                message: format!("book {} is already lent", command.id),
                            });
                        }
                        publisher.publish(BookLent {
                            id: command.id,
                            due_at: DUE_AT.to_string(),
                        })?;
                        Ok(DUE_AT.to_string())
                    },
                )),
            )
            .build()
            .unwrap()
    })
    .await;

    assert_eq!(with_instance, with_metadata_variant);
}

#[tokio::test]
async fn capturer_folds_captured_events_into_the_visible_instance() {
    struct PurchaseAndBorrow {
        id: u32,
    }

    impl Command for PurchaseAndBorrow {
        type Result = bool;

        fn subject(&self) -> String {
            format!("/books/{}", self.id)
        }

        fn subject_condition(&self) -> SubjectCondition {
            SubjectCondition::Pristine
        }
    }

    let store = Arc::new(InMemoryEventStore::new());
    let router = CommandRouter::builder(store.clone())
        .register_event::<BookPurchased>()
        .register_event::<BookLent>()
        .on_event(StateRebuildingHandler::<Book, BookPurchased>::FromEvent(
            Box::new(|_, event| Book {
                isbn: event.isbn.clone(),
                lent: false,
                due_at: None,
            }),
        ))
        .on_event(StateRebuildingHandler::<Book, BookLent>::FromEvent(
            Box::new(|book, event| {
                let book = book.expect("purchase precedes lending");
                Book {
                    lent: true,
                    due_at: Some(event.due_at.clone()),
                    ..book
                }
            }),
        ))
        .on_command(
            SourcingMode::Recursive,
            CommandHandler::<Book, PurchaseAndBorrow>::WithPublisher(Box::new(
                |command, publisher| {
                    let after_purchase = publisher
                        .publish(BookPurchased {
                            id: command.id,
                            isbn: "978-0".into(),
                            title: "T".into(),
                            author: "A".into(),
                            pages: 1,
                        })?
                        .cloned()
                        .expect("instance exists after the first capture");
                    assert!(!after_purchase.lent);
                    let after_lend = publisher
                        .publish(BookLent {
                            id: command.id,
                            due_at: DUE_AT.to_string(),
                        })?
                        .cloned()
                        .expect("instance exists after the second capture");
                    Ok(after_lend.lent)
                },
            )),
        )
        .build()
        .unwrap();

    let lent = router
        .send(PurchaseAndBorrow { id: 7 }, MetaData::new())
        .await
        .unwrap();
    assert!(lent, "the capturer must fold captures into the instance");
    assert_eq!(store.event_count().await, 2);
}
