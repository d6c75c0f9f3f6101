//! HTTP client for EventSourcingDB-compatible stores.
//!
//! All requests carry `Authorization: Bearer <token>` and JSON bodies.
//! Streaming endpoints (read/observe/query) are decoded as newline-delimited
//! `{type, payload}` frames; non-200 statuses map onto the error taxonomy in
//! [`crate::error`].

use std::env;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};
use crate::event::{Event, EventCandidate};
use crate::health::Health;
use crate::options::ReadOptions;
use crate::precondition::Precondition;
use crate::stream::{Charset, LineBuffer, StreamFrame};

/// Response type tag confirming a ping.
pub const PING_RECEIVED: &str = "io.eventsourcingdb.api.ping-received";
/// Response type tag confirming a verified API token.
pub const API_TOKEN_VERIFIED: &str = "io.eventsourcingdb.api.api-token-verified";

/// A finite (read) or infinite (observe) stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = ClientResult<Event>> + Send>>;
/// A stream of query result rows; per-row failures do not end the stream.
pub type RowStream = Pin<Box<dyn Stream<Item = ClientResult<Value>> + Send>>;

/// Connection settings for the event store.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URI of the store, e.g. `http://localhost:3000`.
    pub base_url: String,
    /// Bearer token presented on every request.
    pub api_token: String,
    /// Timeout for non-streaming requests. Streaming requests are bounded
    /// only by their cancellation token.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Load settings from `EVENT_STORE_URL` and `EVENT_STORE_API_TOKEN`.
    pub fn from_env() -> ClientResult<Self> {
        let base_url = env::var("EVENT_STORE_URL").map_err(|_| ClientError::InvalidUsage {
            message: "EVENT_STORE_URL is not set".to_string(),
        })?;
        let api_token = env::var("EVENT_STORE_API_TOKEN").map_err(|_| ClientError::InvalidUsage {
            message: "EVENT_STORE_API_TOKEN is not set".to_string(),
        })?;
        Ok(Self::new(base_url, api_token))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// The subset of the store API consumed by the command router, the
/// immediate publisher, and the event-handling processors. Implemented by
/// [`EventStoreClient`] and by in-memory test stores.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Finite read of a subject's history. Events arrive in stream order.
    async fn read(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream>;

    /// Infinite observation of a subject. The stream never ends normally;
    /// a server-side close surfaces as a transport error.
    async fn observe(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream>;

    /// Atomically append candidates subject to the given preconditions.
    /// Precondition violation surfaces as a conflict (HTTP 409).
    async fn write(
        &self,
        candidates: Vec<EventCandidate>,
        preconditions: Vec<Precondition>,
    ) -> ClientResult<Vec<Event>>;
}

/// HTTP implementation of the store protocol.
pub struct EventStoreClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl EventStoreClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(ClientError::from)?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(self.url(path))
            .bearer_auth(&self.config.api_token)
            .timeout(self.config.request_timeout)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(self.url(path))
            .bearer_auth(&self.config.api_token)
    }

    async fn expect_ok(response: Response) -> ClientResult<Response> {
        let status = response.status().as_u16();
        if status == 200 {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::from_status(status, body))
        }
    }

    /// GET `/api/v1/ping`; succeeds iff the response carries the
    /// `ping-received` tag.
    pub async fn ping(&self) -> ClientResult<()> {
        let response = Self::expect_ok(self.get("/api/v1/ping").send().await?).await?;
        let body: Value = response.json().await?;
        if body["type"] == PING_RECEIVED {
            Ok(())
        } else {
            Err(ClientError::Transport {
                message: format!("unexpected ping response type: {}", body["type"]),
            })
        }
    }

    /// POST `/api/v1/verify-api-token`; succeeds iff the response carries
    /// the `api-token-verified` tag. An invalid token surfaces as the 401
    /// client-error kind.
    pub async fn verify_api_token(&self) -> ClientResult<()> {
        let response = Self::expect_ok(
            self.post("/api/v1/verify-api-token")
                .timeout(self.config.request_timeout)
                .json(&json!({}))
                .send()
                .await?,
        )
        .await?;
        let body: Value = response.json().await?;
        if body["type"] == API_TOKEN_VERIFIED {
            Ok(())
        } else {
            Err(ClientError::Transport {
                message: format!("unexpected verification response type: {}", body["type"]),
            })
        }
    }

    /// GET `/api/v1/health`.
    pub async fn health(&self) -> ClientResult<Health> {
        let response = Self::expect_ok(self.get("/api/v1/health").send().await?).await?;
        Ok(response.json().await?)
    }

    /// POST `/api/v1/write-events`. The store appends all candidates or
    /// none; a violated precondition yields HTTP 409.
    pub async fn write_events(
        &self,
        candidates: Vec<EventCandidate>,
        preconditions: Vec<Precondition>,
    ) -> ClientResult<Vec<Event>> {
        let body = json!({
            "events": candidates,
            "preconditions": preconditions,
        });
        let response = Self::expect_ok(
            self.post("/api/v1/write-events")
                .timeout(self.config.request_timeout)
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }

    /// POST `/api/v1/read-events`: a finite stream of the subject's events.
    pub async fn read_events(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        let body = json!({"subject": subject, "options": options.to_wire(false)?});
        let response =
            Self::expect_ok(self.post("/api/v1/read-events").json(&body).send().await?).await?;
        Ok(Self::event_frames(response, token, false))
    }

    /// POST `/api/v1/observe-events`: an infinite stream. A normal
    /// end-of-body is re-surfaced as a transport failure.
    pub async fn observe_events(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        let body = json!({"subject": subject, "options": options.to_wire(true)?});
        let response = Self::expect_ok(
            self.post("/api/v1/observe-events")
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(Self::event_frames(response, token, true))
    }

    /// POST `/api/v1/run-eventql-query`: streams result rows. A row that
    /// fails to decode yields an error item without ending the stream.
    pub async fn run_query(
        &self,
        query: &str,
        token: CancellationToken,
    ) -> ClientResult<RowStream> {
        let body = json!({"query": query});
        let response = Self::expect_ok(
            self.post("/api/v1/run-eventql-query")
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        let charset = charset_of(&response);
        let mut frames = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new(charset);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        yield Err(ClientError::Interrupted);
                        return;
                    }
                    chunk = frames.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for line in lines.push(&bytes) {
                                match StreamFrame::parse(&line) {
                                    Ok(frame) => match frame.frame_type.as_str() {
                                        "row" => yield Ok(frame.payload),
                                        "error" => yield Err(ClientError::Marshalling {
                                            message: frame.error_message(),
                                        }),
                                        _ => {}
                                    },
                                    Err(e) => yield Err(e),
                                }
                            }
                        }
                        Some(Err(e)) => {
                            yield Err(e.into());
                            return;
                        }
                        None => return,
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Decode the body of a read/observe response into event frames.
    /// Informational frames are skipped; an error frame or malformed frame
    /// aborts the stream. When `endless` is set, a normal end-of-body is a
    /// transport failure.
    fn event_frames(response: Response, token: CancellationToken, endless: bool) -> EventStream {
        let charset = charset_of(&response);
        let mut body = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new(charset);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::debug!("event stream cancelled by caller");
                        yield Err(ClientError::Interrupted);
                        return;
                    }
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for line in lines.push(&bytes) {
                                match decode_event_frame(&line) {
                                    Ok(Some(event)) => yield Ok(event),
                                    Ok(None) => {}
                                    Err(e) => {
                                        yield Err(e);
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            yield Err(e.into());
                            return;
                        }
                        None => {
                            if let Some(line) = lines.finish() {
                                match decode_event_frame(&line) {
                                    Ok(Some(event)) => yield Ok(event),
                                    Ok(None) => {}
                                    Err(e) => {
                                        yield Err(e);
                                        return;
                                    }
                                }
                            }
                            if endless {
                                yield Err(ClientError::Transport {
                                    message: "observe stream ended unexpectedly".to_string(),
                                });
                            }
                            return;
                        }
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

fn charset_of(response: &Response) -> Charset {
    Charset::from_content_type(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    )
}

fn decode_event_frame(line: &str) -> ClientResult<Option<Event>> {
    let frame = StreamFrame::parse(line)?;
    match frame.frame_type.as_str() {
        "event" => {
            let event =
                serde_json::from_value(frame.payload).map_err(|e| ClientError::Marshalling {
                    message: format!("malformed event frame: {e}"),
                })?;
            Ok(Some(event))
        }
        "error" => Err(ClientError::Transport {
            message: frame.error_message(),
        }),
        _ => Ok(None),
    }
}

#[async_trait::async_trait]
impl EventStore for EventStoreClient {
    async fn read(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        self.read_events(subject, options, token).await
    }

    async fn observe(
        &self,
        subject: &str,
        options: ReadOptions,
        token: CancellationToken,
    ) -> ClientResult<EventStream> {
        self.observe_events(subject, options, token).await
    }

    async fn write(
        &self,
        candidates: Vec<EventCandidate>,
        preconditions: Vec<Precondition>,
    ) -> ClientResult<Vec<Event>> {
        self.write_events(candidates, preconditions).await
    }
}
