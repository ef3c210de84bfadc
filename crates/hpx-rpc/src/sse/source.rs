//! Reconnecting event source.
//!
//! [`EventSource`] spawns a background driver that opens the stream through
//! an [`HttpFetch`], feeds body chunks through an [`EventParser`], and hands
//! messages to an [`EventSourceHandler`]. Failures are retried with backoff
//! until the reconnect budget is spent. The returned [`EventSourceHandle`]
//! observes the driver state and can dispose it.
//!
//! ```text
//! EventSource::new(request, fetch).spawn(handler)
//!   └─ tokio::spawn(driver)
//!        Idle ─► Connecting ─► Open ─► (Erroring ─► Connecting)* ─► Disposed
//!                    ▲           │
//!                    └─ Paused ◄─┘  (host hidden)
//! ```

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::Value;
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    config::EventSourceConfig,
    parse::{EventParser, Message, MessageSink},
};
use crate::{
    error::{RpcError, RpcResult},
    fetch::{FetchRequest, FetchResponse, HttpFetch},
    link::HeaderSource,
};

const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");
const EVENT_STREAM: &str = "text/event-stream";

// ---------------------------------------------------------------------------
// Host visibility
// ---------------------------------------------------------------------------

/// Foreground/background state of the host application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Broadcasts host visibility changes to every live event source.
///
/// Sources subscribe when spawned and drop their subscription when disposed.
#[derive(Clone, Debug)]
pub struct VisibilityNotifier {
    tx: Arc<watch::Sender<Visibility>>,
}

impl VisibilityNotifier {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(Visibility::Visible)),
        }
    }

    /// Publish a new visibility state.
    pub fn set(&self, visibility: Visibility) {
        self.tx.send_if_modified(|current| {
            let changed = *current != visibility;
            *current = visibility;
            changed
        });
    }

    pub fn current(&self) -> Visibility {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }

    /// Number of live subscriptions.
    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for VisibilityNotifier {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State and handler contract
// ---------------------------------------------------------------------------

/// Event source lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Created, driver not started yet.
    Idle,
    /// Waiting for response headers.
    Connecting { attempt: u32 },
    /// Headers accepted, reading the body.
    Open { attempt: u32 },
    /// Waiting out the delay before the next attempt.
    Erroring { attempt: u32 },
    /// Connection aborted while the host is hidden.
    Paused,
    /// Terminal. No further callbacks or transitions.
    Disposed,
}

impl SourceState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed)
    }
}

/// Whether the source should keep reading after a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageFlow {
    Continue,
    /// Dispose the source and call [`EventSourceHandler::on_close`].
    Stop,
}

/// Handler verdict for a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Use the server `retry` value if any, otherwise exponential backoff.
    Default,
    /// Retry after the given delay.
    After(Duration),
    /// Give up and report the error as fatal.
    Stop,
}

/// Callbacks from the event source driver.
///
/// All methods run on the driver task, one at a time.
pub trait EventSourceHandler: Send + 'static {
    /// Inspect response headers before the body is read.
    ///
    /// Returning an error fails the attempt. The default rejects responses
    /// that are not `text/event-stream`.
    fn on_open(&mut self, _status: StatusCode, headers: &HeaderMap) -> RpcResult<()> {
        validate_event_stream(headers)
    }

    fn on_message(&mut self, message: Message) -> MessageFlow;

    /// Decide how to handle failure number `failures` (1-based).
    ///
    /// Only called while the reconnect budget is not yet spent.
    fn on_error(&mut self, _error: &RpcError, _failures: u32) -> RetryDecision {
        RetryDecision::Default
    }

    /// The connection went away and a new one will be attempted.
    fn on_interrupted(&mut self) {}

    /// The stream ended without error.
    fn on_close(&mut self) {}

    /// The source gave up.
    fn on_fatal(&mut self, _error: RpcError) {}
}

/// Reject responses that declare a content type other than
/// `text/event-stream`. A missing header is accepted.
///
/// # Errors
///
/// Returns an internal server error naming the actual content type.
pub fn validate_event_stream(headers: &HeaderMap) -> RpcResult<()> {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return Ok(());
    };
    let content_type = value.to_str().unwrap_or_default();
    if content_type.contains(EVENT_STREAM) {
        return Ok(());
    }
    Err(RpcError::internal(format!(
        "Expected content-type to be {EVENT_STREAM}, got {content_type:?}"
    )))
}

// ---------------------------------------------------------------------------
// Public API: EventSource
// ---------------------------------------------------------------------------

/// Request template for every connection attempt.
#[derive(Clone, Debug)]
pub struct SourceRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<bytes::Bytes>,
    /// Headers re-resolved before every reconnect and merged over `headers`.
    pub refresh_headers: Option<HeaderSource>,
}

impl SourceRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            refresh_headers: None,
        }
    }
}

/// Builder for a reconnecting event source.
pub struct EventSource {
    request: SourceRequest,
    fetch: Arc<dyn HttpFetch>,
    config: EventSourceConfig,
    signal: CancellationToken,
    visibility: Option<watch::Receiver<Visibility>>,
}

impl EventSource {
    pub fn new(request: SourceRequest, fetch: Arc<dyn HttpFetch>) -> Self {
        Self {
            request,
            fetch,
            config: EventSourceConfig::default(),
            signal: CancellationToken::new(),
            visibility: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: EventSourceConfig) -> Self {
        self.config = config;
        self
    }

    /// Token that disposes the source when cancelled.
    #[must_use]
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    /// Follow host visibility changes.
    #[must_use]
    pub fn visibility(mut self, visibility: watch::Receiver<Visibility>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Start the driver task.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn spawn<H: EventSourceHandler>(self, handler: H) -> RpcResult<EventSourceHandle> {
        self.config.validate().map_err(RpcError::config)?;

        let (state_tx, state_rx) = watch::channel(SourceState::Idle);
        let handle = EventSourceHandle {
            signal: self.signal.clone(),
            state: state_rx,
        };

        let parser = EventParser::with_decoding(self.config.decoding);
        let visibility = self.visibility.filter(|_| self.config.pause_when_hidden);
        let driver = Driver {
            request: self.request,
            fetch: self.fetch,
            config: self.config,
            handler,
            signal: self.signal,
            visibility,
            state: state_tx,
            parser,
            cursor: Cursor::default(),
            attempt: 0,
            failures: 0,
        };
        tokio::spawn(driver.run());

        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// EventSourceHandle
// ---------------------------------------------------------------------------

/// Clone-able handle for observing and disposing a running event source.
#[derive(Clone, Debug)]
pub struct EventSourceHandle {
    signal: CancellationToken,
    state: watch::Receiver<SourceState>,
}

impl EventSourceHandle {
    /// Dispose the source. Safe to call more than once.
    pub fn close(&self) {
        self.signal.cancel();
    }

    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_disposed()
    }

    /// Wait until the driver reaches [`SourceState::Disposed`].
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(SourceState::is_disposed).await;
    }
}

// ---------------------------------------------------------------------------
// Internal: per-connection cursor
// ---------------------------------------------------------------------------

/// Resumption data that survives reconnects.
#[derive(Debug, Default)]
struct Cursor {
    last_event_id: Option<String>,
    server_retry: Option<Duration>,
}

struct CursorSink<'a> {
    cursor: &'a mut Cursor,
    messages: Vec<Message>,
}

impl MessageSink for CursorSink<'_> {
    fn on_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn on_id(&mut self, id: &str) {
        self.cursor.last_event_id = (!id.is_empty()).then(|| id.to_string());
    }

    fn on_retry(&mut self, retry: u64) {
        self.cursor.server_retry = Some(Duration::from_millis(retry));
    }
}

// ---------------------------------------------------------------------------
// Internal: background driver
// ---------------------------------------------------------------------------

enum AttemptEnd {
    /// The server ended the body.
    Closed,
    /// The handler asked to stop.
    Stopped,
    Failed(RpcError),
}

enum Interruption {
    Disposed,
    Hidden,
}

struct Driver<H> {
    request: SourceRequest,
    fetch: Arc<dyn HttpFetch>,
    config: EventSourceConfig,
    handler: H,
    signal: CancellationToken,
    visibility: Option<watch::Receiver<Visibility>>,
    state: watch::Sender<SourceState>,
    parser: EventParser,
    cursor: Cursor,
    attempt: u32,
    failures: u32,
}

impl<H: EventSourceHandler> Driver<H> {
    async fn run(mut self) {
        loop {
            if self.is_hidden() {
                self.set_state(SourceState::Paused);
                debug!(url = %self.request.url, "Event source paused while host is hidden");
                if !self.wait_visible().await {
                    return self.dispose();
                }
            }

            self.attempt += 1;
            let attempt = self.attempt;
            self.set_state(SourceState::Connecting { attempt });
            info!(url = %self.request.url, attempt, "Event source connecting");

            let end = match build_request(&self.request, &self.cursor, attempt).await {
                Ok(request) => {
                    let connect = run_attempt(
                        self.fetch.as_ref(),
                        request,
                        self.config.connect_timeout,
                        &mut self.handler,
                        &mut self.parser,
                        &mut self.cursor,
                        &self.state,
                        attempt,
                    );
                    tokio::select! {
                        biased;
                        _ = self.signal.cancelled() => Err(Interruption::Disposed),
                        _ = wait_hidden(self.visibility.as_mut()) => Err(Interruption::Hidden),
                        end = connect => Ok(end),
                    }
                }
                Err(err) => Ok(AttemptEnd::Failed(err)),
            };

            let err = match end {
                Err(Interruption::Disposed) => return self.dispose(),
                Err(Interruption::Hidden) => {
                    info!(url = %self.request.url, "Host hidden, closing event source connection");
                    self.parser.reset(true);
                    self.handler.on_interrupted();
                    continue;
                }
                Ok(AttemptEnd::Stopped) => {
                    self.dispose();
                    return self.handler.on_close();
                }
                Ok(AttemptEnd::Closed) if !self.config.retries_enabled() => {
                    debug!(url = %self.request.url, "Event source body ended");
                    self.dispose();
                    return self.handler.on_close();
                }
                Ok(AttemptEnd::Closed) => {
                    RpcError::service_unavailable("SSE connection closed unexpectedly")
                }
                Ok(AttemptEnd::Failed(err)) => err,
            };

            self.parser.reset(false);
            let Some(delay) = self.next_delay(&err) else {
                return;
            };

            self.handler.on_interrupted();
            self.set_state(SourceState::Erroring { attempt });
            warn!(
                url = %self.request.url,
                error = %err,
                failures = self.failures,
                delay_ms = delay.as_millis() as u64,
                "Event source reconnecting after backoff"
            );

            tokio::select! {
                biased;
                _ = self.signal.cancelled() => return self.dispose(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Account for a failure and return the delay before the next attempt.
    ///
    /// Returns `None` once the source has given up; the handler has already
    /// been told.
    fn next_delay(&mut self, err: &RpcError) -> Option<Duration> {
        if !self.config.retries_enabled() {
            self.fail(err.clone());
            return None;
        }

        self.failures += 1;
        if self.failures > self.config.max_reconnects {
            error!(
                url = %self.request.url,
                attempts = self.attempt,
                error = %err,
                "Max event source reconnect attempts exceeded"
            );
            self.fail(RpcError::internal("Max reconnection attempts reached").with_cause(err));
            return None;
        }

        let requested = match self.handler.on_error(err, self.failures) {
            RetryDecision::Stop => {
                warn!(url = %self.request.url, "Handler declined to retry, closing");
                self.fail(err.clone());
                return None;
            }
            RetryDecision::After(delay) => Some(delay),
            RetryDecision::Default => None,
        };
        Some(
            self.config
                .reconnect_delay(self.failures, self.cursor.server_retry, requested),
        )
    }

    fn is_hidden(&self) -> bool {
        self.visibility
            .as_ref()
            .is_some_and(|rx| *rx.borrow() == Visibility::Hidden)
    }

    /// Returns `false` if the source was disposed while waiting.
    async fn wait_visible(&mut self) -> bool {
        let Some(rx) = self.visibility.as_mut() else {
            return true;
        };
        loop {
            if *rx.borrow_and_update() == Visibility::Visible {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.signal.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    fn set_state(&self, next: SourceState) {
        self.state.send_if_modified(|current| {
            if current.is_disposed() {
                return false;
            }
            *current = next;
            true
        });
    }

    fn dispose(&mut self) {
        self.set_state(SourceState::Disposed);
        self.visibility = None;
        debug!(url = %self.request.url, "Event source disposed");
    }

    fn fail(&mut self, err: RpcError) {
        self.dispose();
        self.handler.on_fatal(err);
    }
}

async fn wait_hidden(visibility: Option<&mut watch::Receiver<Visibility>>) {
    if let Some(rx) = visibility {
        loop {
            if *rx.borrow_and_update() == Visibility::Hidden {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await;
}

/// Build the request for connection attempt `attempt` (1-based).
///
/// Reconnects re-resolve dynamic headers and carry the last event id.
async fn build_request(
    request: &SourceRequest,
    cursor: &Cursor,
    attempt: u32,
) -> RpcResult<FetchRequest> {
    let mut headers = request.headers.clone();
    if attempt > 1
        && let Some(source) = &request.refresh_headers
    {
        for (name, value) in source.resolve().await?.iter() {
            headers.insert(name.clone(), value.clone());
        }
    }

    if !headers.contains_key(header::ACCEPT) {
        headers.insert(header::ACCEPT, HeaderValue::from_static(EVENT_STREAM));
    }

    match cursor
        .last_event_id
        .as_deref()
        .and_then(|id| HeaderValue::from_str(id).ok())
    {
        Some(id) => {
            headers.insert(LAST_EVENT_ID, id);
        }
        None => {
            headers.remove(LAST_EVENT_ID);
        }
    }

    Ok(FetchRequest {
        url: request.url.clone(),
        method: request.method.clone(),
        headers,
        body: request.body.clone(),
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt<H: EventSourceHandler>(
    fetch: &dyn HttpFetch,
    request: FetchRequest,
    connect_timeout: Option<Duration>,
    handler: &mut H,
    parser: &mut EventParser,
    cursor: &mut Cursor,
    state: &watch::Sender<SourceState>,
    attempt: u32,
) -> AttemptEnd {
    let response = match connect_timeout {
        Some(limit) => match timeout(limit, fetch.fetch(request)).await {
            Ok(response) => response,
            Err(_) => Err(RpcError::timeout(limit)),
        },
        None => fetch.fetch(request).await,
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => return AttemptEnd::Failed(err),
    };

    if !response.status.is_success() {
        return AttemptEnd::Failed(open_status_error(response).await);
    }
    if let Err(err) = handler.on_open(response.status, &response.headers) {
        return AttemptEnd::Failed(err);
    }

    state.send_if_modified(|current| {
        if current.is_disposed() {
            return false;
        }
        *current = SourceState::Open { attempt };
        true
    });
    info!(attempt, "Event source open");

    let mut body = response.body;
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return AttemptEnd::Failed(err),
        };

        let mut sink = CursorSink {
            cursor: &mut *cursor,
            messages: Vec::new(),
        };
        parser.feed(&chunk, &mut sink);
        for message in sink.messages {
            if handler.on_message(message) == MessageFlow::Stop {
                return AttemptEnd::Stopped;
            }
        }
    }

    AttemptEnd::Closed
}

async fn open_status_error(response: FetchResponse) -> RpcError {
    let status = response.status.as_u16();
    let body = response
        .bytes()
        .await
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .unwrap_or(Value::Null);
    RpcError::from_response(status, &body)
        .unwrap_or_else(|| RpcError::internal(format!("Unexpected status {status}")))
}
