//! Integration tests for the reconnecting event source with custom handlers.

mod common;

use std::{
    cell::Cell,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{Script, ScriptedFetch, Tail};
use hpx_rpc::{
    ErrorCode, EventSourceConfig, HeaderSource, RpcError,
    sse::{EventSource, EventSourceHandler, Message, MessageFlow, RetryDecision, SourceRequest, SourceState},
};
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use tokio::{sync::oneshot, time::Instant};

/// Records every callback as a short string.
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    decision: RetryDecision,
    done: Option<oneshot::Sender<()>>,
}

impl Recorder {
    fn new(decision: RetryDecision) -> (Self, Arc<Mutex<Vec<String>>>, oneshot::Receiver<()>) {
        let events = Arc::default();
        let (tx, rx) = oneshot::channel();
        let recorder = Self {
            events: Arc::clone(&events),
            decision,
            done: Some(tx),
        };
        (recorder, events, rx)
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl EventSourceHandler for Recorder {
    fn on_message(&mut self, message: Message) -> MessageFlow {
        self.record(format!("message:{}", message.data));
        if message.data == "stop" {
            MessageFlow::Stop
        } else {
            MessageFlow::Continue
        }
    }

    fn on_error(&mut self, error: &RpcError, failures: u32) -> RetryDecision {
        self.record(format!("error:{failures}:{}", error.code()));
        self.decision
    }

    fn on_interrupted(&mut self) {
        self.record("interrupted".to_string());
    }

    fn on_close(&mut self) {
        self.record("close".to_string());
        self.finish();
    }

    fn on_fatal(&mut self, error: RpcError) {
        self.record(format!("fatal:{}", error.code()));
        self.finish();
    }
}

fn source(fetch: &ScriptedFetch, config: EventSourceConfig) -> EventSource {
    EventSource::new(
        SourceRequest::new("http://localhost:3000/events"),
        Arc::new(fetch.clone()),
    )
    .config(config)
}

#[tokio::test(start_paused = true)]
async fn test_stop_message_closes_source() {
    let fetch = ScriptedFetch::new([Script::events(
        &["event: tick\ndata: one\n\n", "data: stop\n\ndata: never\n\n"],
        Tail::Hang,
    )]);
    let (handler, events, done) = Recorder::new(RetryDecision::Default);

    let handle = source(&fetch, EventSourceConfig::default())
        .spawn(handler)
        .expect("spawn");
    done.await.expect("handler finished");
    handle.closed().await;

    assert_eq!(*events.lock(), vec!["message:one", "message:stop", "close"]);
    assert_eq!(handle.state(), SourceState::Disposed);
    assert_eq!(fetch.header(0, "accept").as_deref(), Some("text/event-stream"));
}

#[tokio::test(start_paused = true)]
async fn test_handler_can_stop_retrying() {
    let fetch = ScriptedFetch::new([Script::refused()]);
    let (handler, events, done) = Recorder::new(RetryDecision::Stop);

    source(&fetch, EventSourceConfig::new().max_reconnects(5))
        .spawn(handler)
        .expect("spawn");
    done.await.expect("handler finished");

    assert_eq!(
        *events.lock(),
        vec!["error:1:SERVICE_UNAVAILABLE", "fatal:SERVICE_UNAVAILABLE"]
    );
    assert_eq!(fetch.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handler_delay_override() {
    let fetch = ScriptedFetch::new([
        Script::refused(),
        Script::events(&["data: stop\n\n"], Tail::End),
    ]);
    let (handler, events, done) = Recorder::new(RetryDecision::After(Duration::from_secs(10)));

    let start = Instant::now();
    source(&fetch, EventSourceConfig::new().max_reconnects(1))
        .spawn(handler)
        .expect("spawn");
    done.await.expect("handler finished");

    assert!(start.elapsed() >= Duration::from_secs(10));
    assert_eq!(
        *events.lock(),
        vec![
            "error:1:SERVICE_UNAVAILABLE",
            "interrupted",
            "message:stop",
            "close"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_budget_is_exact() {
    let fetch = ScriptedFetch::default();
    let (handler, events, done) = Recorder::new(RetryDecision::Default);

    source(&fetch, EventSourceConfig::new().max_reconnects(3))
        .spawn(handler)
        .expect("spawn");
    done.await.expect("handler finished");

    // One initial attempt plus three reconnects.
    assert_eq!(fetch.request_count(), 4);
    assert_eq!(events.lock().last().map(String::as_str), Some("fatal:INTERNAL_SERVER_ERROR"));
}

#[tokio::test(start_paused = true)]
async fn test_close_disposes_without_callbacks() {
    let fetch = ScriptedFetch::new([Script::events(&["data: one\n\n"], Tail::Hang)]);
    let (handler, events, _done) = Recorder::new(RetryDecision::Default);

    let handle = source(&fetch, EventSourceConfig::default())
        .spawn(handler)
        .expect("spawn");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handle.state().is_open());

    handle.close();
    handle.close();
    handle.closed().await;

    assert!(handle.is_closed());
    assert_eq!(*events.lock(), vec!["message:one"]);
}

#[tokio::test(start_paused = true)]
async fn test_headers_refreshed_on_reconnect() {
    let fetch = ScriptedFetch::new([
        Script::refused(),
        Script::events(&["data: stop\n\n"], Tail::End),
    ]);
    let resolved = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resolved);
    let refresh = HeaderSource::resolver(move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            let mut headers = HeaderMap::new();
            headers.insert("x-token", HeaderValue::from(attempt));
            Ok::<_, RpcError>(headers)
        }
    });

    let mut request = SourceRequest::new("http://localhost:3000/events");
    request.headers.insert("x-token", HeaderValue::from_static("initial"));
    request.refresh_headers = Some(refresh);

    let (handler, _events, done) = Recorder::new(RetryDecision::Default);
    EventSource::new(request, Arc::new(fetch.clone()))
        .config(EventSourceConfig::new().max_reconnects(1))
        .spawn(handler)
        .expect("spawn");
    done.await.expect("handler finished");

    assert_eq!(fetch.header(0, "x-token").as_deref(), Some("initial"));
    assert_eq!(fetch.header(1, "x-token").as_deref(), Some("1"));
    assert_eq!(resolved.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected() {
    let fetch = ScriptedFetch::default();
    let (handler, _events, _done) = Recorder::new(RetryDecision::Default);

    let err = source(
        &fetch,
        EventSourceConfig::new().reconnect_backoff_factor(0.5),
    )
    .spawn(handler)
    .unwrap_err();
    assert_eq!(err.code(), &ErrorCode::BadRequest);
    assert!(err.message().starts_with("Invalid configuration"));
}

/// Handler that is `Send` but not `Sync`.
struct CountingHandler {
    seen: Cell<u32>,
    done: Option<oneshot::Sender<u32>>,
}

impl EventSourceHandler for CountingHandler {
    fn on_message(&mut self, _message: Message) -> MessageFlow {
        self.seen.set(self.seen.get() + 1);
        MessageFlow::Continue
    }

    fn on_close(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self.seen.get());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_handler_need_not_be_sync() {
    let fetch = ScriptedFetch::new([Script::events(&["data: a\n\ndata: b\n\n"], Tail::End)]);
    let (tx, rx) = oneshot::channel();
    let handler = CountingHandler {
        seen: Cell::new(0),
        done: Some(tx),
    };

    let mut request = SourceRequest::new("http://localhost:3000/events");
    request.refresh_headers = Some(HeaderSource::default());
    EventSource::new(request, Arc::new(fetch.clone()))
        .spawn(handler)
        .expect("spawn");

    assert_eq!(rx.await.expect("handler closed"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_saturated_backoff_keeps_driver_alive() {
    let fetch = ScriptedFetch::default();
    let (handler, events, _done) = Recorder::new(RetryDecision::Default);

    let handle = source(
        &fetch,
        EventSourceConfig::new()
            .max_reconnects(3)
            .reconnect_initial_delay(Duration::MAX)
            .reconnect_max_delay(Duration::MAX),
    )
    .spawn(handler)
    .expect("spawn");

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(handle.state(), SourceState::Erroring { attempt: 1 });
    assert_eq!(
        *events.lock(),
        vec!["error:1:SERVICE_UNAVAILABLE", "interrupted"]
    );

    handle.close();
    handle.closed().await;
    assert_eq!(handle.state(), SourceState::Disposed);
    assert_eq!(fetch.request_count(), 1);
}
