//! Push-to-pull adapter between the event source and the consumer.
//!
//! The event source pushes decoded payloads into a [`StreamBridge`]; the
//! consumer pulls them from the [`ValueStream`] returned by
//! [`StreamBridge::into_stream`]. Buffered values are always drained before
//! completion or a terminal error is reported.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{Stream, StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use super::{parse::Message, source::MessageFlow};
use crate::{
    error::{RpcError, RpcResult},
    meta::{RpcValue, deserialize_payload, envelope_body},
};

/// Data payload that ends a stream without a JSON body.
const DONE_MARKER: &str = "[DONE]";

/// Object keys that mark the final message when set to `true`.
const END_KEYS: [&str; 4] = ["done", "finish", "end", "complete"];

// ---------------------------------------------------------------------------
// ValueStream
// ---------------------------------------------------------------------------

/// Stream of values produced by a streaming call.
///
/// Dropping the stream aborts the underlying connection.
pub struct ValueStream {
    inner: BoxStream<'static, RpcResult<RpcValue>>,
    guard: Option<DropGuard>,
}

impl ValueStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = RpcResult<RpcValue>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            guard: None,
        }
    }

    /// A stream over already known items.
    pub fn from_values<I>(items: I) -> Self
    where
        I: IntoIterator<Item = RpcResult<RpcValue>>,
        I::IntoIter: Send + 'static,
    {
        Self::new(futures_util::stream::iter(items))
    }

    /// Cancel `signal` when the stream is dropped.
    #[must_use]
    pub(crate) fn with_guard(mut self, signal: CancellationToken) -> Self {
        self.guard = Some(signal.drop_guard());
        self
    }

    /// Replace the inner stream, keeping the cancellation guard.
    pub(crate) fn wrap<S, F>(self, wrap: F) -> Self
    where
        F: FnOnce(BoxStream<'static, RpcResult<RpcValue>>) -> S,
        S: Stream<Item = RpcResult<RpcValue>> + Send + 'static,
    {
        Self {
            inner: wrap(self.inner).boxed(),
            guard: self.guard,
        }
    }

    /// Receive the next value.
    pub async fn next_value(&mut self) -> Option<RpcResult<RpcValue>> {
        self.inner.next().await
    }

    /// Abort the stream.
    ///
    /// A streaming call yields one client-closed error after the values
    /// already buffered, then ends.
    pub fn cancel(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm().cancel();
        }
    }

    /// Drain the stream, stopping at the first error.
    pub async fn try_collect(mut self) -> RpcResult<Vec<RpcValue>> {
        let mut values = Vec::new();
        while let Some(item) = self.next_value().await {
            values.push(item?);
        }
        Ok(values)
    }
}

impl Stream for ValueStream {
    type Item = RpcResult<RpcValue>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStream")
            .field("guarded", &self.guard.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StreamBridge
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BridgeState {
    buffer: VecDeque<RpcValue>,
    terminal: Option<RpcError>,
    finished: bool,
    connection_down: bool,
}

impl BridgeState {
    fn accepting(&self) -> bool {
        !self.finished && self.terminal.is_none()
    }
}

struct Shared {
    state: Mutex<BridgeState>,
    wake: Notify,
    signal: CancellationToken,
    poll_interval: Duration,
}

/// Producer side of a streaming call.
#[derive(Clone)]
pub struct StreamBridge {
    shared: Arc<Shared>,
}

impl StreamBridge {
    /// `signal` aborts the stream; `poll_interval` bounds how long a waiting
    /// consumer sleeps while the connection is down.
    pub fn new(signal: CancellationToken, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState::default()),
                wake: Notify::new(),
                signal,
                poll_interval,
            }),
        }
    }

    /// Queue a value. Returns `false` if the stream no longer accepts values.
    pub fn push(&self, value: RpcValue) -> bool {
        if self.shared.signal.is_cancelled() {
            return false;
        }
        {
            let mut state = self.shared.state.lock();
            if !state.accepting() {
                return false;
            }
            state.buffer.push_back(value);
        }
        self.shared.wake.notify_one();
        true
    }

    /// Mark graceful completion. Ignored once a terminal error is set.
    pub fn finish(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.accepting() {
                return;
            }
            state.finished = true;
        }
        self.shared.wake.notify_one();
    }

    /// Record the terminal error. Only the first one is kept.
    pub fn fail(&self, error: RpcError) {
        {
            let mut state = self.shared.state.lock();
            if !state.accepting() {
                trace!(error = %error, "Dropping error after stream end");
                return;
            }
            state.terminal = Some(error);
        }
        self.shared.wake.notify_one();
    }

    pub fn set_connection_down(&self, down: bool) {
        self.shared.state.lock().connection_down = down;
        self.shared.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        !self.shared.state.lock().accepting()
    }

    /// Decode one SSE message and feed the result into the bridge.
    ///
    /// - Blank data is skipped.
    /// - Non-JSON data is pushed as a string, except `[DONE]` which finishes
    ///   the stream.
    /// - A payload with a string `code` fails the stream.
    /// - `null`, `{}` or an object with `done`/`finish`/`end`/`complete` set
    ///   to `true` finishes the stream.
    pub fn push_message(&self, message: &Message) -> MessageFlow {
        let data = message.data.trim();
        if data.is_empty() {
            return MessageFlow::Continue;
        }

        let parsed = match serde_json::from_str::<Value>(data) {
            Ok(parsed) => parsed,
            Err(_) if data == DONE_MARKER => {
                self.finish();
                return MessageFlow::Stop;
            }
            Err(_) => {
                self.push(RpcValue::String(message.data.clone()));
                return MessageFlow::Continue;
            }
        };

        if let Some(error) = RpcError::from_stream_payload(envelope_body(&parsed)) {
            debug!(code = %error.code(), "Stream carried an error payload");
            self.fail(error);
            return MessageFlow::Stop;
        }

        let value = deserialize_payload(parsed);
        if is_end_marker(&value) {
            self.finish();
            return MessageFlow::Stop;
        }
        self.push(value);
        MessageFlow::Continue
    }

    /// Consumer side.
    pub fn into_stream(self) -> ValueStream {
        let signal = self.shared.signal.clone();
        let stream = futures_util::stream::unfold(self, |bridge| async move {
            let item = bridge.next_value().await?;
            Some((item, bridge))
        });
        ValueStream::new(stream).with_guard(signal)
    }

    async fn next_value(&self) -> Option<RpcResult<RpcValue>> {
        let shared = &self.shared;
        loop {
            let connection_down = {
                let mut state = shared.state.lock();
                if let Some(value) = state.buffer.pop_front() {
                    return Some(Ok(value));
                }
                if let Some(error) = state.terminal.take() {
                    state.finished = true;
                    drop(state);
                    shared.signal.cancel();
                    return Some(Err(error));
                }
                if state.finished {
                    drop(state);
                    shared.signal.cancel();
                    return None;
                }
                if shared.signal.is_cancelled() {
                    state.finished = true;
                    return Some(Err(RpcError::client_closed()));
                }
                state.connection_down
            };

            let woken = shared.wake.notified();
            if connection_down {
                tokio::select! {
                    _ = woken => {}
                    _ = tokio::time::sleep(shared.poll_interval) => {}
                    _ = shared.signal.cancelled() => {}
                }
            } else {
                tokio::select! {
                    _ = woken => {}
                    _ = shared.signal.cancelled() => {}
                }
            }
        }
    }
}

impl std::fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamBridge")
            .field("buffered", &state.buffer.len())
            .field("finished", &state.finished)
            .field("connection_down", &state.connection_down)
            .finish()
    }
}

/// Returns `true` for payloads that mark the end of the stream.
pub(crate) fn is_end_marker(value: &RpcValue) -> bool {
    match value {
        RpcValue::Null | RpcValue::Undefined => true,
        RpcValue::String(s) => s == DONE_MARKER,
        RpcValue::Object(map) => {
            map.is_empty()
                || END_KEYS
                    .iter()
                    .any(|key| map.get(*key) == Some(&RpcValue::Bool(true)))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    fn bridge() -> StreamBridge {
        StreamBridge::new(CancellationToken::new(), Duration::from_millis(100))
    }

    fn data(text: &str) -> Message {
        Message {
            data: text.to_string(),
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn test_buffer_drains_before_completion() {
        let bridge = bridge();
        bridge.push(RpcValue::from(json!(1)));
        bridge.push(RpcValue::from(json!(2)));
        bridge.finish();
        assert!(!bridge.push(RpcValue::from(json!(3))));

        let values = bridge.into_stream().try_collect().await.unwrap();
        assert_eq!(values, vec![RpcValue::from(json!(1)), RpcValue::from(json!(2))]);
    }

    #[tokio::test]
    async fn test_terminal_error_after_buffer() {
        let bridge = bridge();
        bridge.push(RpcValue::from(json!("a")));
        bridge.fail(RpcError::from_code(ErrorCode::BadGateway));
        bridge.fail(RpcError::internal("second"));

        let mut stream = bridge.into_stream();
        assert!(stream.next_value().await.unwrap().is_ok());
        let err = stream.next_value().await.unwrap().unwrap_err();
        assert_eq!(err.code(), &ErrorCode::BadGateway);
        assert!(stream.next_value().await.is_none());
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let bridge = bridge();
        let producer = bridge.clone();
        let mut stream = bridge.into_stream();

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            producer.push(RpcValue::from(json!("late")));
        });
        assert_eq!(
            stream.next_value().await.unwrap().unwrap(),
            RpcValue::from(json!("late"))
        );
    }

    #[tokio::test]
    async fn test_cancel_raises_client_closed_once() {
        let bridge = bridge();
        let producer = bridge.clone();
        producer.push(RpcValue::from(json!("A")));
        producer.push(RpcValue::from(json!("B")));

        let mut stream = bridge.into_stream();
        stream.cancel();
        assert!(!producer.push(RpcValue::from(json!("C"))));

        assert_eq!(stream.next_value().await.unwrap().unwrap(), RpcValue::from(json!("A")));
        assert_eq!(stream.next_value().await.unwrap().unwrap(), RpcValue::from(json!("B")));
        assert!(stream.next_value().await.unwrap().unwrap_err().is_client_closed());
        assert!(stream.next_value().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_while_connection_down() {
        let bridge = bridge();
        bridge.set_connection_down(true);
        let producer = bridge.clone();
        let mut stream = bridge.into_stream();

        let consumer = tokio::spawn(async move { stream.next_value().await });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!consumer.is_finished());

        producer.set_connection_down(false);
        producer.push(RpcValue::from(json!(1)));
        let item = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(item, RpcValue::from(json!(1)));
    }

    #[test]
    fn test_end_markers() {
        assert!(is_end_marker(&RpcValue::Null));
        assert!(is_end_marker(&RpcValue::from(json!({}))));
        assert!(is_end_marker(&RpcValue::from(json!({"done": true}))));
        assert!(is_end_marker(&RpcValue::from(json!({"complete": true, "x": 1}))));
        assert!(!is_end_marker(&RpcValue::from(json!({"done": false}))));
        assert!(!is_end_marker(&RpcValue::from(json!(0))));
    }

    #[tokio::test]
    async fn test_push_message_decoding() {
        let bridge = bridge();
        assert_eq!(bridge.push_message(&data("  ")), MessageFlow::Continue);
        assert_eq!(bridge.push_message(&data("plain text")), MessageFlow::Continue);
        assert_eq!(
            bridge.push_message(&data(r#"{"json":"7","meta":[[0]]}"#)),
            MessageFlow::Continue
        );
        assert_eq!(bridge.push_message(&data("[DONE]")), MessageFlow::Stop);

        let values = bridge.into_stream().try_collect().await.unwrap();
        assert_eq!(
            values,
            vec![RpcValue::String("plain text".into()), RpcValue::BigInt(7)]
        );
    }

    #[tokio::test]
    async fn test_error_payload_fails_stream() {
        let bridge = bridge();
        let flow = bridge.push_message(&data(
            r#"{"json":{"code":"UNAUTHORIZED","message":"token expired"}}"#,
        ));
        assert_eq!(flow, MessageFlow::Stop);

        let err = bridge.into_stream().try_collect().await.unwrap_err();
        assert_eq!(err.code(), &ErrorCode::Unauthorized);
        assert_eq!(err.message(), "token expired");
    }
}
