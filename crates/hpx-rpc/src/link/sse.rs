//! Streaming link over Server-Sent Events.

use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{LinkConfig, encode_body};
use crate::{
    call::{Call, OutboundRequest, Output},
    error::{RpcError, RpcResult},
    fetch::HttpFetch,
    interceptor::{InterceptorChain, Pipeline, Terminal},
    sse::{
        EventSource, EventSourceConfig, EventSourceHandler, Message, MessageFlow, SourceRequest,
        StreamBridge, Visibility, validate_event_stream,
    },
};

/// Opens an event stream per call and yields its payloads as values.
#[derive(Clone)]
pub struct SseLink {
    pipeline: Arc<Pipeline>,
}

impl SseLink {
    /// Create a link.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn new(
        config: LinkConfig,
        event_source: EventSourceConfig,
        chain: InterceptorChain,
        fetch: Arc<dyn HttpFetch>,
        visibility: Option<watch::Receiver<Visibility>>,
    ) -> RpcResult<Self> {
        config.validate().map_err(RpcError::config)?;
        event_source.validate().map_err(RpcError::config)?;
        let terminal = SseTerminal {
            config,
            event_source,
            fetch,
            visibility,
        };
        Ok(Self {
            pipeline: Pipeline::new(chain, terminal),
        })
    }

    /// Run a call through the interceptor chain and open its stream.
    ///
    /// Resolves once the first connection is open.
    pub async fn call(&self, call: Call) -> RpcResult<Output> {
        self.pipeline.run(call).await
    }
}

impl std::fmt::Debug for SseLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseLink").finish_non_exhaustive()
    }
}

struct SseTerminal {
    config: LinkConfig,
    event_source: EventSourceConfig,
    fetch: Arc<dyn HttpFetch>,
    visibility: Option<watch::Receiver<Visibility>>,
}

#[async_trait]
impl Terminal for SseTerminal {
    async fn materialize(&self, call: &Call) -> RpcResult<OutboundRequest> {
        self.config.materialize(call, true).await
    }

    async fn execute(&self, call: Call, request: OutboundRequest) -> RpcResult<Output> {
        if call.signal.is_cancelled() {
            return Err(RpcError::client_closed());
        }

        let signal = call.signal.child_token();
        let bridge = StreamBridge::new(signal.clone(), self.event_source.poll_interval);
        let (opened_tx, opened_rx) = oneshot::channel();

        let source_request = SourceRequest {
            body: Some(encode_body(&request.body)?),
            url: request.url,
            method: request.method,
            headers: request.headers,
            refresh_headers: self
                .config
                .headers
                .is_dynamic()
                .then(|| self.config.headers.clone()),
        };
        debug!(call = %call.id, url = %source_request.url, "Opening SSE call");

        let handler = BridgeHandler {
            bridge: bridge.clone(),
            opened: Some(opened_tx),
            path: call.path_string(),
        };
        let mut source = EventSource::new(source_request, Arc::clone(&self.fetch))
            .config(self.event_source.clone())
            .signal(signal.clone());
        if let Some(visibility) = &self.visibility {
            source = source.visibility(visibility.clone());
        }
        source.spawn(handler)?;

        // Disposes the source if this future is dropped or fails before the
        // stream reaches the caller.
        let guard = signal.clone().drop_guard();
        tokio::select! {
            biased;
            _ = call.signal.cancelled() => Err(RpcError::client_closed()),
            opened = opened_rx => match opened {
                Ok(Ok(())) => {
                    guard.disarm();
                    Ok(Output::Stream(bridge.into_stream()))
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(RpcError::internal("Event source stopped before opening")),
            },
        }
    }
}

/// Routes event source callbacks into the bridge.
///
/// Until the first open, failures reject the pending call instead.
struct BridgeHandler {
    bridge: StreamBridge,
    opened: Option<oneshot::Sender<RpcResult<()>>>,
    path: String,
}

impl BridgeHandler {
    fn fail(&mut self, err: RpcError) {
        match self.opened.take() {
            Some(opened) => {
                let _ = opened.send(Err(err));
            }
            None => self.bridge.fail(err),
        }
    }
}

impl EventSourceHandler for BridgeHandler {
    fn on_open(&mut self, _status: StatusCode, headers: &HeaderMap) -> RpcResult<()> {
        validate_event_stream(headers)?;
        self.bridge.set_connection_down(false);
        match self.opened.take() {
            Some(opened) => {
                let _ = opened.send(Ok(()));
            }
            None => info!(path = %self.path, "SSE stream reconnected"),
        }
        Ok(())
    }

    fn on_message(&mut self, message: Message) -> MessageFlow {
        self.bridge.push_message(&message)
    }

    fn on_interrupted(&mut self) {
        self.bridge.set_connection_down(true);
    }

    fn on_close(&mut self) {
        if self.bridge.is_finished() {
            return;
        }
        warn!(path = %self.path, "SSE stream closed before completion");
        self.fail(RpcError::service_unavailable("SSE connection closed unexpectedly"));
    }

    fn on_fatal(&mut self, err: RpcError) {
        warn!(path = %self.path, error = %err, "SSE stream failed");
        self.fail(err);
    }
}
