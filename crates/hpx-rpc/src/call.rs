//! Call descriptors passed through the interceptor chain.

use std::fmt;

use http::{HeaderMap, Method};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{RpcError, RpcResult},
    meta::RpcValue,
    sse::ValueStream,
};

/// Caller-supplied, extensible key/value context.
pub type Context = Map<String, Value>;

/// Context keys that request the streaming link.
pub const STREAM_INTENT_KEYS: [&str; 2] = ["stream", "sse"];

/// Unique identifier attached to every call for log correlation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single logical RPC call.
#[derive(Clone, Debug)]
pub struct Call {
    pub id: CallId,
    /// Procedure path segments, e.g. `["planet", "list"]`.
    pub path: Vec<String>,
    pub input: Value,
    pub context: Context,
    /// Cancellation signal; cancelling aborts the call and any stream it opened.
    pub signal: CancellationToken,
}

impl Call {
    pub fn new<I, S>(path: I, input: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: CallId::new(),
            path: path.into_iter().map(Into::into).collect(),
            input,
            context: Context::new(),
            signal: CancellationToken::new(),
        }
    }

    /// Set the call context.
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Set a single context entry.
    #[must_use]
    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Mark the call as streaming.
    #[must_use]
    pub fn streaming(self) -> Self {
        self.with_context_value("stream", Value::Bool(true))
    }

    /// Use an external cancellation token.
    #[must_use]
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    /// Dot-joined procedure path used in logs.
    pub fn path_string(&self) -> String {
        self.path.join(".")
    }

    /// Returns `true` if the context asks for the streaming link.
    pub fn wants_stream(&self) -> bool {
        STREAM_INTENT_KEYS
            .iter()
            .any(|key| self.context.get(*key) == Some(&Value::Bool(true)))
    }

    /// Produce the call seen by the next interceptor.
    ///
    /// Context entries merge key by key; path and input are replaced.
    pub(crate) fn apply(&self, overrides: CallOverrides) -> Call {
        let mut next = self.clone();
        if let Some(path) = overrides.path {
            next.path = path;
        }
        if let Some(input) = overrides.input {
            next.input = input;
        }
        if let Some(context) = overrides.context {
            next.context.extend(context);
        }
        next
    }
}

/// Changes an interceptor passes to `next`.
#[derive(Clone, Debug, Default)]
pub struct CallOverrides {
    pub path: Option<Vec<String>>,
    pub input: Option<Value>,
    pub context: Option<Context>,
}

impl CallOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = Some(path.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }
}

/// The physical request a link is about to send.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    /// JSON body, serialized when the request is sent.
    pub body: Value,
}

impl OutboundRequest {
    /// Headers merge key by key; everything else is replaced.
    pub(crate) fn apply(&self, overrides: RequestOverrides) -> OutboundRequest {
        let mut next = self.clone();
        if let Some(url) = overrides.url {
            next.url = url;
        }
        if let Some(method) = overrides.method {
            next.method = method;
        }
        if let Some(headers) = overrides.headers {
            for (name, value) in headers.iter() {
                next.headers.insert(name.clone(), value.clone());
            }
        }
        if let Some(body) = overrides.body {
            next.body = body;
        }
        next
    }
}

/// Changes a client interceptor passes to `next`.
#[derive(Clone, Debug, Default)]
pub struct RequestOverrides {
    pub url: Option<String>,
    pub method: Option<Method>,
    pub headers: Option<HeaderMap>,
    pub body: Option<Value>,
}

impl RequestOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Result of a call: a single value or a stream of values.
pub enum Output {
    Value(RpcValue),
    Stream(ValueStream),
}

impl Output {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Take the buffered value.
    ///
    /// # Errors
    ///
    /// Fails if the call produced a stream.
    pub fn into_value(self) -> RpcResult<RpcValue> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Stream(_) => Err(RpcError::internal("Expected a value but got a stream")),
        }
    }

    /// Take the stream.
    ///
    /// # Errors
    ///
    /// Fails if the call produced a buffered value.
    pub fn into_stream(self) -> RpcResult<ValueStream> {
        match self {
            Self::Stream(stream) => Ok(stream),
            Self::Value(_) => Err(RpcError::internal("Expected a stream but got a value")),
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
