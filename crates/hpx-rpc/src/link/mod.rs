//! Transport links.
//!
//! A link turns a [`Call`] into a physical request and the response into an
//! [`Output`](crate::call::Output). [`HttpLink`] buffers a single JSON
//! response; [`SseLink`] opens an event stream and exposes it as a
//! [`ValueStream`](crate::sse::ValueStream).

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use ::http::{HeaderMap, HeaderValue, Method, header};
use serde_json::{Value, json};

use crate::{
    call::{Call, OutboundRequest},
    error::{ErrorCode, RpcError, RpcResult},
    meta::envelope_body,
};

pub mod http;
pub mod sse;

pub use self::{http::HttpLink, sse::SseLink};

/// Default bound on a buffered call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Produces headers asynchronously, e.g. from a token store.
#[async_trait]
pub trait HeaderResolver: Send + Sync + 'static {
    async fn resolve(&self) -> RpcResult<HeaderMap>;
}

#[async_trait]
impl<F, Fut> HeaderResolver for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<HeaderMap>> + Send + 'static,
{
    async fn resolve(&self) -> RpcResult<HeaderMap> {
        (self)().await
    }
}

/// Static headers or a resolver called once per physical request.
#[derive(Clone)]
pub enum HeaderSource {
    Static(HeaderMap),
    Resolver(Arc<dyn HeaderResolver>),
}

impl HeaderSource {
    pub fn resolver(resolver: impl HeaderResolver) -> Self {
        Self::Resolver(Arc::new(resolver))
    }

    /// Current header values.
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub async fn resolve(&self) -> RpcResult<HeaderMap> {
        match self {
            Self::Static(headers) => Ok(headers.clone()),
            Self::Resolver(resolver) => resolver.resolve().await,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Resolver(_))
    }
}

impl Default for HeaderSource {
    fn default() -> Self {
        Self::Static(HeaderMap::new())
    }
}

impl fmt::Debug for HeaderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(headers) => f.debug_tuple("Static").field(headers).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Business success predicate
// ---------------------------------------------------------------------------

/// Decides whether a `code` member inside a successful payload means success.
#[derive(Clone)]
pub struct SuccessPredicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl SuccessPredicate {
    pub fn new(predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Success when `code` equals `sentinel`.
    pub fn sentinel(sentinel: impl Into<Value>) -> Self {
        let sentinel = sentinel.into();
        Self::new(move |code| *code == sentinel)
    }

    /// Success when `code` equals any of the given values.
    pub fn any_of<I, V>(codes: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let codes: Vec<Value> = codes.into_iter().map(Into::into).collect();
        Self::new(move |code| codes.contains(code))
    }

    pub fn is_success(&self, code: &Value) -> bool {
        (self.0)(code)
    }

    /// Turn a business failure into an error.
    ///
    /// Payloads without a `code` member always pass.
    pub(crate) fn check(&self, payload: &Value) -> RpcResult<()> {
        let body = envelope_body(payload);
        let Some(code) = body.get("code") else {
            return Ok(());
        };
        if self.is_success(code) {
            return Ok(());
        }

        let code_name = match code {
            Value::String(code) => code.clone(),
            other => other.to_string(),
        };
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Business error: {code_name}"));

        let mut error = RpcError::new(ErrorCode::Other(code_name), message);
        if let Some(data) = body.get("data").filter(|data| !data.is_null()) {
            error = error.with_data(data.clone());
        }
        Err(error)
    }
}

impl fmt::Debug for SuccessPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SuccessPredicate(..)")
    }
}

// ---------------------------------------------------------------------------
// Link configuration
// ---------------------------------------------------------------------------

/// Settings shared by both links.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Base URL; procedure path segments are appended with `/`.
    pub url: String,
    pub headers: HeaderSource,
    /// Bound on a buffered call. `None` disables the timeout.
    pub timeout: Option<Duration>,
    pub success_predicate: Option<SuccessPredicate>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HeaderSource::default(),
            timeout: Some(DEFAULT_TIMEOUT),
            success_predicate: None,
        }
    }
}

impl LinkConfig {
    /// Create a configuration for the given base URL.
    ///
    /// Trailing slashes are trimmed.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn headers(mut self, headers: HeaderSource) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn success_predicate(mut self, predicate: SuccessPredicate) -> Self {
        self.success_predicate = Some(predicate);
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        url::Url::parse(&self.url).map_err(|e| format!("Invalid URL {:?}: {e}", self.url))?;
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err("Timeout must be > 0".to_string());
        }
        Ok(())
    }

    /// Build the physical request for a call.
    ///
    /// Configured headers override the JSON defaults.
    pub(crate) async fn materialize(&self, call: &Call, streaming: bool) -> RpcResult<OutboundRequest> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if streaming {
            headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        for (name, value) in self.headers.resolve().await?.iter() {
            headers.insert(name.clone(), value.clone());
        }

        Ok(OutboundRequest {
            url: format!("{}/{}", self.url, call.path.join("/")),
            method: Method::POST,
            headers,
            body: json!({ "json": call.input }),
        })
    }
}

/// Serialize a JSON request body.
pub(crate) fn encode_body(body: &Value) -> RpcResult<bytes::Bytes> {
    Ok(serde_json::to_vec(body)?.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_materialize_request() {
        let mut extra = HeaderMap::new();
        extra.insert("authorization", HeaderValue::from_static("Bearer t"));
        extra.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/x-custom"));
        let config = LinkConfig::new("http://localhost:3000/rpc/").headers(HeaderSource::Static(extra));

        let call = Call::new(["planet", "find"], json!({"id": 1}));
        let request = config.materialize(&call, true).await.unwrap();

        assert_eq!(request.url, "http://localhost:3000/rpc/planet/find");
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers[header::CONTENT_TYPE], "application/x-custom");
        assert_eq!(request.headers[header::ACCEPT], "text/event-stream");
        assert_eq!(request.headers["authorization"], "Bearer t");
        assert_eq!(request.body, json!({"json": {"id": 1}}));
    }

    #[tokio::test]
    async fn test_resolver_is_called_per_request() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let source = HeaderSource::resolver(move || {
            let seen = Arc::clone(&seen);
            async move {
                let n = seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut headers = HeaderMap::new();
                headers.insert("x-n", HeaderValue::from(n));
                Ok::<_, RpcError>(headers)
            }
        });

        assert_eq!(source.resolve().await.unwrap()["x-n"], "0");
        assert_eq!(source.resolve().await.unwrap()["x-n"], "1");
        assert!(source.is_dynamic());
    }

    #[test]
    fn test_validation() {
        assert!(LinkConfig::new("http://localhost/rpc").validate().is_ok());
        assert!(LinkConfig::new("").validate().is_err());
        assert!(LinkConfig::new("not a url").validate().is_err());
        assert!(
            LinkConfig::new("http://localhost")
                .timeout(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_success_predicate() {
        let predicate = SuccessPredicate::any_of([0, 200]);
        assert!(predicate.check(&json!({"json": {"code": 0, "data": 1}})).is_ok());
        assert!(predicate.check(&json!({"json": [1, 2]})).is_ok());

        let err = predicate
            .check(&json!({"json": {"code": 4001, "message": "balance too low", "data": {"need": 5}}}))
            .unwrap_err();
        assert_eq!(err.code(), &ErrorCode::Other("4001".into()));
        assert_eq!(err.message(), "balance too low");
        assert_eq!(err.data(), Some(&json!({"need": 5})));

        let sentinel = SuccessPredicate::sentinel("OK");
        let err = sentinel.check(&json!({"code": "DENIED"})).unwrap_err();
        assert_eq!(err.message(), "Business error: DENIED");
    }
}
