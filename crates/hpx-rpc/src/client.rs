//! Client entry point.
//!
//! [`RpcClient`] owns an HTTP link and an SSE link built from one
//! configuration and picks one per call: calls whose context sets `stream`
//! or `sse` to `true` go to the streaming link, everything else is buffered.

use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::debug;

use crate::{
    call::{Call, Output},
    error::{RpcError, RpcResult},
    fetch::HttpFetch,
    interceptor::{ClientInterceptor, Interceptor, InterceptorChain},
    link::{HeaderSource, HttpLink, LinkConfig, SseLink, SuccessPredicate},
    meta::RpcValue,
    sse::{EventSourceConfig, ValueStream, Visibility, VisibilityNotifier},
};

/// Which links a client builds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientMode {
    /// Route per call by streaming intent.
    #[default]
    Dynamic,
    /// Every call is buffered.
    HttpOnly,
    /// Every call streams.
    SseOnly,
}

/// The link a call was routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Http,
    Sse,
}

/// RPC client dispatching calls to the HTTP or SSE link.
#[derive(Clone, Debug)]
pub struct RpcClient {
    http: Option<HttpLink>,
    sse: Option<SseLink>,
    mode: ClientMode,
    visibility: VisibilityNotifier,
}

impl RpcClient {
    pub fn builder(url: impl Into<String>) -> RpcClientBuilder {
        RpcClientBuilder::new(url)
    }

    /// Builder for a client that buffers every call.
    pub fn http_only(url: impl Into<String>) -> RpcClientBuilder {
        RpcClientBuilder::new(url).mode(ClientMode::HttpOnly)
    }

    /// Builder for a client that streams every call.
    pub fn sse_only(url: impl Into<String>) -> RpcClientBuilder {
        RpcClientBuilder::new(url).mode(ClientMode::SseOnly)
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    /// The link a call will use. Decided once per call.
    pub fn route(&self, call: &Call) -> LinkKind {
        match self.mode {
            ClientMode::HttpOnly => LinkKind::Http,
            ClientMode::SseOnly => LinkKind::Sse,
            ClientMode::Dynamic if call.wants_stream() => LinkKind::Sse,
            ClientMode::Dynamic => LinkKind::Http,
        }
    }

    /// Dispatch a call.
    ///
    /// # Errors
    ///
    /// Returns the link's error, already shown to the interceptors.
    pub async fn call(&self, call: Call) -> RpcResult<Output> {
        let kind = self.route(&call);
        debug!(call = %call.id, path = %call.path_string(), link = ?kind, "Dispatching call");
        match (kind, &self.http, &self.sse) {
            (LinkKind::Http, Some(http), _) => http.call(call).await,
            (LinkKind::Sse, _, Some(sse)) => sse.call(call).await,
            _ => Err(RpcError::internal(format!("No {kind:?} link configured"))),
        }
    }

    /// Buffered call returning a single value.
    ///
    /// # Errors
    ///
    /// Fails if the call fails or was routed to the streaming link.
    pub async fn query<I, S>(&self, path: I, input: Value) -> RpcResult<RpcValue>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.call(Call::new(path, input)).await?.into_value()
    }

    /// Streaming call.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be opened or the call was buffered.
    pub async fn subscribe<I, S>(&self, path: I, input: Value) -> RpcResult<ValueStream>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.call(Call::new(path, input).streaming())
            .await?
            .into_stream()
    }

    /// Host visibility shared by every stream opened by this client.
    pub fn visibility(&self) -> &VisibilityNotifier {
        &self.visibility
    }

    /// Report a host foreground/background change.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.set(visibility);
    }
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    config: LinkConfig,
    static_headers: Vec<(String, String)>,
    event_source: EventSourceConfig,
    chain: InterceptorChain,
    fetch: Option<Arc<dyn HttpFetch>>,
    mode: ClientMode,
}

impl RpcClientBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            config: LinkConfig::new(url),
            static_headers: Vec::new(),
            event_source: EventSourceConfig::default(),
            chain: InterceptorChain::new(),
            fetch: None,
            mode: ClientMode::Dynamic,
        }
    }

    /// Add a static header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_headers.push((name.into(), value.into()));
        self
    }

    /// Replace the header source, e.g. with a per-request resolver.
    #[must_use]
    pub fn headers(mut self, headers: HeaderSource) -> Self {
        self.config.headers = headers;
        self
    }

    /// Bound buffered calls. `None` disables the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    #[must_use]
    pub fn success_predicate(mut self, predicate: SuccessPredicate) -> Self {
        self.config.success_predicate = Some(predicate);
        self
    }

    #[must_use]
    pub fn event_source(mut self, config: EventSourceConfig) -> Self {
        self.event_source = config;
        self
    }

    #[must_use]
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.chain.push(interceptor);
        self
    }

    #[must_use]
    pub fn client_interceptor(mut self, interceptor: impl ClientInterceptor) -> Self {
        self.chain.push_client(interceptor);
        self
    }

    /// Use a custom HTTP primitive.
    #[must_use]
    pub fn fetch(mut self, fetch: impl HttpFetch) -> Self {
        self.fetch = Some(Arc::new(fetch));
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: ClientMode) -> Self {
        self.mode = mode;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings or headers.
    pub fn build(self) -> RpcResult<RpcClient> {
        let mut config = self.config;
        if !self.static_headers.is_empty() {
            let HeaderSource::Static(headers) = &mut config.headers else {
                return Err(RpcError::config(
                    "Static headers cannot be combined with a header resolver",
                ));
            };
            append_headers(headers, self.static_headers)?;
        }
        config.validate().map_err(RpcError::config)?;

        let fetch = match self.fetch {
            Some(fetch) => fetch,
            None => default_fetch()?,
        };
        let visibility = VisibilityNotifier::new();

        let http = match self.mode {
            ClientMode::SseOnly => None,
            _ => Some(HttpLink::new(
                config.clone(),
                self.chain.clone(),
                Arc::clone(&fetch),
            )?),
        };
        let sse = match self.mode {
            ClientMode::HttpOnly => None,
            _ => Some(SseLink::new(
                config,
                self.event_source,
                self.chain,
                fetch,
                Some(visibility.subscribe()),
            )?),
        };

        Ok(RpcClient {
            http,
            sse,
            mode: self.mode,
            visibility,
        })
    }
}

fn append_headers(headers: &mut HeaderMap, pairs: Vec<(String, String)>) -> RpcResult<()> {
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RpcError::config(format!("Invalid header name {name:?}: {e}")))?;
        let header_value = HeaderValue::from_str(&value)
            .map_err(|e| RpcError::config(format!("Invalid value for header {name:?}: {e}")))?;
        headers.insert(header_name, header_value);
    }
    Ok(())
}

#[cfg(feature = "reqwest")]
fn default_fetch() -> RpcResult<Arc<dyn HttpFetch>> {
    Ok(Arc::new(crate::fetch::ReqwestFetch::new()?))
}

#[cfg(not(feature = "reqwest"))]
fn default_fetch() -> RpcResult<Arc<dyn HttpFetch>> {
    Err(RpcError::config(
        "No HTTP fetcher configured; enable the `reqwest` feature or call `fetch()`",
    ))
}
