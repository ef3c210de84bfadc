//! Buffered request/response link.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{LinkConfig, encode_body};
use crate::{
    call::{Call, OutboundRequest, Output},
    error::{RpcError, RpcResult},
    fetch::{FetchRequest, HttpFetch},
    interceptor::{InterceptorChain, Pipeline, Terminal},
    meta::deserialize_payload,
};

/// Sends each call as one POST and buffers the JSON response.
#[derive(Clone)]
pub struct HttpLink {
    pipeline: Arc<Pipeline>,
}

impl HttpLink {
    /// Create a link.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn new(
        config: LinkConfig,
        chain: InterceptorChain,
        fetch: Arc<dyn HttpFetch>,
    ) -> RpcResult<Self> {
        config.validate().map_err(RpcError::config)?;
        let terminal = HttpTerminal { config, fetch };
        Ok(Self {
            pipeline: Pipeline::new(chain, terminal),
        })
    }

    /// Run a call through the interceptor chain and send it.
    pub async fn call(&self, call: Call) -> RpcResult<Output> {
        self.pipeline.run(call).await
    }
}

impl std::fmt::Debug for HttpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLink").finish_non_exhaustive()
    }
}

struct HttpTerminal {
    config: LinkConfig,
    fetch: Arc<dyn HttpFetch>,
}

impl HttpTerminal {
    async fn exchange(&self, request: FetchRequest) -> RpcResult<(u16, Value)> {
        let response = self.fetch.fetch(request).await?;
        let status = response.status.as_u16();
        let bytes = response.bytes().await?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok((status, body))
    }
}

#[async_trait]
impl Terminal for HttpTerminal {
    async fn materialize(&self, call: &Call) -> RpcResult<OutboundRequest> {
        self.config.materialize(call, false).await
    }

    async fn execute(&self, call: Call, request: OutboundRequest) -> RpcResult<Output> {
        if call.signal.is_cancelled() {
            return Err(RpcError::client_closed());
        }

        let fetch_request = FetchRequest {
            body: Some(encode_body(&request.body)?),
            url: request.url,
            method: request.method,
            headers: request.headers,
        };
        debug!(call = %call.id, url = %fetch_request.url, "Sending HTTP call");

        let exchange = async {
            match self.config.timeout {
                Some(limit) => tokio::time::timeout(limit, self.exchange(fetch_request))
                    .await
                    .map_err(|_| RpcError::timeout(limit))?,
                None => self.exchange(fetch_request).await,
            }
        };

        let (status, body) = tokio::select! {
            biased;
            _ = call.signal.cancelled() => return Err(RpcError::client_closed()),
            result = exchange => result?,
        };

        if let Some(err) = RpcError::from_response(status, &body) {
            warn!(call = %call.id, status, code = %err.code(), "HTTP call failed");
            return Err(err);
        }
        if let Some(predicate) = &self.config.success_predicate {
            predicate.check(&body)?;
        }

        Ok(Output::Value(deserialize_payload(body)))
    }
}
