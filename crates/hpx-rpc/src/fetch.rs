//! Platform HTTP primitive used by both links.
//!
//! [`HttpFetch`] resolves once response headers are available and exposes the
//! body as a stream of chunks. Dropping the returned future or body stream
//! aborts the underlying request.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream::BoxStream};
use http::{HeaderMap, Method, StatusCode};

use crate::error::RpcResult;

/// Streaming response body.
pub type BodyStream = BoxStream<'static, RpcResult<Bytes>>;

/// A request handed to the HTTP primitive.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Response headers plus a streaming body.
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl FetchResponse {
    pub fn new<S>(status: StatusCode, headers: HeaderMap, body: S) -> Self
    where
        S: Stream<Item = RpcResult<Bytes>> + Send + 'static,
    {
        Self {
            status,
            headers,
            body: body.boxed(),
        }
    }

    /// Build a response whose body is a single chunk.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(status, headers, futures_util::stream::once(async move { Ok(body) }))
    }

    /// The `content-type` header, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Buffer the whole body.
    pub async fn bytes(self) -> RpcResult<Bytes> {
        let mut body = self.body;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Host HTTP primitive.
#[async_trait]
pub trait HttpFetch: Send + Sync + 'static {
    /// Send a request and resolve once headers arrive.
    async fn fetch(&self, request: FetchRequest) -> RpcResult<FetchResponse>;
}

// ---------------------------------------------------------------------------
// reqwest-backed implementation
// ---------------------------------------------------------------------------

#[cfg(feature = "reqwest")]
pub use self::reqwest_fetch::ReqwestFetch;

#[cfg(feature = "reqwest")]
mod reqwest_fetch {
    use async_trait::async_trait;
    use futures_util::StreamExt;

    use super::{FetchRequest, FetchResponse, HttpFetch};
    use crate::error::{RpcError, RpcResult};

    /// [`HttpFetch`] backed by a shared `reqwest::Client`.
    #[derive(Clone, Debug)]
    pub struct ReqwestFetch {
        client: reqwest::Client,
    }

    impl ReqwestFetch {
        /// Build a fetcher with a default client.
        ///
        /// # Errors
        ///
        /// Returns an error if the TLS backend cannot be initialised.
        pub fn new() -> RpcResult<Self> {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| RpcError::config(format!("Failed to build HTTP client: {e}")))?;
            Ok(Self { client })
        }

        /// Wrap an existing client.
        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl HttpFetch for ReqwestFetch {
        async fn fetch(&self, request: FetchRequest) -> RpcResult<FetchResponse> {
            let mut builder = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(RpcError::transport)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(RpcError::transport));

            Ok(FetchResponse::new(status, headers, body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffering_collects_chunks() {
        let body = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"{\"json\":")),
            Ok(Bytes::from_static(b"1}")),
        ]);
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        let response = FetchResponse::new(StatusCode::OK, headers, body);

        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"{\"json\":1}"));
    }
}
