//! Shared test helpers: a scripted in-memory [`HttpFetch`].
#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use hpx_rpc::{FetchRequest, FetchResponse, HttpFetch, RpcError, RpcResult};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// What happens after the scripted chunks are delivered.
pub enum Tail {
    /// The body ends.
    End,
    /// The body never ends.
    Hang,
    /// The body fails with a transport error.
    Error(&'static str),
}

/// One scripted reply to a fetch.
pub enum Script {
    /// Fail before headers arrive.
    Fail(RpcError),
    /// Never resolve.
    Stall,
    Respond {
        status: u16,
        content_type: &'static str,
        chunks: Vec<Bytes>,
        tail: Tail,
    },
    /// A `text/event-stream` body fed from a channel.
    Channel(mpsc::UnboundedReceiver<Bytes>),
}

impl Script {
    /// A 200 event stream with the given chunks.
    pub fn events(chunks: &[&str], tail: Tail) -> Self {
        Self::Respond {
            status: 200,
            content_type: "text/event-stream",
            chunks: chunks.iter().map(|c| Bytes::from(c.to_string())).collect(),
            tail,
        }
    }

    /// A complete JSON response.
    pub fn json(status: u16, body: Value) -> Self {
        Self::Respond {
            status,
            content_type: "application/json",
            chunks: vec![Bytes::from(body.to_string())],
            tail: Tail::End,
        }
    }

    pub fn refused() -> Self {
        Self::Fail(RpcError::transport("connection refused"))
    }
}

#[derive(Default)]
struct Inner {
    scripts: VecDeque<Script>,
    requests: Vec<FetchRequest>,
}

/// [`HttpFetch`] that answers from a queue of scripts and records requests.
///
/// An exhausted queue refuses the connection.
#[derive(Clone, Default)]
pub struct ScriptedFetch {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedFetch {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let fetch = Self::default();
        fetch.inner.lock().scripts.extend(scripts);
        fetch
    }

    pub fn push(&self, script: Script) {
        self.inner.lock().scripts.push_back(script);
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Header value of request `index`, if present.
    pub fn header(&self, index: usize, name: &str) -> Option<String> {
        self.inner
            .lock()
            .requests
            .get(index)?
            .headers
            .get(name)?
            .to_str()
            .ok()
            .map(str::to_string)
    }

    /// Parsed JSON body of request `index`.
    pub fn body(&self, index: usize) -> Option<Value> {
        let inner = self.inner.lock();
        let body = inner.requests.get(index)?.body.as_ref()?;
        serde_json::from_slice(body).ok()
    }
}

#[async_trait]
impl HttpFetch for ScriptedFetch {
    async fn fetch(&self, request: FetchRequest) -> RpcResult<FetchResponse> {
        let script = {
            let mut inner = self.inner.lock();
            inner.requests.push(request);
            inner.scripts.pop_front()
        };

        match script {
            None => Err(RpcError::transport("connection refused")),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Stall) => std::future::pending::<RpcResult<FetchResponse>>().await,
            Some(Script::Respond {
                status,
                content_type,
                chunks,
                tail,
            }) => {
                let status = StatusCode::from_u16(status).expect("valid status");
                let head = stream::iter(chunks.into_iter().map(Ok::<Bytes, RpcError>));
                let body = match tail {
                    Tail::End => head.boxed(),
                    Tail::Hang => head.chain(stream::pending()).boxed(),
                    Tail::Error(cause) => head
                        .chain(stream::once(async move { Err(RpcError::transport(cause)) }))
                        .boxed(),
                };
                Ok(FetchResponse::new(status, headers(content_type), body))
            }
            Some(Script::Channel(rx)) => {
                let body = stream::unfold(rx, |mut rx| async move {
                    let chunk = rx.recv().await?;
                    Some((Ok::<Bytes, RpcError>(chunk), rx))
                });
                Ok(FetchResponse::new(
                    StatusCode::OK,
                    headers("text/event-stream"),
                    body,
                ))
            }
        }
    }
}

fn headers(content_type: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers
}
