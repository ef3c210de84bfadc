//! # hpx-rpc
//!
//! RPC transport client with two modes against one backend: buffered
//! request/response over HTTP, and streaming over Server-Sent Events with
//! resumable reconnection.
//!
//! ## Features
//!
//! - **Per-call routing**: a call whose context sets `stream` (or `sse`) to
//!   `true` streams; everything else is buffered
//! - **Interceptors**: onion-ordered middleware at two levels, with stream
//!   errors replayed through the chain
//! - **Reconnecting SSE**: `Last-Event-ID` resumption, server `retry`
//!   hints, exponential backoff and a bounded attempt budget
//! - **Typed payloads**: `{json, meta}` envelopes restore big integers,
//!   dates, sets, maps and more
//! - **Pluggable HTTP**: any [`HttpFetch`] implementation; `reqwest` by
//!   default
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use hpx_rpc::{EventSourceConfig, LoggingInterceptor, RpcClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RpcClient::builder("http://localhost:3000/rpc")
//!         .header("authorization", "Bearer token")
//!         .event_source(EventSourceConfig::new().max_reconnects(5))
//!         .interceptor(LoggingInterceptor::info())
//!         .build()?;
//!
//!     let planet = client.query(["planet", "find"], json!({"id": 1})).await?;
//!     println!("{planet:?}");
//!
//!     let mut ticks = client.subscribe(["market", "ticks"], json!({"symbol": "BTC"})).await?;
//!     while let Some(tick) = ticks.next().await {
//!         println!("{:?}", tick?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod client;
pub mod error;
pub mod fetch;
pub mod interceptor;
pub mod link;
pub mod meta;
pub mod sse;

pub use call::{Call, CallId, CallOverrides, Context, OutboundRequest, Output, RequestOverrides};
pub use client::{ClientMode, LinkKind, RpcClient, RpcClientBuilder};
pub use error::{ErrorCode, RpcError, RpcResult};
#[cfg(feature = "reqwest")]
pub use fetch::ReqwestFetch;
pub use fetch::{FetchRequest, FetchResponse, HttpFetch};
pub use interceptor::{
    ClientInterceptor, ClientNext, Interceptor, InterceptorChain, LoggingInterceptor, Next,
    client_interceptor_fn, interceptor_fn, on_error, on_finish, on_start, on_success,
};
pub use link::{HeaderResolver, HeaderSource, HttpLink, LinkConfig, SseLink, SuccessPredicate};
pub use meta::{RpcValue, deserialize_payload};
pub use sse::{
    EventSourceConfig, Message, StreamBridge, ValueStream, Visibility, VisibilityNotifier,
};
