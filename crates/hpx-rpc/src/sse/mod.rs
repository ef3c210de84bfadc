//! Server-Sent Events streaming.
//!
//! # Architecture
//!
//! ```text
//! SseLink::call(call)
//!   └─ EventSource::spawn(handler) ──► tokio::spawn(driver)
//!        │                                 │  HttpFetch ─► body chunks
//!        │                                 │  LineParser ─► MessageAssembler
//!        │                                 ▼
//!        └── ValueStream ◄─── StreamBridge ◄── BridgeHandler::on_message
//! ```
//!
//! # Module Index
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`parse`] | [`LineParser`], [`MessageAssembler`], [`EventParser`] |
//! | `config` | [`EventSourceConfig`] reconnect and pacing settings |
//! | `source` | [`EventSource`], [`EventSourceHandle`], [`EventSourceHandler`] |
//! | `bridge` | [`StreamBridge`], [`ValueStream`] |

mod bridge;
mod config;
pub mod parse;
mod source;

pub use bridge::{StreamBridge, ValueStream};
pub use config::EventSourceConfig;
pub use parse::{EventParser, LineParser, Message, MessageAssembler, MessageSink, TextDecoding};
pub use source::{
    EventSource, EventSourceHandle, EventSourceHandler, MessageFlow, RetryDecision, SourceRequest,
    SourceState, Visibility, VisibilityNotifier, validate_event_stream,
};
