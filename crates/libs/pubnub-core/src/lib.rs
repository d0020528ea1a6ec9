//! Transaction core of a publish/subscribe client.
//!
//! This crate formats publish and subscribe requests, parses their replies in
//! place and drives many in-flight transactions from one shared background
//! thread. It provides:
//!
//! - **[`Context`]** per-client protocol state: keys, request and reply
//!   buffers, and cursors over the parsed messages and channels
//! - **[`RequestBuffer`]** the bounded, percent-encoding URL parameter builder
//! - **[`parse`]** the in-place JSON array splitter and reply validators
//! - **[`NotificationEngine`]** socket readiness, transaction timers and the
//!   dispatch queue behind a single lock
//! - **[`Client`]** a transaction driver gluing the three together over a
//!   [`Transport`]
//!
//! # Cargo features
//!
//! - `dynamic-reply-buffer`: grow the reply buffer on demand up to
//!   `max_reply_bytes` instead of allocating `reply_capacity` once.

pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod ntf;
pub mod parse;
pub mod request;
pub mod transport;

pub use buffer::{ReplyBuffer, TokenCursor};
pub use client::{Client, CompletionCallback, PublishOptions, SubscribeOptions};
pub use config::{Config, ContextConfig, EngineConfig};
pub use context::{Context, Timetoken, TransactionKind};
pub use error::{PubnubError, TransactionResult};
pub use ntf::{ContextId, Interest, Notification, NotificationEngine, Poller, Watched};
pub use parse::{split_array, PublishResponse};
pub use request::{RequestBuffer, Separator, TriBool};
pub use transport::Transport;

#[cfg(unix)]
pub use ntf::MioPoller;
#[cfg(unix)]
pub use transport::TcpTransport;
