//! sockeye-core: engine for a real-time bidirectional event protocol over
//! long-lived, ordered, text-framed transports.
//!
//! This crate defines:
//! - The wire codec ([`protocol`])
//! - Sessions with their paired read/write loops and keepalive
//!   ([`Channel`])
//! - The server with its session registry, rooms and broadcast fan-out
//!   ([`Server`])
//! - Client-mode sessions ([`Client`])
//! - Transport traits the engine consumes ([`Connection`], [`Transport`])
//! - Errors ([`Error`], [`TransportError`]) and process-wide configuration
//!
//! # Architecture
//!
//! ```text
//!   frames ──> in-loop ──> codec ──┬── system frame (open/ping/pong)
//!                                  └── rate limiter ──> handler registry
//!                                                        └── ack table
//!   emits/pings/acks ──> bounded out-queue ──> out-loop ──> transport
//! ```
//!
//! Each session owns exactly three engine tasks: the in-loop (sole reader),
//! the out-loop (sole writer) and the pinger. Closure is idempotent and may
//! be requested from any task; `Server::shutdown` drains every internally
//! spawned task cooperatively.

mod ack;
mod channel;
mod client;
mod config;
mod error;
mod handler;
mod limiter;
mod protocol;
mod server;
mod transport;

pub use channel::Channel;
pub use client::Client;
pub use config::{
    ErrorHandler, RecoveryHandler, ServerConfig, queue_buffer_size, set_queue_buffer_size,
};
pub use error::{Error, TransportError};
pub use handler::{ON_CONNECTION, ON_DISCONNECTION};
pub use protocol::{Header, Message, MessageType, PING_MESSAGE, PONG_MESSAGE, decode, encode};
pub use server::Server;
pub use transport::{BoxFuture, Connection, Transport, Upgrade};

static_assertions::assert_impl_all!(Channel: Send, Sync);
static_assertions::assert_impl_all!(Client: Send, Sync);
