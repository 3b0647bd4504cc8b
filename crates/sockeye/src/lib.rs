//! sockeye: a real-time bidirectional event protocol over WebSockets.
//!
//! Named events with JSON arguments, optional request/response
//! acknowledgements, broadcast rooms, keepalive and graceful shutdown, on
//! both sides of a long-lived text-framed connection.
//!
//! # Server
//!
//! ```ignore
//! use sockeye::prelude::*;
//!
//! let server = Server::new(
//!     WebsocketTransport::default(),
//!     ServerConfig::new().with_error_handler(|err| tracing::warn!(%err, "engine error")),
//! );
//!
//! server.on(ON_CONNECTION, |channel, ()| async move {
//!     tracing::info!(sid = %channel.id(), "connected");
//! });
//! server.on("chat", |channel, text: String| async move {
//!     channel.broadcast_to("lobby", "chat", &text);
//! });
//! server.on_with_result("ping", |_channel, ()| async { 42 });
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:4000").await?;
//! server.serve(listener).await;
//! ```
//!
//! # Client
//!
//! ```ignore
//! use sockeye::prelude::*;
//! use std::time::Duration;
//!
//! let transport = WebsocketTransport::default();
//! let client = Client::dial("ws://127.0.0.1:4000/", &transport).await?;
//! client.on("chat", |_channel, text: String| async move { println!("{text}") });
//! client.emit("chat", &"hello").await?;
//! let pong = client.ack("ping", &(), Duration::from_millis(500)).await?;
//! ```
//!
//! The engine lives in `sockeye-core`; `sockeye-transport-websocket`
//! adapts `tokio-tungstenite` connections to it. This crate re-exports
//! both.

pub use sockeye_core::{
    BoxFuture, Channel, Client, Connection, Error, ErrorHandler, Header, Message, MessageType,
    ON_CONNECTION, ON_DISCONNECTION, RecoveryHandler, Server, ServerConfig, Transport,
    TransportError, Upgrade, decode, encode, queue_buffer_size, set_queue_buffer_size,
};
pub use sockeye_transport_websocket::{WebsocketConnection, WebsocketTransport};

/// The usual imports for servers and clients.
pub mod prelude {
    pub use crate::{
        Channel, Client, Error, ON_CONNECTION, ON_DISCONNECTION, Server, ServerConfig,
        WebsocketTransport,
    };
}
