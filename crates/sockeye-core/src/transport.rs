//! Transport abstraction consumed by the engine.
//!
//! The engine never touches sockets directly: it reads and writes whole text
//! frames through [`Connection`] and obtains connections from a
//! [`Transport`]. Both traits are object-safe (boxed-future methods) so
//! sessions can own `Box<dyn Connection>` without infecting the engine with
//! transport type parameters.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::TransportError;

/// Boxed future type for object-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One established, ordered, text-framed connection.
///
/// Exactly one task reads and exactly one task writes over a session's
/// lifetime; `close` may be invoked from any task and must be idempotent.
pub trait Connection: Send + Sync {
    /// Receive one text frame. Bounded by the transport's receive deadline.
    fn recv(&self) -> BoxFuture<'_, Result<String, TransportError>>;

    /// Write one text frame. Bounded by the transport's send deadline.
    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Best-effort idempotent close.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Keepalive cadence for this connection: `(interval, timeout)`.
    fn ping_params(&self) -> (Duration, Duration);
}

/// A server-side accepted and upgraded connection, along with what was
/// observed at upgrade time.
pub struct Upgrade {
    pub conn: Box<dyn Connection>,
    pub remote_addr: String,
    pub request_headers: http::HeaderMap,
}

/// A way of establishing [`Connection`]s.
pub trait Transport: Send + Sync + 'static {
    /// Client-side dial.
    fn connect(&self, url: &str) -> BoxFuture<'_, Result<Box<dyn Connection>, TransportError>>;

    /// Server-side accept: upgrade a raw TCP stream into a connection.
    fn handle_connection(&self, stream: TcpStream) -> BoxFuture<'_, Result<Upgrade, TransportError>>;
}
