//! sockeye-transport-websocket: WebSocket transport for sockeye.
//!
//! Wraps `tokio-tungstenite` streams into the engine's [`Connection`]
//! interface: whole text frames in and out, receive/send deadlines, an
//! idempotent close and the keepalive cadence parameters the engine's
//! pinger runs at. Only text frames are exchanged; binary frames are
//! rejected, matching the protocol layer above.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sockeye_core::{BoxFuture, Connection, Transport, TransportError, Upgrade};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};

/// Keepalive probe cadence.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long the peer gets to answer a probe.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(60);
/// Receive deadline for a single frame.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);
/// Send deadline for a single frame.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket transport parameters, applied to every connection it
/// establishes.
#[derive(Debug, Clone)]
pub struct WebsocketTransport {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for WebsocketTransport {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl WebsocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upgrade an already-accepted raw stream. Captures the handshake
    /// request headers for the session.
    pub async fn accept<S>(
        &self,
        stream: S,
        remote_addr: String,
    ) -> Result<Upgrade, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut request_headers = http::HeaderMap::new();
        let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
            request_headers = request.headers().clone();
            Ok(response)
        })
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

        Ok(Upgrade {
            conn: Box::new(WebsocketConnection::new(ws, self)),
            remote_addr,
            request_headers,
        })
    }

    /// A connected pair of in-process connections, client side first, with
    /// full WebSocket framing over `tokio::io::duplex`. For tests.
    pub async fn pair(&self) -> (Box<dyn Connection>, Upgrade) {
        let (client_stream, server_stream) = tokio::io::duplex(65536);

        let (client, upgrade) = tokio::join!(
            async {
                let (ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_stream)
                    .await
                    .expect("client handshake failed");
                ws
            },
            async {
                self.accept(server_stream, "127.0.0.1:0".to_owned())
                    .await
                    .expect("server handshake failed")
            }
        );

        (
            Box::new(WebsocketConnection::new(client, self)),
            upgrade,
        )
    }
}

type Request = tokio_tungstenite::tungstenite::handshake::server::Request;
type Response = tokio_tungstenite::tungstenite::handshake::server::Response;

impl Transport for WebsocketTransport {
    fn connect(&self, url: &str) -> BoxFuture<'_, Result<Box<dyn Connection>, TransportError>> {
        let url = url.to_owned();
        Box::pin(async move {
            let (ws, _response) = connect_async(&url)
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            Ok(Box::new(WebsocketConnection::new(ws, self)) as Box<dyn Connection>)
        })
    }

    fn handle_connection(
        &self,
        stream: TcpStream,
    ) -> BoxFuture<'_, Result<Upgrade, TransportError>> {
        Box::pin(async move {
            let remote_addr = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default();
            self.accept(stream, remote_addr).await
        })
    }
}

/// One WebSocket connection, split so the engine's single reader and single
/// writer never contend.
pub struct WebsocketConnection<S> {
    sink: AsyncMutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: AsyncMutex<SplitStream<WebSocketStream<S>>>,
    closed: Arc<AtomicBool>,
    ping_interval: Duration,
    ping_timeout: Duration,
    receive_timeout: Duration,
    send_timeout: Duration,
}

impl<S> WebsocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(ws: WebSocketStream<S>, transport: &WebsocketTransport) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: AsyncMutex::new(sink),
            stream: AsyncMutex::new(stream),
            closed: Arc::new(AtomicBool::new(false)),
            ping_interval: transport.ping_interval,
            ping_timeout: transport.ping_timeout,
            receive_timeout: transport.receive_timeout,
            send_timeout: transport.send_timeout,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
        Error::Io(e) => TransportError::Io(e),
        other => TransportError::Io(std::io::Error::other(other.to_string())),
    }
}

fn deadline_expired(what: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} deadline expired"),
    ))
}

impl<S> Connection for WebsocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn recv(&self) -> BoxFuture<'_, Result<String, TransportError>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            let mut stream = self.stream.lock().await;
            loop {
                let next = tokio::time::timeout(self.receive_timeout, stream.next())
                    .await
                    .map_err(|_| deadline_expired("receive"))?;

                let msg = next.ok_or(TransportError::Closed)?.map_err(ws_error)?;
                match msg {
                    Message::Text(text) => {
                        // The layer above never produces empty frames.
                        if text.is_empty() {
                            return Err(TransportError::EmptyPacket);
                        }
                        return Ok(text.to_string());
                    }
                    Message::Binary(_) => return Err(TransportError::Binary),
                    Message::Close(_) => {
                        self.closed.store(true, Ordering::Release);
                        return Err(TransportError::Closed);
                    }
                    // WebSocket-level keepalive is handled by tungstenite.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                }
            }
        })
    }

    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            let mut sink = self.sink.lock().await;
            tokio::time::timeout(
                self.send_timeout,
                sink.send(Message::Text(Utf8Bytes::from(frame))),
            )
            .await
            .map_err(|_| deadline_expired("send"))?
            .map_err(ws_error)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            // Best effort: the peer may already be gone.
            let mut sink = self.sink.lock().await;
            let _ = tokio::time::timeout(self.send_timeout, sink.send(Message::Close(None))).await;
        })
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.ping_interval, self.ping_timeout)
    }
}

static_assertions::assert_impl_all!(WebsocketConnection<MaybeTlsStream<TcpStream>>: Send, Sync);
static_assertions::assert_impl_all!(WebsocketTransport: Send, Sync, Clone);
