//! In-memory stubs for driving the engine without a real transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sockeye_core::{BoxFuture, Connection, Transport, TransportError, Upgrade};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// A transport that cannot dial or accept; sessions are attached directly
/// through `Server::attach` with a [`StubConnection`].
pub struct StubTransport;

impl Transport for StubTransport {
    fn connect(&self, _url: &str) -> BoxFuture<'_, Result<Box<dyn Connection>, TransportError>> {
        Box::pin(async { Err(TransportError::Closed) })
    }

    fn handle_connection(
        &self,
        _stream: TcpStream,
    ) -> BoxFuture<'_, Result<Upgrade, TransportError>> {
        Box::pin(async { Err(TransportError::Closed) })
    }
}

/// Test-side handle to a [`StubConnection`].
pub struct StubHandle {
    /// Inject frames for the engine's read loop.
    pub frames: mpsc::UnboundedSender<String>,
    /// Frames the engine wrote.
    pub sent: Arc<Mutex<Vec<String>>>,
    /// Set once the engine closed the connection.
    pub closed: Arc<AtomicBool>,
}

pub struct StubConnection {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    /// When set, writes never complete (a peer that stopped reading).
    stall_writes: bool,
}

/// Build a stub connection plus its test handle.
pub fn stub_connection(stall_writes: bool) -> (Box<dyn Connection>, StubHandle) {
    let (frames, incoming) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));

    let conn = StubConnection {
        incoming: tokio::sync::Mutex::new(incoming),
        sent: sent.clone(),
        closed: closed.clone(),
        stall_writes,
    };
    (Box::new(conn), StubHandle { frames, sent, closed })
}

/// An `Upgrade` as the server would see it after a handshake.
pub fn stub_upgrade(conn: Box<dyn Connection>) -> Upgrade {
    Upgrade {
        conn,
        remote_addr: "127.0.0.1:9".to_owned(),
        request_headers: http::HeaderMap::new(),
    }
}

impl Connection for StubConnection {
    fn recv(&self) -> BoxFuture<'_, Result<String, TransportError>> {
        Box::pin(async move {
            let mut incoming = self.incoming.lock().await;
            incoming.recv().await.ok_or(TransportError::Closed)
        })
    }

    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.stall_writes {
                std::future::pending::<()>().await;
            }
            self.sent.lock().push(frame);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
        })
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (Duration::from_secs(30), Duration::from_secs(60))
    }
}
