//! One session: an owned connection, its engine tasks, and its user surface.
//!
//! A channel owns exactly three engine tasks. The in-loop is the only reader
//! of the connection, the out-loop the only writer; the pinger never touches
//! the connection directly. Closure may be requested from any task: it is
//! serialized by the alive mutex, performed at most once, and observable
//! both as a flag (`is_alive`) and as a one-shot token every engine select
//! waits on.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::ack::AckTable;
use crate::config::{self, ErrorHandler, RecoveryHandler};
use crate::error::Error;
use crate::handler::{Handlers, ON_CONNECTION, ON_DISCONNECTION};
use crate::limiter::{RateLimiter, TaskCounter};
use crate::protocol::{self, Header, MessageType};
use crate::server::ServerCore;
use crate::transport::Connection;

const HEADER_FORWARD: &str = "x-forwarded-for";

/// Everything a channel is born with.
pub(crate) struct ChannelParams {
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) header: Header,
    pub(crate) server: Option<Arc<ServerCore>>,
    pub(crate) handlers: Arc<Handlers>,
    pub(crate) ip: String,
    pub(crate) request_headers: http::HeaderMap,
    pub(crate) recovery: RecoveryHandler,
    pub(crate) errors: ErrorHandler,
    pub(crate) limiter: RateLimiter,
    pub(crate) done: CancellationToken,
}

/// One accepted or dialed session.
pub struct Channel {
    conn: Arc<dyn Connection>,
    out_tx: mpsc::Sender<String>,
    out_rx: Mutex<Option<mpsc::Receiver<String>>>,
    out_capacity: usize,
    header: RwLock<Header>,
    alive: Mutex<bool>,
    closed: CancellationToken,
    ack: AckTable,
    server: Option<Arc<ServerCore>>,
    handlers: Arc<Handlers>,
    ip: String,
    request_headers: http::HeaderMap,
    recovery: RecoveryHandler,
    errors: ErrorHandler,
    limiter: RateLimiter,
    done: CancellationToken,
}

impl Channel {
    pub(crate) fn new(params: ChannelParams) -> Arc<Self> {
        let capacity = config::queue_buffer_size();
        let (out_tx, out_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            conn: params.conn,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            out_capacity: capacity,
            header: RwLock::new(params.header),
            alive: Mutex::new(true),
            closed: CancellationToken::new(),
            ack: AckTable::default(),
            server: params.server,
            handlers: params.handlers,
            ip: params.ip,
            request_headers: params.request_headers,
            recovery: params.recovery,
            errors: params.errors,
            limiter: params.limiter,
            done: params.done,
        })
    }

    /// Session id of this connection.
    pub fn id(&self) -> String {
        self.header.read().sid.clone()
    }

    /// Whether the session has not yet closed.
    pub fn is_alive(&self) -> bool {
        *self.alive.lock()
    }

    /// Remote address, preferring the `X-Forwarded-For` header observed at
    /// upgrade.
    pub fn ip(&self) -> String {
        if let Some(forward) = self
            .request_headers
            .get(HEADER_FORWARD)
            .and_then(|value| value.to_str().ok())
        {
            if !forward.is_empty() {
                return forward.to_owned();
            }
        }
        self.ip.clone()
    }

    /// Request headers as observed at upgrade time.
    pub fn request_header(&self) -> &http::HeaderMap {
        &self.request_headers
    }

    /// Close the session. Idempotent and safe from any task.
    pub async fn close(self: &Arc<Self>) {
        self.close_channel().await;
    }

    /// Serialize and enqueue an event for the peer. Never blocks on the
    /// network and never blocks past channel closure; returns only encoding
    /// failures.
    pub async fn emit<A: Serialize>(&self, event: &str, args: &A) -> Result<(), Error> {
        let args = serde_json::to_string(args)?;
        let frame = protocol::encode(&protocol::Message::emit(event, args))?;
        self.send_out(frame).await;
        Ok(())
    }

    /// Emit with an acknowledgement: installs a single-shot waiter, enqueues
    /// an ack request and awaits whichever comes first: the peer's response
    /// payload, channel closure, or the timeout.
    pub async fn ack<A: Serialize>(
        &self,
        event: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<String, Error> {
        let ack_id = self.ack.next_id();
        let rx = self.ack.register(ack_id);

        let args = serde_json::to_string(args)?;
        let frame = match protocol::encode(&protocol::Message::ack_request(event, ack_id, args)) {
            Ok(frame) => frame,
            Err(err) => {
                self.ack.remove(ack_id);
                return Err(err);
            }
        };
        self.send_out(frame).await;

        tokio::select! {
            result = rx => match result {
                Ok(payload) => Ok(payload),
                // The table was cleared underneath us by close.
                Err(_) => Err(Error::ChannelClosed),
            },
            _ = self.closed.cancelled() => {
                self.ack.remove(ack_id);
                Err(Error::ChannelClosed)
            }
            _ = tokio::time::sleep(timeout) => {
                self.ack.remove(ack_id);
                Err(Error::AckTimeout)
            }
        }
    }

    /// Join a broadcast room.
    pub fn join(self: &Arc<Self>, room: &str) -> Result<(), Error> {
        match &self.server {
            Some(server) => {
                server.join(room, self);
                Ok(())
            }
            None => Err(Error::ServerNotSet),
        }
    }

    /// Leave a broadcast room.
    pub fn leave(self: &Arc<Self>, room: &str) -> Result<(), Error> {
        match &self.server {
            Some(server) => {
                server.leave(room, self);
                Ok(())
            }
            None => Err(Error::ServerNotSet),
        }
    }

    /// Channels currently joined to the room; empty without a server.
    pub fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        match &self.server {
            Some(server) => server.list(room),
            None => Vec::new(),
        }
    }

    /// Number of channels joined to the room; zero without a server.
    pub fn amount(&self, room: &str) -> usize {
        match &self.server {
            Some(server) => server.amount(room),
            None => 0,
        }
    }

    /// Emit to every live channel in the room; a no-op without a server.
    pub fn broadcast_to<A: Serialize>(&self, room: &str, event: &str, args: &A) {
        if let Some(server) = &self.server {
            server.broadcast_to(room, event, args);
        }
    }

    pub(crate) fn server(&self) -> Option<&Arc<ServerCore>> {
        self.server.as_ref()
    }

    pub(crate) fn ack_table(&self) -> &AckTable {
        &self.ack
    }

    pub(crate) fn error(&self, err: Error) {
        self.errors.call(err);
    }

    /// Safe-send: enqueue without ever blocking past session or server
    /// shutdown. A frame offered to a closed session is dropped silently.
    pub(crate) async fn send_out(&self, frame: String) {
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = self.closed.cancelled() => {}
            result = self.out_tx.send(frame) => {
                // A send error means the out-loop is gone; nothing to do.
                let _ = result;
            }
        }
    }

    /// Transition to the terminal state. The decision and the one-shot
    /// signal happen under the alive mutex; every later invocation is a
    /// no-op. Raises the disconnection event exactly once.
    pub(crate) async fn close_channel(self: &Arc<Self>) {
        {
            let mut alive = self.alive.lock();
            if !*alive {
                return;
            }
            *alive = false;
            self.closed.cancel();
        }
        tracing::debug!(sid = %self.id(), "channel closed");
        self.conn.close().await;
        self.ack.clear();
        self.handlers.call_loop_event(self, ON_DISCONNECTION).await;
    }

    pub(crate) fn start_out_loop(self: &Arc<Self>, counter: Option<&TaskCounter>) {
        let Some(rx) = self.out_rx.lock().take() else {
            return;
        };
        let channel = self.clone();
        self.spawn_loop(counter, async move { channel.out_loop(rx).await });
    }

    pub(crate) fn start_in_loop(self: &Arc<Self>, counter: Option<&TaskCounter>) {
        let channel = self.clone();
        self.spawn_loop(counter, async move { channel.in_loop().await });
    }

    pub(crate) fn start_pinger(self: &Arc<Self>, counter: Option<&TaskCounter>) {
        let channel = self.clone();
        self.spawn_loop(counter, async move {
            channel.pinger().await;
            Ok(())
        });
    }

    /// Run a loop body under the recovery barrier, routing its error (if
    /// any) to the error handler. Counted when a counter is supplied.
    fn spawn_loop<F>(self: &Arc<Self>, counter: Option<&TaskCounter>, fut: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let channel = self.clone();
        let task = async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => channel.errors.call(err),
                Err(payload) => channel.recovery.call(Some(channel.clone()), payload),
            }
        };
        match counter {
            Some(counter) => counter.spawn_counted(task),
            None => {
                tokio::spawn(task);
            }
        }
    }

    /// Incoming loop: the sole reader. Decodes each frame and either
    /// handles it as a system frame or hands it to the message processor
    /// through the rate limiter.
    async fn in_loop(self: &Arc<Self>) -> Result<(), Error> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.done.cancelled() => return Ok(()),
                _ = self.closed.cancelled() => return Ok(()),
                received = self.conn.recv() => match received {
                    Ok(frame) => frame,
                    Err(err) => {
                        // A read failure during shutdown is not an error.
                        if self.done.is_cancelled() || self.closed.is_cancelled() {
                            return Ok(());
                        }
                        self.close_channel().await;
                        return Err(Error::Transport(err));
                    }
                },
            };

            let msg = match protocol::decode(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    self.close_channel().await;
                    return Err(err);
                }
            };

            match msg.message_type {
                MessageType::Open => {
                    let header: Header = match serde_json::from_str(&msg.source[1..]) {
                        Ok(header) => header,
                        Err(_) => {
                            self.close_channel().await;
                            return Err(Error::WrongHeader);
                        }
                    };
                    *self.header.write() = header;
                    self.handlers.call_loop_event(self, ON_CONNECTION).await;
                }
                MessageType::Ping => {
                    self.send_out(protocol::PONG_MESSAGE.to_owned()).await;
                }
                // Receipt already refreshed the read deadline.
                MessageType::Pong => {}
                _ => {
                    let channel = self.clone();
                    let handlers = self.handlers.clone();
                    let work = async move {
                        let barrier =
                            AssertUnwindSafe(handlers.process_incoming(&channel, msg)).catch_unwind();
                        if let Err(payload) = barrier.await {
                            channel.recovery.call(Some(channel.clone()), payload);
                        }
                    };
                    self.limiter.dispatch(Box::pin(work)).await;
                }
            }
        }
    }

    /// Outgoing loop: the sole writer. Declares the session unhealthy when
    /// the queue is within one slot of capacity. Note the boundary sits one
    /// message short of true saturation: a queue of capacity N overfloods
    /// once N-1 frames are waiting.
    async fn out_loop(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<String>,
    ) -> Result<(), Error> {
        loop {
            if rx.len() >= self.out_capacity - 1 {
                self.close_channel().await;
                return Err(Error::SocketOverflood);
            }

            tokio::select! {
                _ = self.done.cancelled() => {
                    self.close_channel().await;
                    return Ok(());
                }
                _ = self.closed.cancelled() => return Ok(()),
                frame = rx.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    if let Err(err) = self.conn.send(frame).await {
                        self.close_channel().await;
                        return Err(Error::Transport(err));
                    }
                }
            }
        }
    }

    /// Keepalive: sends a ping each interval while the session lives. Never
    /// closes the channel itself.
    async fn pinger(self: &Arc<Self>) {
        let (interval, _) = self.conn.ping_params();
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = self.closed.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.is_alive() {
                        return;
                    }
                    self.send_out(protocol::PING_MESSAGE.to_owned()).await;
                }
            }
        }
    }
}
