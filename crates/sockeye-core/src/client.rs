//! Client-mode sessions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelParams};
use crate::config::{ErrorHandler, RecoveryHandler};
use crate::error::Error;
use crate::handler::Handlers;
use crate::limiter::{RateLimiter, TaskCounter};
use crate::protocol::Header;
use crate::transport::Transport;

/// A dialed connection with its own handler registry.
///
/// The session id and keepalive cadence arrive with the server's OPEN frame
/// shortly after the dial; register handlers for `connection` /
/// `disconnection` to observe both ends of the lifecycle. There is no
/// reconnection logic: after a disconnect the client is spent and a new one
/// must be dialed.
pub struct Client {
    handlers: Arc<Handlers>,
    channel: Arc<Channel>,
}

impl Client {
    /// Dial the given URL over the transport and start the session engine.
    ///
    /// Callbacks run inline on the read loop (events on one client are
    /// processed in arrival order).
    pub async fn dial<T: Transport>(url: &str, transport: &T) -> Result<Self, Error> {
        let conn = transport.connect(url).await.map_err(Error::Transport)?;
        let conn: Arc<dyn crate::transport::Connection> = Arc::from(conn);

        let handlers = Arc::new(Handlers::default());
        let errors = ErrorHandler::default();
        let channel = Channel::new(ChannelParams {
            conn,
            header: Header::default(),
            server: None,
            handlers: handlers.clone(),
            ip: String::new(),
            request_headers: http::HeaderMap::new(),
            recovery: RecoveryHandler::default(),
            errors: errors.clone(),
            limiter: RateLimiter::new(0, TaskCounter::default(), errors),
            // Client loops have no server-wide shutdown; this token is
            // never cancelled.
            done: CancellationToken::new(),
        });

        channel.start_in_loop(None);
        channel.start_out_loop(None);
        channel.start_pinger(None);

        Ok(Self { handlers, channel })
    }

    /// Bind an async callback to an event name.
    pub fn on<A, F, Fut>(&self, event: &str, f: F)
    where
        A: DeserializeOwned + Default + Send + 'static,
        F: Fn(Arc<Channel>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.on(event, f);
    }

    /// Bind a callback whose return value answers ack requests for the
    /// event.
    pub fn on_with_result<A, R, F, Fut>(&self, event: &str, f: F)
    where
        A: DeserializeOwned + Default + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<Channel>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.handlers.on_with_result(event, f);
    }

    /// Session id assigned by the server (empty until the OPEN frame
    /// arrives).
    pub fn id(&self) -> String {
        self.channel.id()
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    /// The underlying session.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Serialize and enqueue an event for the server.
    pub async fn emit<A: Serialize>(&self, event: &str, args: &A) -> Result<(), Error> {
        self.channel.emit(event, args).await
    }

    /// Emit with an acknowledgement; resolves with the server's response
    /// payload, a closed-channel error, or a timeout.
    pub async fn ack<A: Serialize>(
        &self,
        event: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<String, Error> {
        self.channel.ack(event, args, timeout).await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.channel.close_channel().await;
    }
}
