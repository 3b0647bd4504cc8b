//! Server: session registry, rooms, broadcast fan-out and graceful
//! shutdown.
//!
//! Membership lives in two dual maps guarded by one lock: room name to
//! channels, and session id to joined rooms. Whenever both the membership
//! lock and the sids lock are needed they are acquired in that order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelParams};
use crate::config::{ErrorHandler, RecoveryHandler, ServerConfig};
use crate::error::{Error, TransportError};
use crate::handler::{Handlers, ON_CONNECTION};
use crate::limiter::{RateLimiter, TaskCounter};
use crate::protocol::{self, Header, Message};
use crate::transport::{Transport, Upgrade};

/// How often shutdown re-checks the internal task counter.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Membership {
    /// room -> session id -> channel
    channels: HashMap<String, HashMap<String, Arc<Channel>>>,
    /// session id -> joined rooms
    rooms: HashMap<String, HashSet<String>>,
}

/// Server-wide state shared with every attached channel.
pub(crate) struct ServerCore {
    pub(crate) handlers: Arc<Handlers>,
    membership: RwLock<Membership>,
    sids: RwLock<HashMap<String, Arc<Channel>>>,
    pub(crate) counter: TaskCounter,
    pub(crate) done: CancellationToken,
    pub(crate) errors: ErrorHandler,
    pub(crate) recovery: RecoveryHandler,
    limit: i32,
}

impl ServerCore {
    fn new(config: ServerConfig) -> Arc<Self> {
        let core = Arc::new(Self {
            handlers: Arc::new(Handlers::default()),
            membership: RwLock::new(Membership::default()),
            sids: RwLock::new(HashMap::new()),
            counter: TaskCounter::default(),
            done: CancellationToken::new(),
            errors: config.error_handler,
            recovery: config.recovery_handler,
            limit: config.rate_limit,
        });

        // System slots: store the sid on connection, tear memberships and
        // the sid down on disconnection. They run before user handlers.
        core.handlers.set_on_connection(Arc::new(|channel| {
            if let Some(server) = channel.server() {
                server.store(channel);
            }
        }));
        core.handlers.set_on_disconnection(Arc::new(|channel| {
            if let Some(server) = channel.server() {
                server.cleanup(channel);
            }
        }));
        core
    }

    fn store(&self, channel: &Arc<Channel>) {
        self.sids.write().insert(channel.id(), channel.clone());
    }

    /// Remove the channel from every room it joined, then drop its sid.
    /// Membership lock before sids lock.
    fn cleanup(&self, channel: &Arc<Channel>) {
        let sid = channel.id();
        {
            let mut membership = self.membership.write();
            if let Some(rooms) = membership.rooms.remove(&sid) {
                for room in rooms {
                    let emptied = match membership.channels.get_mut(&room) {
                        Some(members) => {
                            members.remove(&sid);
                            members.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        membership.channels.remove(&room);
                    }
                }
            }
        }
        self.sids.write().remove(&sid);
    }

    pub(crate) fn join(&self, room: &str, channel: &Arc<Channel>) {
        let sid = channel.id();
        let mut membership = self.membership.write();
        membership
            .channels
            .entry(room.to_owned())
            .or_default()
            .insert(sid.clone(), channel.clone());
        membership.rooms.entry(sid).or_default().insert(room.to_owned());
    }

    pub(crate) fn leave(&self, room: &str, channel: &Arc<Channel>) {
        let sid = channel.id();
        let mut membership = self.membership.write();
        let emptied = match membership.channels.get_mut(room) {
            Some(members) => {
                members.remove(&sid);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            membership.channels.remove(room);
        }
        if let Some(rooms) = membership.rooms.get_mut(&sid) {
            rooms.remove(room);
        }
    }

    pub(crate) fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        let membership = self.membership.read();
        match membership.channels.get(room) {
            Some(members) => members.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn amount(&self, room: &str) -> usize {
        let membership = self.membership.read();
        membership.channels.get(room).map_or(0, |members| members.len())
    }

    fn amount_of_rooms(&self) -> usize {
        self.membership.read().channels.len()
    }

    fn amount_of_sids(&self) -> usize {
        self.sids.read().len()
    }

    fn get_channel(&self, sid: &str) -> Result<Arc<Channel>, Error> {
        self.sids
            .read()
            .get(sid)
            .cloned()
            .ok_or(Error::ConnectionNotFound)
    }

    /// Emit to every live channel in the room. Each recipient gets its own
    /// fire-and-forget task so slow peers never block fast ones.
    pub(crate) fn broadcast_to<A: Serialize>(&self, room: &str, event: &str, args: &A) {
        let frame = match encode_emit(event, args) {
            Ok(frame) => frame,
            Err(err) => {
                self.errors.call(err);
                return;
            }
        };

        let membership = self.membership.read();
        let Some(members) = membership.channels.get(room) else {
            return;
        };
        for channel in members.values() {
            if channel.is_alive() {
                let channel = channel.clone();
                let frame = frame.clone();
                tokio::spawn(async move { channel.send_out(frame).await });
            }
        }
    }

    fn broadcast_to_all<A: Serialize>(&self, event: &str, args: &A) {
        let frame = match encode_emit(event, args) {
            Ok(frame) => frame,
            Err(err) => {
                self.errors.call(err);
                return;
            }
        };

        let sids = self.sids.read();
        for channel in sids.values() {
            if channel.is_alive() {
                let channel = channel.clone();
                let frame = frame.clone();
                tokio::spawn(async move { channel.send_out(frame).await });
            }
        }
    }
}

fn encode_emit<A: Serialize>(event: &str, args: &A) -> Result<String, Error> {
    let args = serde_json::to_string(args)?;
    protocol::encode(&Message::emit(event, args))
}

/// Generate a session id: a 20-character URL-safe base64 prefix of the MD5
/// of `"<addr> <now> <rand> <rand>"`.
fn generate_id(custom: &str) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seed = format!(
        "{custom} {now} {} {}",
        rand::random::<u32>(),
        rand::random::<u32>()
    );
    let digest = md5::compute(seed.as_bytes());
    let encoded = base64::engine::general_purpose::URL_SAFE.encode(digest.0);
    encoded[..20].to_owned()
}

/// A protocol server over one transport.
pub struct Server<T: Transport> {
    transport: Arc<T>,
    core: Arc<ServerCore>,
}

impl<T: Transport> Clone for Server<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            core: self.core.clone(),
        }
    }
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: ServerConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            core: ServerCore::new(config),
        }
    }

    /// Bind an async callback to an event name.
    pub fn on<A, F, Fut>(&self, event: &str, f: F)
    where
        A: DeserializeOwned + Default + Send + 'static,
        F: Fn(Arc<Channel>, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.core.handlers.on(event, f);
    }

    /// Bind a callback whose return value answers ack requests for the
    /// event.
    pub fn on_with_result<A, R, F, Fut>(&self, event: &str, f: F)
    where
        A: DeserializeOwned + Default + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<Channel>, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
    {
        self.core.handlers.on_with_result(event, f);
    }

    /// Look up a live channel by session id.
    pub fn get_channel(&self, sid: &str) -> Result<Arc<Channel>, Error> {
        self.core.get_channel(sid)
    }

    pub fn broadcast_to<A: Serialize>(&self, room: &str, event: &str, args: &A) {
        self.core.broadcast_to(room, event, args);
    }

    pub fn broadcast_to_all<A: Serialize>(&self, event: &str, args: &A) {
        self.core.broadcast_to_all(event, args);
    }

    pub fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        self.core.list(room)
    }

    pub fn amount(&self, room: &str) -> usize {
        self.core.amount(room)
    }

    pub fn amount_of_sids(&self) -> usize {
        self.core.amount_of_sids()
    }

    pub fn amount_of_rooms(&self) -> usize {
        self.core.amount_of_rooms()
    }

    /// Number of internal tasks spawned by the engine that have not yet
    /// exited.
    pub fn num_tasks(&self) -> i64 {
        self.core.counter.get()
    }

    /// Accept loop: upgrades each incoming TCP stream and attaches the
    /// resulting session. Returns when shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.core.done.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        self.core.errors.call(Error::Transport(TransportError::Io(err)));
                    }
                },
            }
        }
    }

    /// Upgrade one raw stream and attach it. Upgrade failures go to the
    /// error handler.
    pub async fn handle_connection(&self, stream: TcpStream) {
        match self.transport.handle_connection(stream).await {
            Ok(upgrade) => self.attach(upgrade).await,
            Err(err) => self.core.errors.call(Error::Transport(err)),
        }
    }

    /// Set up the event engine for an upgraded connection: assign a session
    /// id, start the writer, send the open sequence, start the reader and
    /// pinger, then raise the connection event.
    pub async fn attach(&self, upgrade: Upgrade) {
        let Upgrade {
            conn,
            remote_addr,
            request_headers,
        } = upgrade;
        let conn: Arc<dyn crate::transport::Connection> = Arc::from(conn);

        let (interval, timeout) = conn.ping_params();
        let header = Header {
            sid: generate_id(&remote_addr),
            upgrades: Vec::new(),
            ping_interval: interval.as_millis() as u64,
            ping_timeout: timeout.as_millis() as u64,
        };

        let core = &self.core;
        let channel = Channel::new(ChannelParams {
            conn,
            header: header.clone(),
            server: Some(core.clone()),
            handlers: core.handlers.clone(),
            ip: remote_addr,
            request_headers,
            recovery: core.recovery.clone(),
            errors: core.errors.clone(),
            limiter: RateLimiter::new(core.limit, core.counter.clone(), core.errors.clone()),
            done: core.done.clone(),
        });

        channel.start_out_loop(Some(&core.counter));

        if let Err(err) = send_open_sequence(&channel, &header).await {
            core.errors.call(err);
            channel.close_channel().await;
            return;
        }

        channel.start_in_loop(Some(&core.counter));
        channel.start_pinger(Some(&core.counter));

        tracing::debug!(sid = %channel.id(), ip = %channel.ip(), "session attached");
        core.handlers.call_loop_event(&channel, ON_CONNECTION).await;
    }

    /// Signal shutdown and poll until every internal task has exited or the
    /// deadline elapses. Idempotent; user callbacks are never cancelled,
    /// only awaited.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), Error> {
        self.core.done.cancel();

        let deadline = tokio::time::Instant::now() + deadline;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + SHUTDOWN_POLL_INTERVAL,
            SHUTDOWN_POLL_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = self.num_tasks();
                    tracing::warn!(remaining, "shutdown deadline exceeded");
                    return Err(Error::ShutdownTimeout { remaining });
                }
                _ = ticker.tick() => {
                    if self.num_tasks() <= 0 {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// The open sequence: an OPEN frame carrying the header, then an EMPTY
/// frame.
async fn send_open_sequence(channel: &Arc<Channel>, header: &Header) -> Result<(), Error> {
    let header_json = serde_json::to_string(header)?;
    let open = protocol::encode(&Message::open(header_json))?;
    channel.send_out(open).await;

    let empty = protocol::encode(&Message::empty())?;
    channel.send_out(empty).await;
    Ok(())
}
