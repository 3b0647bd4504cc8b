//! Error taxonomy for the engine and its transports.

use core::fmt;

/// Engine-level errors.
///
/// Direct-call failures (registration, emit encoding, lookups) are returned
/// to the caller. Failures inside engine tasks are routed to the configured
/// [`ErrorHandler`](crate::config::ErrorHandler) instead; the ones that
/// render a session unusable also close it.
#[derive(Debug)]
pub enum Error {
    /// The OPEN payload did not decode into a session header.
    WrongHeader,
    /// A wire frame could not be decoded.
    WrongPacket,
    /// The outbound queue reached its overflood boundary; the session was
    /// closed to protect the process from unbounded backlog.
    SocketOverflood,
    /// No channel is registered under the requested session id.
    ConnectionNotFound,
    /// The channel is not attached to a server (client-mode session).
    ServerNotSet,
    /// The per-session dispatch limit was reached and a message was dropped.
    RateLimited,
    /// An ack wait elapsed before the peer responded.
    AckTimeout,
    /// The channel closed while an operation was waiting on it.
    ChannelClosed,
    /// Shutdown deadline elapsed with internal tasks still running.
    ShutdownTimeout {
        /// Number of internal tasks that had not exited.
        remaining: i64,
    },
    /// No handler is registered for the event.
    MissingHandler(String),
    /// An ack response referenced an id with no registered waiter.
    MissingAckWaiter(u64),
    /// Argument or header (de)serialization failed.
    Json(serde_json::Error),
    /// The transport reported a failure; forwarded verbatim.
    Transport(TransportError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongHeader => write!(f, "wrong header"),
            Self::WrongPacket => write!(f, "wrong packet"),
            Self::SocketOverflood => write!(f, "socket overflood"),
            Self::ConnectionNotFound => write!(f, "connection not found"),
            Self::ServerNotSet => write!(f, "server not set"),
            Self::RateLimited => write!(f, "rate limit reached, a message was dropped"),
            Self::AckTimeout => write!(f, "ack timed out"),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::ShutdownTimeout { remaining } => {
                write!(f, "shutdown deadline exceeded with {remaining} running tasks")
            }
            Self::MissingHandler(event) => write!(f, "no handler registered for {event:?}"),
            Self::MissingAckWaiter(id) => write!(f, "no ack waiter for id {id}"),
            Self::Json(e) => write!(f, "serialization error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The connection is closed (clean or otherwise; not distinguished).
    Closed,
    /// An I/O failure, including receive/send deadline expiry.
    Io(std::io::Error),
    /// A binary frame arrived; only text frames are supported.
    Binary,
    /// An empty text frame arrived; empty frames are not allowed.
    EmptyPacket,
    /// Dial or upgrade handshake failed.
    Handshake(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Binary => write!(f, "binary messages are not supported"),
            Self::EmptyPacket => write!(f, "empty packet"),
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
