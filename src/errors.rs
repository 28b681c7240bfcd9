//! Error taxonomy shared by every component of the fleet.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Errors produced by the line client, connection, rate limiter, manager and
/// controller seam.
#[derive(Debug)]
pub enum Error {
    /// The Line Client's socket was closed by `Disconnect()`.
    ClientDisconnected,
    /// The remote peer closed the socket, or a write to it failed.
    ServerDisconnected,
    /// `Join` was called for a channel name already present in the manager.
    AlreadyJoined,
    /// No connection had room for the requested weight and the caller does
    /// not allow allocating a new one.
    NoCapacity,
    /// `Part` was called for a channel that isn't tracked, or a connection
    /// key no longer resolves to a live connection.
    NotFound,
    /// The classifier could not find enough tokens to tag a line.
    PartialMessage,
    /// The operation was attempted after `Shutdown()` began.
    Closing,
    /// The shared rate-limit store returned an error.
    RateLimitStore(Box<dyn StdError + Send + Sync>),
    /// `Init()` was called before a message callback was registered. Kept
    /// for parity with spec.md §7's taxonomy; `Manager::new` takes the
    /// callback as a required constructor argument rather than a two-phase
    /// `OnMessage` + `Init()`, so this crate can't actually construct a
    /// `Manager` in the unset state and this variant is unreachable here.
    CapabilityUnset,
    /// Underlying socket I/O failure.
    Io(io::Error),
    /// TLS handshake failure.
    Tls(Box<dyn StdError + Send + Sync>),
    /// A message could not be delivered because the send channel was
    /// closed.
    SendError,
    /// The rate limiter's wait was cancelled by the caller.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClientDisconnected => write!(f, "client disconnected"),
            Error::ServerDisconnected => write!(f, "server disconnected"),
            Error::AlreadyJoined => write!(f, "channel already joined"),
            Error::NoCapacity => write!(f, "no remaining capacity on the connection"),
            Error::NotFound => write!(f, "channel or connection not found"),
            Error::PartialMessage => write!(f, "partial message"),
            Error::Closing => write!(f, "manager is shutting down"),
            Error::RateLimitStore(source) => write!(f, "rate limit store error: {}", source),
            Error::CapabilityUnset => write!(f, "OnMessage has not been set"),
            Error::Io(source) => write!(f, "I/O error: {}", source),
            Error::Tls(source) => write!(f, "TLS error: {}", source),
            Error::SendError => write!(f, "message send error"),
            Error::Cancelled => write!(f, "operation was cancelled"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::RateLimitStore(source) => Some(source.as_ref()),
            Error::Io(source) => Some(source),
            Error::Tls(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io(source)
    }
}

/// Discriminates why a Line Client's `Connect()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `Disconnect()` was called locally.
    ClientInitiated,
    /// The remote peer closed the socket or a write failed.
    ServerInitiated,
}

impl From<DisconnectReason> for Error {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::ClientInitiated => Error::ClientDisconnected,
            DisconnectReason::ServerInitiated => Error::ServerDisconnected,
        }
    }
}
