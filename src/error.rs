//! Error types for pacerpc.

use std::fmt;

/// Error type for RPC operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from a socket or the memory allocator.
    Io(std::io::Error),
    /// Session number does not refer to a live session.
    SessionNotFound(u16),
    /// Session exists but is not in the `Connected` state.
    SessionNotConnected(u16),
    /// Session still has in-flight or backlogged requests.
    SessionBusy(u16),
    /// The endpoint has no receive-ring entries left for a new session.
    RingEntriesExhausted,
    /// Remote URI could not be parsed or resolved.
    InvalidRemoteUri(String),
    /// Routing info resolution failed (possibly fault-injected).
    RoutingResolutionFailed,
    /// Message exceeds the maximum supported size.
    MessageTooLarge { size: usize, max: usize },
    /// Invalid configuration.
    InvalidConfig(String),
    /// Malformed or corrupt session-management packet.
    InvalidSmPacket(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::SessionNotFound(n) => write!(f, "Session {} not found", n),
            Error::SessionNotConnected(n) => write!(f, "Session {} is not connected", n),
            Error::SessionBusy(n) => {
                write!(f, "Session {} has in-flight or backlogged requests", n)
            }
            Error::RingEntriesExhausted => write!(f, "No receive-ring entries available"),
            Error::InvalidRemoteUri(uri) => write!(f, "Invalid remote URI: {}", uri),
            Error::RoutingResolutionFailed => write!(f, "Routing info resolution failed"),
            Error::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes, max {} bytes", size, max)
            }
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidSmPacket(msg) => {
                write!(f, "Invalid session management packet: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;
