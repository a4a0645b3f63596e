//! Error types for membership operations.

use std::fmt;

/// Result type alias for membership operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during membership operations.
#[derive(Debug)]
pub enum Error {
    /// The configuration is invalid.
    Config(String),

    /// The coordinator has been shut down or is no longer alive enough
    /// for the requested operation.
    NotRunning,

    /// The named member has never been observed.
    UnknownMember(String),

    /// Refused to remove a member that is still alive.
    MemberAlive(String),

    /// No seed could be contacted during a join.
    NoPeers,

    /// The local leave transition completed but propagation was not
    /// confirmed in time. Non-fatal; the caller may retry the leave or
    /// proceed to shutdown.
    LeaveTimeout,

    /// The gossip layer reported a failure.
    Gossip(String),

    /// Internal channel error.
    Channel(String),

    /// Generic IO error.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
            Error::NotRunning => {
                write!(f, "coordinator is not running")
            }
            Error::UnknownMember(name) => {
                write!(f, "unknown member: {}", name)
            }
            Error::MemberAlive(name) => {
                write!(f, "member is still alive: {}", name)
            }
            Error::NoPeers => {
                write!(f, "no seed peer could be contacted")
            }
            Error::LeaveTimeout => {
                write!(f, "timed out waiting for leave intent to propagate")
            }
            Error::Gossip(msg) => {
                write!(f, "gossip layer error: {}", msg)
            }
            Error::Channel(msg) => {
                write!(f, "channel error: {}", msg)
            }
            Error::Io(err) => {
                write!(f, "IO error: {}", err)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

impl From<async_channel::RecvError> for Error {
    fn from(err: async_channel::RecvError) -> Self {
        Error::Channel(err.to_string())
    }
}
