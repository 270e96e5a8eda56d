//! Error types for skywire.
//!
//! Each layer has its own enum so callers can match on what they care about.
//! [`BrokerError`] wraps all of them for code that just wants `?`.

use std::io;

use thiserror::Error;

/// Malformed location text. Never sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// The `host:port` part is missing or malformed.
    #[error("invalid host in '{location}': {reason}")]
    InvalidHost { location: String, reason: String },

    /// The `/Class/name` part is missing or malformed.
    #[error("invalid path in '{location}': {reason}")]
    InvalidPath { location: String, reason: String },
}

impl LocationError {
    pub(crate) fn host(location: &str, reason: impl Into<String>) -> Self {
        Self::InvalidHost {
            location: location.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn path(location: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            location: location.to_string(),
            reason: reason.into(),
        }
    }
}

/// Serialization failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// MsgPack encode error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack decode error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Bincode error (both directions).
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON bridge error, used when converting between typed values and [`Value`](crate::Value).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoded payload exceeds the frame limit of the link.
    #[error("payload of {size} bytes exceeds the {max} byte frame limit")]
    TooLarge { size: usize, max: u32 },

    /// The value can't be carried by the chosen serializer.
    #[error("unsupported by {serializer} serializer: {reason}")]
    Unsupported {
        serializer: &'static str,
        reason: String,
    },
}

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was closed locally.
    #[error("transport closed")]
    Closed,

    /// The endpoint refused the connection.
    #[error("connection refused by {0}")]
    Refused(String),

    /// The backend connection dropped. The next operation re-dials.
    #[error("disconnected from {0}")]
    Disconnected(String),

    /// Operation timed out.
    #[error("transport timeout")]
    Timeout,

    /// Write buffer full.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// Operation requires `bind()` first.
    #[error("transport is not bound")]
    NotBound,

    /// No route back to the peer that sent a request.
    #[error("no route for request {0}")]
    NoRoute(String),

    /// Peer violated the frame protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload (de)serialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether this error means the transport can no longer reach its peer.
    pub fn is_dead(&self) -> bool {
        match self {
            Self::Closed | Self::Refused(_) | Self::Disconnected(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Disconnected(_) | Self::Refused(_) | Self::Timeout | Self::BackpressureTimeout
        )
    }

    /// Map a dial error to the transport taxonomy.
    pub(crate) fn from_dial(addr: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused(addr.to_string()),
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Disconnected(format!("{addr}: {err}")),
        }
    }
}

/// Failure of a remote call, as seen by the caller.
#[derive(Debug, Error)]
pub enum CallError {
    /// Unknown resource or method (code 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote method failed (code 500). Carries the remote error text.
    #[error("remote error: {0}")]
    Remote(String),

    /// The transport could not reach the peer.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// No response within the timeout.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Response could not be matched to the request or had an unknown code.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// An asynchronous call task was cancelled before it finished.
    #[error("call aborted: {0}")]
    Aborted(String),

    /// Request or result could not be (de)serialized.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Non-fatal transport failure.
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Codec(e) => CallError::Codec(e),
            err if err.is_dead() => CallError::Unreachable(err.to_string()),
            err => CallError::Transport(err),
        }
    }
}

/// Resource registry failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Location already has an object.
    #[error("location {0} already registered")]
    AlreadyRegistered(String),

    /// Nothing registered at this location.
    #[error("location {0} not registered")]
    NotRegistered(String),
}

/// Object configuration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Key is not a declared option.
    #[error("unknown option '{0}'")]
    UnknownKey(String),

    /// Value cannot be converted to the option's type.
    #[error("invalid value for option '{key}': expected {expected}, got {got}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        got: &'static str,
    },

    /// Broker configuration file failed to parse.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// Broker configuration file could not be read.
    #[error("cannot read configuration {path}: {reason}")]
    Read { path: String, reason: String },
}

/// Server lifecycle failure.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Operation is not valid in the current state.
    #[error("server is {0}")]
    InvalidState(&'static str),

    /// Binding or closing the transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Class loading failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassLoaderError {
    /// No module in the search paths matches the class name.
    #[error("cannot find module for class '{class}' (searched: {searched})")]
    ModuleNotFound { class: String, searched: String },

    /// Module was found but failed to load.
    #[error("module '{module}' for class '{class}' failed to load: {reason}")]
    ModuleBroken {
        class: String,
        module: String,
        reason: String,
    },

    /// Module loaded but does not export the class.
    #[error("module '{module}' does not export class '{class}'")]
    ClassNotExported { class: String, module: String },
}

/// Manager operation failure.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Bad object name or location.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// No such object, locally or on the remote manager.
    #[error("object {0} not found")]
    ObjectNotFound(String),

    /// Constructor or lifecycle hook failed.
    #[error("object {location} failed: {reason}")]
    Object { location: String, reason: String },

    /// The manager is shutting down or already down.
    #[error("manager is shut down")]
    ShutDown,

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ClassLoader(#[from] ClassLoaderError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Call(#[from] CallError),
}

/// Top-level error for all broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    ClassLoader(#[from] ClassLoaderError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// I/O error outside of a transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_transport_errors() {
        assert!(TransportError::Closed.is_dead());
        assert!(TransportError::Refused("h:1".into()).is_dead());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_dead());
        assert!(!TransportError::Timeout.is_dead());
        assert!(!TransportError::Protocol("x".into()).is_dead());
    }

    #[test]
    fn test_dead_transport_maps_to_unreachable() {
        let err: CallError = TransportError::Disconnected("h:1".into()).into();
        assert!(matches!(err, CallError::Unreachable(_)));

        let err: CallError = TransportError::BackpressureTimeout.into();
        assert!(matches!(err, CallError::Transport(_)));

        let err: CallError = TransportError::Codec(CodecError::TooLarge { size: 10, max: 4 }).into();
        assert!(matches!(err, CallError::Codec(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_location_error_messages_name_the_rule() {
        let err = LocationError::path("/1abc/x", "class must not start with a digit");
        assert!(err.to_string().contains("must not start with a digit"));
    }
}
