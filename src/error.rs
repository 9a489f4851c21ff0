use thiserror::Error;

use crate::BrokerKind;

/// Errors returned by routers, the registry and the envelope codec.
///
/// Native client errors are flattened into the message string at the
/// adapter boundary so that no backend type leaks through this enum.
#[derive(Error, Debug)]
pub enum PipeError {
    /// The broker connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// A per-pipe session, link, channel, producer or consumer failed.
    #[error("session or link error: {0}")]
    Link(String),

    /// The payload shape is not enabled or could not be serialized.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The bytes are not a valid envelope for the requested shape.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The backend has no implementation of the operation.
    ///
    /// Routers themselves treat unimplemented operations as no-ops; only the
    /// typed helpers of [`RouterExt`](crate::RouterExt), which must produce a
    /// value, report this.
    #[error("{operation} is not supported by the {broker} backend")]
    UnsupportedOperation {
        broker: BrokerKind,
        operation: &'static str,
    },

    /// `remove()` was called for a pipe without an active `accept()`.
    #[error("pipe is not subscribed: {0}")]
    Unsubscribed(String),

    /// `accept()` was called for a pipe that already has a delivery task.
    #[error("pipe is already accepted: {0}")]
    AlreadyAccepted(String),

    /// The broker identifier is unknown or its backend is not compiled in.
    #[error("unsupported broker: {0}")]
    UnsupportedBroker(String),

    /// A request did not receive its reply in time.
    #[error("request timed out")]
    Timeout,

    /// The router was closed.
    #[error("router is closed")]
    Closed,

    /// Invalid or conflicting configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipeError>;
