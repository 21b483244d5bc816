//! Session error types.

use adm_wire::{EnvelopeKind, WireError};
use std::time::Duration;
use thiserror::Error;

/// Reasons a connection attempt or an established session ends.
///
/// None of these reach the application synchronously: the session manager
/// logs them, reports them through `DeviceEvent::Disconnected` and retries.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket-level failure
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Hostname could not be turned into an address
    #[error("cannot resolve {host}: {reason}")]
    Resolve {
        /// Hostname that failed
        host: String,
        /// Resolver message
        reason: String,
    },

    /// Transport did not open in time
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Hub did not answer the handshake in time
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Hub refused the credentials
    #[error("hub rejected login: {0}")]
    Rejected(String),

    /// First message from the hub was not a handshake reply
    #[error("unexpected {0:?} during handshake")]
    UnexpectedHandshake(EnvelopeKind),

    /// Two heartbeat intervals passed without a sign of life
    #[error("no heartbeat from hub for {0:?}")]
    HeartbeatTimeout(Duration),

    /// Too many malformed frames; the stream is assumed desynchronized
    #[error("{0} malformed frames, stream desynchronized")]
    FrameErrors(u32),

    /// A single write did not complete in time
    #[error("write stalled for {0:?}")]
    WriteTimeout(Duration),

    /// Hub asked the device to disconnect
    #[error("hub requested termination")]
    Terminated,

    /// Local shutdown
    #[error("session stopped")]
    Cancelled,

    /// Encoding or decoding failure
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// TLS setup or handshake failure
    #[error("tls: {0}")]
    Tls(String),
}
