//! Plain, `Copy` error codes surfaced across the wire and between crates.
//! The richer `RpcError` (with `thiserror` messages and source chains)
//! lives in `nexus-rpc-core` and wraps one of these.

use core::fmt;

/// Error kinds surfaced to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Success; no error.
    NoError,
    /// Message exceeds the configured maximum.
    TooLarge,
    /// Buffer pool exhausted.
    OutOfMemory,
    /// Per-instance session cap reached.
    TooManySessions,
    /// Peer rejected the session request.
    InvalidRemoteRpcId,
    /// Peer died or explicitly reset; delivered to every in-flight continuation.
    SessionReset,
    /// Handler attempted to send on a session in teardown.
    Disconnected,
    /// Transport TX queue full; caller should retry next tick.
    RingExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoError => "no error",
            Self::TooLarge => "message too large",
            Self::OutOfMemory => "out of memory",
            Self::TooManySessions => "too many sessions",
            Self::InvalidRemoteRpcId => "invalid remote rpc id",
            Self::SessionReset => "session reset",
            Self::Disconnected => "disconnected",
            Self::RingExhausted => "tx ring exhausted",
        };
        f.write_str(s)
    }
}
