use nexus_rpc_transport::TransportError;

/// Error kinds surfaced to the application.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    #[error("message exceeds the configured maximum")]
    TooLarge,
    #[error("buffer pool exhausted")]
    OutOfMemory,
    #[error("per-instance session cap reached")]
    TooManySessions,
    #[error("peer rejected the session request")]
    InvalidRemoteRpcId,
    #[error("peer died or explicitly reset the session")]
    SessionReset,
    #[error("handler attempted to send on a session in teardown")]
    Disconnected,
    #[error("transport TX queue full, retry after the next event-loop tick")]
    RingExhausted,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("no such session")]
    UnknownSession,
    #[error("no handler registered for request type {0}")]
    UnknownRequestType(u8),
}

impl From<nexus_rpc_alloc::AllocError> for RpcError {
    fn from(err: nexus_rpc_alloc::AllocError) -> Self {
        match err {
            nexus_rpc_alloc::AllocError::TooLarge(_) => RpcError::TooLarge,
            nexus_rpc_alloc::AllocError::OutOfMemory => RpcError::OutOfMemory,
            nexus_rpc_alloc::AllocError::ResizeExceedsClass { .. } => RpcError::TooLarge,
            nexus_rpc_alloc::AllocError::InvalidHandle => RpcError::UnknownSession,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
