use roster_registry::RegistryError;
use roster_transport::{ChannelError, TransportError};
use thiserror::Error;

/// Why a replication session ended.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplicationError {
    /// The peer turned out to be this node.
    #[error("replication peer is this node")]
    SelfConnection,
    #[error("channel closed before the handshake completed")]
    HandshakeIncomplete,
    #[error("unexpected handshake message: {0}")]
    UnexpectedHandshake(&'static str),
    /// The registry cut off a change stream that fell behind.
    #[error("registry subscription lost")]
    SubscriptionLost,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from [`crate::ReplicationService`] lifecycle calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("replication service already started")]
    AlreadyStarted,
    #[error("replication service is closed")]
    Closed,
}
