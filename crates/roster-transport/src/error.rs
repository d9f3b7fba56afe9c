use std::time::Duration;

use roster_codec::CodecError;
use thiserror::Error;

/// Link-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer or the local side closed the link.
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Reasons a channel failed or refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Initiator received data before the peer answered its hello.
    #[error("data received before handshake reply")]
    DataBeforeHandshakeReply,
    /// Initiator received a second hello.
    #[error("unexpected handshake reply")]
    UnexpectedHandshakeReply,
    /// Acceptor received data before any hello.
    #[error("data received before hello")]
    DataBeforeHello,
    /// Acceptor received a second hello.
    #[error("duplicate hello")]
    DuplicateHello,
    #[error("no heartbeat for {elapsed:?}")]
    HeartbeatTimeout { elapsed: Duration },
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// Operation on a channel that has already closed.
    #[error("channel closed")]
    AlreadyClosed,
    /// Application-level refusal, e.g. a handshake that must not proceed.
    #[error("rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roster_codec::CodecError;

    use super::{ChannelError, TransportError};

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(TransportError::Closed.to_string(), "connection closed");
        assert_eq!(
            TransportError::Io("reset".into()).to_string(),
            "io error: reset"
        );
        assert_eq!(
            TransportError::from(CodecError::Decode("eof".into())).to_string(),
            "decode error: eof"
        );
        assert_eq!(
            ChannelError::DataBeforeHandshakeReply.to_string(),
            "data received before handshake reply"
        );
        assert_eq!(
            ChannelError::UnexpectedHandshakeReply.to_string(),
            "unexpected handshake reply"
        );
        assert_eq!(
            ChannelError::DataBeforeHello.to_string(),
            "data received before hello"
        );
        assert_eq!(ChannelError::DuplicateHello.to_string(), "duplicate hello");
        assert_eq!(
            ChannelError::HeartbeatTimeout {
                elapsed: Duration::from_secs(90)
            }
            .to_string(),
            "no heartbeat for 90s"
        );
        assert_eq!(
            ChannelError::Transport(TransportError::Closed).to_string(),
            "transport failure: connection closed"
        );
        assert_eq!(ChannelError::AlreadyClosed.to_string(), "channel closed");
        assert_eq!(
            ChannelError::Rejected("self".into()).to_string(),
            "rejected: self"
        );
    }
}
