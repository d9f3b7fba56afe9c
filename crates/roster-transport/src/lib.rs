//! Roster channel transport.
//!
//! A [`MessageConnection`] is an abstract reliable, ordered, bidirectional
//! link. [`channel`] drives one connection through a handler pipeline
//! (handshake, heartbeat, application) on a caller-supplied runtime.

pub mod channel;
pub mod connect_once;
pub mod connection;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod heartbeat;
pub mod tcp;

pub use channel::{ChannelBuilder, ChannelConfig, ChannelEvents, ChannelHandle, ChannelState, Inbound};
pub use connect_once::ConnectOnce;
pub use connection::{in_memory_pair, ConnectionSender, MessageConnection};
pub use error::{ChannelError, TransportError};
pub use handler::{FrameHandler, HandlerContext};
pub use handshake::{HandshakeHandler, HandshakeRole};
pub use heartbeat::HeartbeatHandler;
