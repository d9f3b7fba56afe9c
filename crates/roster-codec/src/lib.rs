//! Roster wire codec.
//!
//! Defines the message schemas exchanged on registration, interest and
//! replication channels, the generic frame envelope, and CBOR helpers.

pub mod delta;
pub mod error;
pub mod frame;
pub mod messages;

pub use delta::WireDelta;
pub use error::CodecError;
pub use frame::{decode_cbor, encode_cbor, Frame, MAX_FRAME_LEN};
pub use messages::{
    ClientHandshake, ClientHello, InterestFrame, InterestMessage, RegistrationFrame,
    RegistrationMessage, ReplicationFrame, ReplicationHandshake, ReplicationHello,
    ReplicationHelloReply, ReplicationMessage, ServerHello,
};
