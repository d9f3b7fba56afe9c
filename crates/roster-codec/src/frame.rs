use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Largest encoded frame sent to or accepted from a peer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Envelope carried on every channel.
///
/// `H` is the protocol's handshake payload, `D` its application payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame<H, D> {
    Hello(H),
    Data { body: D, ack_requested: bool },
    Heartbeat,
    Acknowledgement,
}

impl<H, D> Frame<H, D> {
    pub fn data(body: D) -> Self {
        Frame::Data {
            body,
            ack_requested: false,
        }
    }

    pub fn data_with_ack(body: D) -> Self {
        Frame::Data {
            body,
            ack_requested: true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Data { .. } => "data",
            Frame::Heartbeat => "heartbeat",
            Frame::Acknowledgement => "ack",
        }
    }
}

/// Encodes any message as CBOR.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes one CBOR message.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
