use serde::{Deserialize, Serialize};

use roster_core::{InstanceInfo, Interest, Source};

use crate::delta::WireDelta;
use crate::frame::Frame;

/// Identity a client presents when opening a registration or interest channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientHandshake {
    Hello(ClientHello),
    Reply(ServerHello),
}

/// Client → server registration traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistrationMessage {
    Register(InstanceInfo),
    /// Whole-record update.
    Update(InstanceInfo),
    /// Single-field update.
    UpdateDelta(WireDelta),
    Unregister,
}

/// Interest channel traffic; subscriptions flow client → server, instance
/// changes flow back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterestMessage {
    InterestRegistration(Interest),
    UnregisterInterestSet,
    SnapshotRegistration(Interest),
    AddInstance(InstanceInfo),
    DeleteInstance(String),
    UpdateInstanceInfo(WireDelta),
    SnapshotComplete,
    BufferStart(Interest),
    BufferEnd(Interest),
}

/// First message on a replication channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationHello {
    pub source: Source,
    pub registry_size: u64,
}

/// Receiver's answer to [`ReplicationHello`]. `is_self` is set when the
/// receiver recognized its own id in the hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationHelloReply {
    pub source: Source,
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationHandshake {
    Hello(ReplicationHello),
    Reply(ReplicationHelloReply),
}

/// Sender → receiver replication traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    RegisterCopy(InstanceInfo),
    UpdateCopy(InstanceInfo),
    UnregisterCopy(String),
    BufferStart,
    BufferEnd,
}

pub type RegistrationFrame = Frame<ClientHandshake, RegistrationMessage>;
pub type InterestFrame = Frame<ClientHandshake, InterestMessage>;
pub type ReplicationFrame = Frame<ReplicationHandshake, ReplicationMessage>;

#[cfg(test)]
mod tests {
    use roster_core::{
        Delta, DeltaField, InstanceInfo, Interest, ServicePort, Source, Status,
    };

    use super::{
        ClientHandshake, ClientHello, InterestFrame, InterestMessage, RegistrationFrame,
        RegistrationMessage, ReplicationFrame, ReplicationHandshake, ReplicationHello,
        ReplicationHelloReply, ReplicationMessage, ServerHello,
    };
    use crate::delta::WireDelta;
    use crate::frame::{decode_cbor, encode_cbor, Frame};

    fn info() -> InstanceInfo {
        InstanceInfo::new("i-1", "billing")
            .with_status(Status::Up)
            .with_vip("billing.vip")
            .with_port(ServicePort::named("http", 8080, false))
            .with_metadata("zone", "us-east-1a")
            .with_version(12)
    }

    fn wire_delta() -> WireDelta {
        WireDelta::from_delta(&Delta::new("i-1", 13, DeltaField::Status(Status::Down)))
            .expect("delta should encode")
    }

    #[test]
    fn registration_messages_keep_equality_through_cbor() {
        let frames: Vec<RegistrationFrame> = vec![
            Frame::Hello(ClientHandshake::Hello(ClientHello {
                client_id: "c-1".into(),
            })),
            Frame::Hello(ClientHandshake::Reply(ServerHello {
                server_id: "s-1".into(),
            })),
            Frame::data_with_ack(RegistrationMessage::Register(info())),
            Frame::data(RegistrationMessage::Update(info().with_version(13))),
            Frame::data(RegistrationMessage::UpdateDelta(wire_delta())),
            Frame::data(RegistrationMessage::Unregister),
            Frame::Heartbeat,
            Frame::Acknowledgement,
        ];
        for frame in frames {
            let decoded: RegistrationFrame =
                decode_cbor(&encode_cbor(&frame).expect("encode")).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn interest_messages_keep_equality_through_cbor() {
        let interest = Interest::composite([Interest::application("billing"), Interest::vip("v")]);
        let frames: Vec<InterestFrame> = vec![
            Frame::data(InterestMessage::InterestRegistration(interest.clone())),
            Frame::data(InterestMessage::UnregisterInterestSet),
            Frame::data(InterestMessage::SnapshotRegistration(Interest::FullRegistry)),
            Frame::data(InterestMessage::AddInstance(info())),
            Frame::data(InterestMessage::DeleteInstance("i-1".into())),
            Frame::data(InterestMessage::UpdateInstanceInfo(wire_delta())),
            Frame::data(InterestMessage::SnapshotComplete),
            Frame::data(InterestMessage::BufferStart(interest.clone())),
            Frame::data(InterestMessage::BufferEnd(interest)),
        ];
        for frame in frames {
            let decoded: InterestFrame =
                decode_cbor(&encode_cbor(&frame).expect("encode")).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn replication_messages_keep_equality_through_cbor() {
        let frames: Vec<ReplicationFrame> = vec![
            Frame::Hello(ReplicationHandshake::Hello(ReplicationHello {
                source: Source::replicated("node-a").with_generation(99),
                registry_size: 42,
            })),
            Frame::Hello(ReplicationHandshake::Reply(ReplicationHelloReply {
                source: Source::replicated("node-b"),
                is_self: false,
            })),
            Frame::data(ReplicationMessage::RegisterCopy(info())),
            Frame::data(ReplicationMessage::UpdateCopy(info().with_version(14))),
            Frame::data(ReplicationMessage::UnregisterCopy("i-1".into())),
            Frame::data(ReplicationMessage::BufferStart),
            Frame::data(ReplicationMessage::BufferEnd),
        ];
        for frame in frames {
            let decoded: ReplicationFrame =
                decode_cbor(&encode_cbor(&frame).expect("encode")).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn source_generation_survives_the_wire() {
        let hello = ReplicationHello {
            source: Source::replicated("node-a").with_generation(7),
            registry_size: 0,
        };
        let decoded: ReplicationHello =
            decode_cbor(&encode_cbor(&hello).expect("encode")).expect("decode");
        assert_eq!(decoded.source.generation, 7);
    }
}
