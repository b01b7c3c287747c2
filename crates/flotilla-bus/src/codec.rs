//! # Packet Codec
//!
//! JSON encoding of [`Packet`]s to and from transport strings.
//!
//! Decoding is a soft operation: malformed input or an unknown variant tag
//! yields `None` plus a warning, so one bad message never stops dispatch.

use crate::packet::Packet;
use thiserror::Error;
use tracing::warn;

/// Errors from encoding a packet.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode packet: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serialize a packet. Output is deterministic for equal packets.
pub fn encode(packet: &Packet) -> Result<String, CodecError> {
    Ok(serde_json::to_string(packet)?)
}

/// Parse a transport message into a packet, or `None` if it is not one we understand.
pub fn decode(message: &str) -> Option<Packet> {
    match serde_json::from_str::<Packet>(message) {
        Ok(packet) => Some(packet),
        Err(e) => {
            warn!(
                error = %e,
                length = message.len(),
                "Dropping undecodable packet"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{NodeKind, PacketBody, PacketId, Response, ResponseType};

    fn all_variants() -> Vec<Packet> {
        vec![
            Packet::new(PacketBody::Heartbeat {
                application_id: "proxy-0f3a9c21".into(),
            }),
            Packet::new(PacketBody::NodeStarted {
                node_id: "lobby-77aa01bc".into(),
                template: "lobby".into(),
                kind: NodeKind::Server,
            }),
            Packet::new(PacketBody::NodeStopped {
                node_id: "proxy-0f3a9c21".into(),
                template: "proxy".into(),
                kind: NodeKind::Proxy,
            }),
            Packet::new(PacketBody::StartNode {
                template: "lobby".into(),
            }),
            Packet::new(PacketBody::StopNode {
                node_id: "lobby-77aa01bc".into(),
            }),
            Packet::new(PacketBody::NodeInfo {
                node_id: "lobby-77aa01bc".into(),
            }),
            Packet::response(PacketId::new(), Response::success("lobby-77aa01bc")),
            Packet::response(PacketId::new(), Response::new(ResponseType::Error, "")),
        ]
    }

    #[test]
    fn test_round_trip_every_variant() {
        for packet in all_variants() {
            let encoded = encode(&packet).unwrap();
            let decoded = decode(&encoded).expect("decodes");
            assert_eq!(decoded, packet, "round trip of {}", encoded);
            assert_eq!(decoded.id(), packet.id());
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let packet = Packet::new(PacketBody::StartNode {
            template: "lobby".into(),
        });
        assert_eq!(encode(&packet).unwrap(), encode(&packet.clone()).unwrap());
    }

    #[test]
    fn test_wire_shape() {
        let id = PacketId::new();
        let correlation = PacketId::new();
        let packet = Packet::with_id(
            id,
            PacketBody::Response {
                correlation_id: correlation,
                response_type: ResponseType::NotFound,
                message: "no such node".into(),
            },
        );

        let value: serde_json::Value = serde_json::from_str(&encode(&packet).unwrap()).unwrap();
        assert_eq!(value["id"], id.to_string());
        assert_eq!(value["variant"], "response");
        assert_eq!(value["correlationId"], correlation.to_string());
        assert_eq!(value["responseType"], "NOT_FOUND");
        assert_eq!(value["message"], "no such node");
    }

    #[test]
    fn test_decode_foreign_message() {
        let id = PacketId::new();
        let raw = format!(
            r#"{{"id":"{}","variant":"heartbeat","applicationId":"lobby-1"}}"#,
            id
        );
        let packet = decode(&raw).unwrap();
        assert_eq!(packet.id(), id);
        assert_eq!(
            packet.body(),
            &PacketBody::Heartbeat {
                application_id: "lobby-1".into()
            }
        );
    }

    #[test]
    fn test_unknown_variant_is_dropped() {
        let raw = format!(
            r#"{{"id":"{}","variant":"player_joined","player":"steve"}}"#,
            PacketId::new()
        );
        assert!(decode(&raw).is_none());
    }

    #[test]
    fn test_malformed_input_is_dropped() {
        assert!(decode("").is_none());
        assert!(decode("not json").is_none());
        assert!(decode(r#"{"variant":"heartbeat","applicationId":"x"}"#).is_none());
        assert!(decode(r#"{"id":"nope","variant":"heartbeat","applicationId":"x"}"#).is_none());
    }
}
