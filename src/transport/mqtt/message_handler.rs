//! Pure mapping from decoded MQTT packets to transport events

use crate::transport::TransportEvent;
use rumqttc::mqttbytes::v4::{ConnectReturnCode, Packet};

/// Pure packet routing decisions
pub struct MessageHandler;

impl MessageHandler {
    /// Translate one incoming packet into the event the client acts on.
    ///
    /// Returns `None` for packets the transport consumes itself (PINGRESP).
    pub fn route_packet(packet: Packet) -> Option<TransportEvent> {
        match packet {
            Packet::ConnAck(ack) => Some(if ack.code == ConnectReturnCode::Success {
                TransportEvent::HandshakeAccepted
            } else {
                TransportEvent::HandshakeRejected(ack.code as u8)
            }),
            Packet::PubAck(ack) => Some(TransportEvent::Acknowledged(ack.pkid)),
            Packet::Publish(publish) => Some(TransportEvent::Incoming {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Packet::PubRec(rec) => Some(TransportEvent::Protocol(format!(
                "publishing received (msg_id: {})",
                rec.pkid
            ))),
            Packet::PubComp(comp) => Some(TransportEvent::Protocol(format!(
                "publishing complete (msg_id: {})",
                comp.pkid
            ))),
            Packet::PubRel(rel) => Some(TransportEvent::Protocol(format!(
                "incoming release (msg_id: {})",
                rel.pkid
            ))),
            Packet::SubAck(_) => Some(TransportEvent::Protocol(
                "subscription acknowledged".to_string(),
            )),
            Packet::Disconnect => Some(TransportEvent::Closed(Some(
                "broker sent DISCONNECT".to_string(),
            ))),
            Packet::PingResp => None,
            other => Some(TransportEvent::Protocol(format!("unexpected packet {other:?}"))),
        }
    }
}
