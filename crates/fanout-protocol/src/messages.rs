use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::packet::Packet;

/// Session ID reserved for link control traffic
pub const CONTROL_SESSION_ID: u32 = 0;

/// Relay protocol version announced in [`ControlMessage::Hello`]
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages exchanged on the control session of a relay link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame sent by the dialing node
    Hello { version: u32, node_id: String },

    /// A new logical session is starting on this link
    OpenSession { session_id: u32 },

    /// The sender closed its end of a logical session
    CloseSession { session_id: u32 },
}

impl ControlMessage {
    pub fn hello(node_id: impl Into<String>) -> Self {
        ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            node_id: node_id.into(),
        }
    }

    /// Wrap this message in a packet on the control session
    pub fn to_packet(&self) -> Result<Packet, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(Packet::new(CONTROL_SESSION_ID, Bytes::from(json)))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_messages_use_tagged_json() {
        let packet = ControlMessage::OpenSession { session_id: 9 }
            .to_packet()
            .unwrap();

        assert_eq!(packet.session_id(), CONTROL_SESSION_ID);
        assert_eq!(
            &packet.payload[..],
            br#"{"type":"open_session","session_id":9}"#
        );
    }

    #[test]
    fn test_hello_carries_protocol_version() {
        let packet = ControlMessage::hello("node-a").to_packet().unwrap();
        let decoded = ControlMessage::from_payload(&packet.payload).unwrap();

        assert_eq!(
            decoded,
            ControlMessage::Hello {
                version: PROTOCOL_VERSION,
                node_id: "node-a".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_control_type_is_rejected() {
        assert!(ControlMessage::from_payload(br#"{"type":"reboot"}"#).is_err());
    }
}
