//! Relay wire format for fanout.
//!
//! SFU nodes forward media to each other over a single connection per peer.
//! Every frame on that connection is one [`Packet`]: a fixed header naming the
//! session the payload belongs to, followed by the payload itself. Session `0`
//! is reserved for [`ControlMessage`]s that manage the link.

pub mod messages;
pub mod packet;

pub use messages::{CONTROL_SESSION_ID, ControlMessage, PROTOCOL_VERSION};
pub use packet::{HEADER_LENGTH, Header, Packet, PacketError};
