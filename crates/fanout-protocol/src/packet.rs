use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the encoded [`Header`] in bytes
pub const HEADER_LENGTH: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("relay packet too short: got {len} bytes, header needs {HEADER_LENGTH}")]
    TooShort { len: usize },
}

/// Relay packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Header {
    pub session_id: u32,
}

/// A relay packet: header followed by an opaque payload.
///
/// The payload length is not encoded; it is whatever follows the header in the
/// enclosing frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(session_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            header: Header { session_id },
            payload: payload.into(),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.header.session_id
    }

    pub fn marshal_size(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }

    /// Append the wire form of this packet to `buf`
    pub fn marshal_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.marshal_size());
        buf.put_u32(self.header.session_id);
        buf.put_slice(&self.payload);
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.marshal_size());
        self.marshal_to(&mut buf);
        buf.freeze()
    }

    /// Decode a packet from one complete frame. The payload shares `raw`'s
    /// allocation.
    pub fn unmarshal(mut raw: Bytes) -> Result<Self, PacketError> {
        if raw.len() < HEADER_LENGTH {
            return Err(PacketError::TooShort { len: raw.len() });
        }

        let session_id = raw.get_u32();

        Ok(Self {
            header: Header { session_id },
            payload: raw,
        })
    }
}
