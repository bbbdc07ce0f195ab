//! Mesh Packet Protocol
//!
//! Binary format carried in BLE manufacturer data:
//!
//! ```text
//! +---------+-------+-------------+-----+---------------+---------+
//! | version | flags | seqnum (BE) | ttl | origin id (8) | payload |
//! |    1    |   1   |      2      |  1  |       8       |   ...   |
//! +---------+-------+-------------+-----+---------------+---------+
//! ```

use serde::{Deserialize, Serialize};

/// Protocol version written by this node
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size (version + flags + seqnum + ttl + origin id)
pub const HEADER_SIZE: usize = 13;

/// Shortest buffer `decode` accepts. Buffers between this and `HEADER_SIZE`
/// decode with a truncated origin id and an empty payload.
pub const MIN_PACKET_SIZE: usize = 6;

/// Length of an origin identifier
pub const ORIGIN_ID_SIZE: usize = 8;

/// Default TTL stamped on packets meant for direct neighbors
pub const DEFAULT_TTL: u8 = 5;

/// Stable node identifier, independent of the radio address
pub type OriginId = [u8; ORIGIN_ID_SIZE];

pub mod flags {
    /// Packet carries chat/data payload
    pub const CHAT: u8 = 0x01;
}

/// Decoded mesh packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub version: u8,
    pub flags: u8,
    pub seqnum: u16,
    pub ttl: u8,
    /// Normally 8 bytes; shorter only for truncated packets.
    pub origin_id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl MeshPacket {
    pub fn is_chat(&self) -> bool {
        self.flags & flags::CHAT != 0
    }

    /// Origin id as a fixed array, if the packet carried all 8 bytes
    pub fn origin(&self) -> Option<OriginId> {
        self.origin_id.as_slice().try_into().ok()
    }

    pub fn origin_hex(&self) -> String {
        hex::encode(&self.origin_id)
    }

    /// Payload as text when it is valid UTF-8
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Error decoding a mesh packet
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet too short: {len} bytes (minimum 6)")]
    TooShort { len: usize },
}

/// Encode a packet. Never fails.
pub fn encode(flags: u8, seqnum: u16, ttl: u8, origin_id: &OriginId, payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.push(PROTOCOL_VERSION);
    buffer.push(flags);
    buffer.extend_from_slice(&seqnum.to_be_bytes());
    buffer.push(ttl);
    buffer.extend_from_slice(origin_id);
    buffer.extend_from_slice(payload);
    buffer
}

/// Decode a packet. The version byte is reported, not checked.
pub fn decode(data: &[u8]) -> Result<MeshPacket, DecodeError> {
    if data.len() < MIN_PACKET_SIZE {
        return Err(DecodeError::TooShort { len: data.len() });
    }

    let origin_end = data.len().min(HEADER_SIZE);

    Ok(MeshPacket {
        version: data[0],
        flags: data[1],
        seqnum: u16::from_be_bytes([data[2], data[3]]),
        ttl: data[4],
        origin_id: data[5..origin_end].to_vec(),
        payload: data[origin_end..].to_vec(),
    })
}

/// Chat packet: chat flag set, UTF-8 text as payload
pub fn make_chat_packet(seqnum: u16, origin_id: &OriginId, text: &str, ttl: u8) -> Vec<u8> {
    encode(flags::CHAT, seqnum, ttl, origin_id, text.as_bytes())
}
