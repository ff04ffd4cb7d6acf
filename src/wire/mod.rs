//! Binary WebSocket framing between client and room service (§4.1).
//!
//! Every frame is a one-byte tag followed by a payload. Tags with bit 7 set
//! are server-to-client; everything else is client-to-server.

use crate::error::{StudioError, StudioResult};

pub const C_UPDATE: u8 = 0x01;
pub const C_AWARENESS: u8 = 0x02;
pub const C_VERSION_VECTOR: u8 = 0x03;

pub const S_UPDATE: u8 = 0x81;
pub const S_AWARENESS: u8 = 0x82;
pub const S_CATCHUP: u8 = 0x83;
pub const S_PEER_ID: u8 = 0x84;

/// A decoded wire frame: a tag byte plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u8, payload: Vec<u8>) -> Self {
        Frame { tag, payload }
    }

    /// Bit 7 set means this is a server-to-client frame.
    pub fn is_server_to_client(&self) -> bool {
        self.tag & 0x80 != 0
    }
}

/// Encode a tag and payload into a single binary WebSocket message.
pub fn encode_message(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a binary WebSocket message into a [`Frame`].
pub fn decode_message(bytes: &[u8]) -> StudioResult<Frame> {
    let (&tag, payload) = bytes.split_first().ok_or(StudioError::TruncatedFrame)?;
    Ok(Frame::new(tag, payload.to_vec()))
}

/// Encode an 8-byte big-endian peer id, used for the [`S_PEER_ID`] payload.
pub fn encode_peer_id(peer_id: u64) -> [u8; 8] {
    peer_id.to_be_bytes()
}

/// Decode an 8-byte big-endian peer id.
pub fn decode_peer_id(bytes: &[u8]) -> StudioResult<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StudioError::TruncatedFrame)?;
    Ok(u64::from_be_bytes(arr))
}

/// Convenience constructor for an [`S_PEER_ID`] frame.
pub fn peer_id_frame(peer_id: u64) -> Vec<u8> {
    encode_message(S_PEER_ID, &encode_peer_id(peer_id))
}
