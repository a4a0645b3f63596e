//! Wire format for membership intents.
//!
//! Intents travel as user messages through the gossip layer's broadcast
//! mechanism. The encoding is a compact tag-byte binary format; it is not
//! part of the cluster-external contract but must stay stable across
//! versions so that mixed-version clusters keep converging.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::clock::LamportTime;

/// Upper bound on an encoded node name. Names longer than this are
/// rejected at decode time.
pub const MAX_NODE_NAME_LEN: usize = 512;

/// Message type tags for encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    /// Leave intent tag.
    Leave = 1,
}

impl TryFrom<u8> for MessageTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageTag::Leave),
            _ => Err(value),
        }
    }
}

/// Broadcast to signal that a node is leaving the cluster, either on its
/// own behalf or on behalf of a failed node being removed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LeaveMessage {
    /// Lamport time at which the intent was issued.
    pub ltime: LamportTime,
    /// Name of the node the intent is about.
    pub node: String,
}

impl LeaveMessage {
    /// Create a new leave intent.
    pub fn new(ltime: LamportTime, node: impl Into<String>) -> Self {
        Self {
            ltime,
            node: node.into(),
        }
    }

    /// Encode the message into the given buffer.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(MessageTag::Leave as u8);
        buf.put_u64(self.ltime);
        buf.put_u16(self.node.len() as u16);
        buf.put_slice(self.node.as_bytes());
    }

    /// Encode the message into a new `Bytes` buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Calculate the encoded length of the message.
    pub fn encoded_len(&self) -> usize {
        1 + 8 + 2 + self.node.len()
    }

    /// Decode a message from a buffer.
    ///
    /// Returns `None` for unknown tags, truncated input, or invalid names.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 {
            return None;
        }
        let tag = MessageTag::try_from(buf.get_u8()).ok()?;
        match tag {
            MessageTag::Leave => {
                if buf.remaining() < 10 {
                    return None;
                }
                let ltime = buf.get_u64();
                let name_len = buf.get_u16() as usize;
                if name_len == 0 || name_len > MAX_NODE_NAME_LEN || buf.remaining() < name_len {
                    return None;
                }
                let raw = buf.copy_to_bytes(name_len);
                let node = std::str::from_utf8(&raw).ok()?.to_string();
                Some(LeaveMessage { ltime, node })
            }
        }
    }

    /// Decode a message from a byte slice.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let mut cursor = std::io::Cursor::new(data);
        Self::decode(&mut cursor)
    }
}
