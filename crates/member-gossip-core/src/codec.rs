//! Pack/unpack boundary
//!
//! Payloads are encoded with postcard. A gossip buffer is the payload's
//! [`MessageType`] tag followed by the encoded struct:
//!
//! ```text
//! +-----+---------------------------+
//! | tag | postcard(payload struct)  |
//! +-----+---------------------------+
//! ```

use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value without any header.
pub fn pack<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value that was written by [`pack`].
pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Encode a payload behind its type tag.
pub fn pack_with_header<P: Payload>(payload: &P) -> Result<Vec<u8>> {
    let body = pack(payload)?;
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(P::TYPE as u8);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Split a buffer into its tag and body.
pub fn split_header(buf: &[u8]) -> Result<(MessageType, &[u8])> {
    let (&tag, body) = buf.split_first().ok_or(Error::EmptyMessage)?;
    Ok((MessageType::try_from(tag)?, body))
}

/// Decode a full tagged buffer.
pub fn decode(buf: &[u8]) -> Result<Message> {
    let (ty, body) = split_header(buf)?;
    let message = match ty {
        MessageType::MemberJoin => Message::MemberJoin(unpack(body)?),
        MessageType::MemberLeave => Message::MemberLeave(unpack(body)?),
        MessageType::Request => Message::Request(unpack(body)?),
        MessageType::Response => Message::Response(unpack(body)?),
        MessageType::Relay => Message::Relay(unpack(body)?),
        MessageType::PushPull => Message::PushPull(unpack(body)?),
    };
    Ok(message)
}

/// Decode a buffer that must carry payload type `P`.
pub fn decode_as<P: Payload>(buf: &[u8]) -> Result<P> {
    let (ty, body) = split_header(buf)?;
    if ty != P::TYPE {
        return Err(Error::UnexpectedMessageType {
            expected: P::TYPE,
            actual: ty,
        });
    }
    unpack(body)
}

impl Message {
    /// Encode with the leading type tag.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::MemberJoin(m) => pack_with_header(m),
            Self::MemberLeave(m) => pack_with_header(m),
            Self::Request(m) => pack_with_header(m),
            Self::Response(m) => pack_with_header(m),
            Self::Relay(m) => pack_with_header(m),
            Self::PushPull(m) => pack_with_header(m),
        }
    }
}

/// Encode node tags for transport metadata.
pub fn pack_node_tags(tags: &NodeTags) -> Result<Vec<u8>> {
    pack(tags)
}

/// Decode node tags received in transport metadata. Empty metadata means no tags.
pub fn unpack_node_tags(meta: &[u8]) -> Result<NodeTags> {
    if meta.is_empty() {
        return Ok(NodeTags::new());
    }
    unpack(meta)
}

/// Encode node tags, refusing results larger than `limit` bytes.
pub fn pack_node_tags_limited(tags: &NodeTags, limit: usize) -> Result<Vec<u8>> {
    let packed = pack_node_tags(tags)?;
    if packed.len() > limit {
        return Err(Error::MetadataTooLarge {
            size: packed.len(),
            limit,
        });
    }
    Ok(packed)
}
