//! Wire message types for member-gossip
//!
//! Every gossip payload is a one-byte [`MessageType`] tag followed by the
//! postcard encoding of the matching struct. Field order matters for the
//! encoding.

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

/// Lamport timestamp.
pub type LogicalTime = u64;

/// Free-form node tags advertised through transport metadata.
pub type NodeTags = BTreeMap<String, String>;

// =============================================================================
// TYPE TAGS
// =============================================================================

/// Leading tag byte of every message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// A node announced itself
    MemberJoin = 0,
    /// A node announced its departure
    MemberLeave = 1,
    /// Cluster-wide query
    Request = 2,
    /// Unicast answer to a query
    Response = 3,
    /// Response travelling through an intermediate node
    Relay = 4,
    /// Full-state anti-entropy exchange
    PushPull = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::MemberJoin),
            1 => Ok(Self::MemberLeave),
            2 => Ok(Self::Request),
            3 => Ok(Self::Response),
            4 => Ok(Self::Relay),
            5 => Ok(Self::PushPull),
            _ => Err(Error::UnknownMessageType(value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MemberJoin => "member-join",
            Self::MemberLeave => "member-leave",
            Self::Request => "request",
            Self::Response => "response",
            Self::Relay => "relay",
            Self::PushPull => "push-pull",
        };
        f.write_str(name)
    }
}

/// A struct that travels on the wire behind a fixed tag.
pub trait Payload: Serialize + DeserializeOwned {
    const TYPE: MessageType;
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Join announcement, stamped with the membership clock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberJoin {
    pub join_time: LogicalTime,
    pub node_name: String,
}

impl Payload for MemberJoin {
    const TYPE: MessageType = MessageType::MemberJoin;
}

/// Leave announcement, stamped with the membership clock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberLeave {
    pub leave_time: LogicalTime,
    pub node_name: String,
}

impl Payload for MemberLeave {
    const TYPE: MessageType = MessageType::MemberLeave;
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Cluster-wide query, stamped with the request clock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_time: LogicalTime,
    pub request_node_name: String,
    pub request_name: String,
    pub payload: Vec<u8>,
}

impl Payload for Request {
    const TYPE: MessageType = MessageType::Request;
}

/// Answer from one node to a [`Request`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub request_time: LogicalTime,
    pub request_node_name: String,
    pub request_name: String,
    pub response_node_name: String,
    pub payload: Vec<u8>,
}

impl Payload for Response {
    const TYPE: MessageType = MessageType::Response;
}

/// Tagged inner message carried on behalf of `source_node_name`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub source_node_name: String,
    pub target_node_name: String,
    pub payload: Vec<u8>,
}

impl Payload for Relay {
    const TYPE: MessageType = MessageType::Relay;
}

// =============================================================================
// ANTI-ENTROPY
// =============================================================================

/// Full local view exchanged during push/pull synchronization.
///
/// Clock times are the sender's current values; receivers witness one less.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPull {
    pub member_clock_time: LogicalTime,
    pub request_clock_time: LogicalTime,
    pub member_last_message_times: BTreeMap<String, LogicalTime>,
    pub left_member_names: Vec<String>,
}

impl Payload for PushPull {
    const TYPE: MessageType = MessageType::PushPull;
}

// =============================================================================
// DECODED MESSAGE
// =============================================================================

/// Closed set of decoded messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    MemberJoin(MemberJoin),
    MemberLeave(MemberLeave),
    Request(Request),
    Response(Response),
    Relay(Relay),
    PushPull(PushPull),
}

impl Message {
    /// Tag this message is sent under
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::MemberJoin(_) => MessageType::MemberJoin,
            Self::MemberLeave(_) => MessageType::MemberLeave,
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::Relay(_) => MessageType::Relay,
            Self::PushPull(_) => MessageType::PushPull,
        }
    }
}

// =============================================================================
// TRANSPORT NODES
// =============================================================================

/// A peer as reported by the probing transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
    /// Packed [`NodeTags`], as produced by the peer's metadata hook
    pub meta: Vec<u8>,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            meta: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags() {
        for tag in 0u8..=5 {
            let ty = MessageType::try_from(tag).unwrap();
            assert_eq!(ty as u8, tag);
        }
        assert!(matches!(
            MessageType::try_from(6),
            Err(Error::UnknownMessageType(6))
        ));
        assert!(matches!(
            MessageType::try_from(0xff),
            Err(Error::UnknownMessageType(0xff))
        ));
    }

    #[test]
    fn test_payload_tags_match_message() {
        let join = Message::MemberJoin(MemberJoin {
            join_time: 1,
            node_name: "a".into(),
        });
        assert_eq!(join.message_type(), MemberJoin::TYPE);
        assert_eq!(
            Message::PushPull(PushPull::default()).message_type(),
            PushPull::TYPE
        );
    }
}
