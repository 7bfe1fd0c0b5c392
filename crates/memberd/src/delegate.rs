//! Hooks invoked by the probing transport
//!
//! The transport (peer discovery, probing, unreliable delivery) lives
//! outside this crate. It drives a node exclusively through these traits;
//! none of them can fail from the transport's point of view.

use crate::cluster::Cluster;
use member_gossip_core::codec;
use member_gossip_core::{Message, Node};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Message-level hooks
pub trait Delegate: Send + Sync {
    /// Metadata advertised for the local node, at most `limit` bytes
    fn node_meta(&self, limit: usize) -> Vec<u8>;
    /// A gossip payload arrived
    fn notify_msg(&self, buf: &[u8]);
    /// Payloads to piggyback on an outgoing packet
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;
    /// Full local view for a push/pull exchange
    fn local_state(&self, join: bool) -> Option<Vec<u8>>;
    /// Full remote view received in a push/pull exchange
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Node presence hooks
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, node: &Node);
    fn notify_leave(&self, node: &Node);
    fn notify_update(&self, node: &Node);
}

/// Name conflict hook
pub trait ConflictDelegate: Send + Sync {
    fn notify_conflict(&self, known: &Node, other: &Node);
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Routes gossip payloads into the cluster and decides what to forward
#[derive(Clone)]
pub struct MessageDelegate {
    cluster: Arc<Cluster>,
}

impl MessageDelegate {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }
}

impl Delegate for MessageDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        self.cluster.node_meta(limit)
    }

    fn notify_msg(&self, buf: &[u8]) {
        let Some(&tag) = buf.first() else {
            return;
        };

        let msg = match codec::decode(buf) {
            Ok(msg) => msg,
            Err(member_gossip_core::Error::UnknownMessageType(tag)) => {
                error!("BUG: received unknown message type, ignored: {}", tag);
                return;
            }
            Err(e) => {
                error!(tag, "unpack message failed: {}", e);
                return;
            }
        };

        let forward = match &msg {
            Message::MemberJoin(m) => {
                debug!(node = %m.node_name, time = m.join_time, "received member join message");
                self.cluster.operate_node_join(m)
            }
            Message::MemberLeave(m) => {
                debug!(node = %m.node_name, time = m.leave_time, "received member leave message");
                self.cluster.operate_node_leave(m)
            }
            Message::Request(m) => {
                debug!(node = %m.request_node_name, time = m.request_time, "received request message");
                self.cluster.operate_request(m)
            }
            Message::Response(m) => {
                debug!(node = %m.response_node_name, time = m.request_time, "received response message");
                self.cluster.operate_response(m);
                false
            }
            Message::Relay(m) => {
                debug!(node = %m.source_node_name, "received relay message");
                self.cluster.operate_relay(m);
                false
            }
            Message::PushPull(_) => {
                error!("BUG: received state push/pull message on the gossip path, ignored");
                false
            }
        };

        if !forward {
            return;
        }

        let ty = msg.message_type();
        let Some(queue) = self.cluster.queue_for(ty) else {
            return;
        };
        let key = match &msg {
            Message::MemberJoin(m) => Some(m.node_name.clone()),
            Message::MemberLeave(m) => Some(m.node_name.clone()),
            _ => None,
        };
        // the queue outlives this call; keep our own copy
        queue.queue_broadcast(key, buf.to_vec());
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let num_nodes = self.cluster.num_alive();
        let mut msgs = self
            .cluster
            .member_queue()
            .get_broadcasts(overhead, limit, num_nodes);

        let used: usize = msgs.iter().map(|m| overhead + m.len()).sum();
        let remaining = limit.saturating_sub(used);
        msgs.extend(
            self.cluster
                .request_queue()
                .get_broadcasts_within(overhead, remaining, limit, num_nodes),
        );
        msgs
    }

    fn local_state(&self, join: bool) -> Option<Vec<u8>> {
        self.cluster.local_state(join)
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        self.cluster.merge_remote_state(buf, join)
    }
}

// =============================================================================
// PRESENCE
// =============================================================================

/// Translates transport presence into membership operations
#[derive(Clone)]
pub struct NodeEventDelegate {
    cluster: Arc<Cluster>,
}

impl NodeEventDelegate {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }
}

impl EventDelegate for NodeEventDelegate {
    fn notify_join(&self, node: &Node) {
        self.cluster.handle_node_join(node);
    }

    fn notify_leave(&self, node: &Node) {
        self.cluster.handle_node_leave(node);
    }

    fn notify_update(&self, node: &Node) {
        self.cluster.handle_node_update(node);
    }
}

// =============================================================================
// CONFLICTS
// =============================================================================

/// Outcome of a name conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the node we already know
    KeepKnown,
    /// Take over the other node's address and metadata
    AdoptOther,
}

/// Policy for two transport nodes claiming one name
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, known: &Node, other: &Node) -> Resolution;
}

/// Keeps whichever node was seen first
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepKnown;

impl ConflictResolver for KeepKnown {
    fn resolve(&self, _known: &Node, _other: &Node) -> Resolution {
        Resolution::KeepKnown
    }
}

/// Applies a [`ConflictResolver`] to conflicts reported by the transport
pub struct NodeConflictDelegate {
    cluster: Arc<Cluster>,
    resolver: Box<dyn ConflictResolver>,
}

impl NodeConflictDelegate {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_resolver(cluster, KeepKnown)
    }

    pub fn with_resolver(cluster: Arc<Cluster>, resolver: impl ConflictResolver + 'static) -> Self {
        Self {
            cluster,
            resolver: Box::new(resolver),
        }
    }
}

impl ConflictDelegate for NodeConflictDelegate {
    fn notify_conflict(&self, known: &Node, other: &Node) {
        warn!(
            node = %known.name,
            known = %known.addr,
            other = %other.addr,
            "conflicting node name"
        );
        self.cluster.record_conflict(known, other);

        match self.resolver.resolve(known, other) {
            Resolution::KeepKnown => {}
            Resolution::AdoptOther => self.cluster.handle_node_update(other),
        }
    }
}
