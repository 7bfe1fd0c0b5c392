//! Cluster coordinator
//!
//! Owns the two logical clocks, the membership table, the broadcast queues
//! and request tracking, and implements the per-message merge decisions the
//! transport delegates call into.

use crate::broadcast::TransmitLimitedQueue;
use crate::config::ClusterConfig;
use crate::membership::{MemberRecord, MembershipStats, MembershipTable};
use crate::request::{
    IncomingRequest, NoopRequestHandler, PendingRequests, RequestHandler, RequestLog,
    ResponseStream,
};
use member_gossip_core::codec::{self, pack_with_header};
use member_gossip_core::{
    LogicalClock, LogicalTime, MemberJoin, MemberLeave, MessageType, Node, Relay, Request,
    Response,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Codec error: {0}")]
    Codec(#[from] member_gossip_core::Error),
    #[error("Local node has left the cluster")]
    Left,
}

/// Notifications for the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    MemberJoin { name: String, time: LogicalTime },
    MemberLeave { name: String, time: LogicalTime },
    MemberUpdate { name: String },
    MemberConflict { known: Node, other: Node },
    Request(IncomingRequest),
}

/// Unicast message waiting for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub target: String,
    pub payload: Vec<u8>,
}

/// Cluster statistics
#[derive(Debug, Clone)]
pub struct ClusterStats {
    pub member_time: LogicalTime,
    pub request_time: LogicalTime,
    pub members: MembershipStats,
    pub queued_member_broadcasts: usize,
    pub queued_request_broadcasts: usize,
    pub pending_requests: usize,
}

/// Coordination state of one node
pub struct Cluster {
    config: ClusterConfig,
    member_clock: LogicalClock,
    request_clock: LogicalClock,
    members: RwLock<MembershipTable>,
    member_queue: TransmitLimitedQueue,
    request_queue: TransmitLimitedQueue,
    request_log: Mutex<RequestLog>,
    pending: PendingRequests,
    handler: Box<dyn RequestHandler>,
    outgoing: Mutex<Vec<Outgoing>>,
    events: broadcast::Sender<ClusterEvent>,
    left: AtomicBool,
}

impl Cluster {
    /// Create a node with fresh clocks and no request handler
    pub fn new(config: ClusterConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            member_clock: LogicalClock::new(),
            request_clock: LogicalClock::new(),
            members: RwLock::new(MembershipTable::new()),
            member_queue: TransmitLimitedQueue::new(config.retransmit_mult),
            request_queue: TransmitLimitedQueue::new(config.retransmit_mult),
            request_log: Mutex::new(RequestLog::new(config.request_log_capacity)),
            pending: PendingRequests::new(),
            handler: Box::new(NoopRequestHandler),
            outgoing: Mutex::new(Vec::new()),
            events,
            left: AtomicBool::new(false),
            config,
        }
    }

    /// Answer requests with `handler`
    pub fn with_handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Start from the given clock values
    pub fn with_clocks(mut self, member_time: LogicalTime, request_time: LogicalTime) -> Self {
        self.member_clock = LogicalClock::with_time(member_time);
        self.request_clock = LogicalClock::with_time(request_time);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn member_clock(&self) -> &LogicalClock {
        &self.member_clock
    }

    pub fn request_clock(&self) -> &LogicalClock {
        &self.request_clock
    }

    /// Subscribe to cluster events
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub(crate) fn read_members(&self) -> RwLockReadGuard<'_, MembershipTable> {
        self.members.read()
    }

    /// Copy of one member record
    pub fn member(&self, name: &str) -> Option<MemberRecord> {
        self.members.read().lookup(name).cloned()
    }

    /// Copies of all member records, sorted by name
    pub fn members(&self) -> Vec<MemberRecord> {
        let mut records: Vec<MemberRecord> = self.members.read().iter().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Names of alive members, sorted
    pub fn alive_members(&self) -> Vec<String> {
        self.members.read().alive_names()
    }

    /// Number of alive members, used to scale retransmissions
    pub fn num_alive(&self) -> usize {
        self.members.read().alive_count()
    }

    pub fn member_queue(&self) -> &TransmitLimitedQueue {
        &self.member_queue
    }

    pub fn request_queue(&self) -> &TransmitLimitedQueue {
        &self.request_queue
    }

    /// Broadcast queue a forwarded message of type `ty` belongs to
    pub(crate) fn queue_for(&self, ty: MessageType) -> Option<&TransmitLimitedQueue> {
        match ty {
            MessageType::MemberJoin | MessageType::MemberLeave => Some(&self.member_queue),
            MessageType::Request => Some(&self.request_queue),
            MessageType::Response | MessageType::Relay | MessageType::PushPull => None,
        }
    }

    fn emit(&self, event: ClusterEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // MERGE DECISIONS
    // =========================================================================

    /// Witness and merge a join; `true` if it changed local state.
    pub fn operate_node_join(&self, msg: &MemberJoin) -> bool {
        self.member_clock.update(msg.join_time);

        let changed = self.members.write().apply_join(&msg.node_name, msg.join_time);
        if changed {
            debug!(node = %msg.node_name, time = msg.join_time, "member joined");
            self.emit(ClusterEvent::MemberJoin {
                name: msg.node_name.clone(),
                time: msg.join_time,
            });
        }
        changed
    }

    /// Witness and merge a leave; `true` if it changed local state.
    ///
    /// A leave for the local node that it never announced is refuted with a
    /// fresh join.
    pub fn operate_node_leave(&self, msg: &MemberLeave) -> bool {
        self.member_clock.update(msg.leave_time);

        let changed = self.members.write().apply_leave(&msg.node_name, msg.leave_time);
        if changed {
            debug!(node = %msg.node_name, time = msg.leave_time, "member left");
            self.emit(ClusterEvent::MemberLeave {
                name: msg.node_name.clone(),
                time: msg.leave_time,
            });
            if msg.node_name == self.name() && !self.has_left() {
                self.refute(msg.leave_time);
            }
        }
        changed
    }

    fn refute(&self, leave_time: LogicalTime) {
        match self.announce_join() {
            Ok(join_time) => {
                warn!(leave_time, join_time, "refuted leave for the local node")
            }
            Err(e) => error!("refute leave for the local node failed: {}", e),
        }
    }

    /// Witness a request and run the handler if it is novel.
    ///
    /// Returns `true` when the request should keep spreading.
    pub fn operate_request(&self, msg: &Request) -> bool {
        self.request_clock.update(msg.request_time);

        let novel = self.request_log.lock().observe(
            self.request_clock.time(),
            msg.request_time,
            &msg.request_node_name,
            &msg.request_name,
        );
        if !novel {
            return false;
        }

        let incoming = IncomingRequest::from(msg);
        if let Some(reply) = self.handler.handle(&incoming) {
            self.respond(msg, reply);
        }
        self.emit(ClusterEvent::Request(incoming));
        true
    }

    /// Witness a response and hand it to the waiting collector.
    pub fn operate_response(&self, msg: &Response) -> bool {
        self.request_clock.update(msg.request_time);
        self.pending.deliver(msg)
    }

    /// Unwrap a relayed response.
    ///
    /// Delivered locally when addressed to this node, otherwise passed on to
    /// its target once, unwrapped.
    pub fn operate_relay(&self, msg: &Relay) -> bool {
        let inner = match codec::decode_as::<Response>(&msg.payload) {
            Ok(inner) => inner,
            Err(e) => {
                error!(source = %msg.source_node_name, "unpack relayed response failed: {}", e);
                return false;
            }
        };

        if msg.target_node_name == self.name() {
            return self.operate_response(&inner);
        }

        self.outgoing.lock().push(Outgoing {
            target: msg.target_node_name.clone(),
            payload: msg.payload.clone(),
        });
        false
    }

    fn respond(&self, request: &Request, reply: Vec<u8>) {
        let response = Response {
            request_time: request.request_time,
            request_node_name: request.request_node_name.clone(),
            request_name: request.request_name.clone(),
            response_node_name: self.name().to_string(),
            payload: reply,
        };
        let packed = match pack_with_header(&response) {
            Ok(packed) => packed,
            Err(e) => {
                error!("pack response failed: {}", e);
                return;
            }
        };

        let mut outgoing = Vec::with_capacity(1 + self.config.relay_factor);
        for relay in self.pick_relays(&request.request_node_name) {
            let wrapped = Relay {
                source_node_name: self.name().to_string(),
                target_node_name: request.request_node_name.clone(),
                payload: packed.clone(),
            };
            match pack_with_header(&wrapped) {
                Ok(payload) => outgoing.push(Outgoing {
                    target: relay,
                    payload,
                }),
                Err(e) => error!("pack relay message failed: {}", e),
            }
        }
        outgoing.push(Outgoing {
            target: request.request_node_name.clone(),
            payload: packed,
        });

        self.outgoing.lock().extend(outgoing);
    }

    fn pick_relays(&self, requester: &str) -> Vec<String> {
        if self.config.relay_factor == 0 {
            return Vec::new();
        }
        let candidates: Vec<String> = self
            .alive_members()
            .into_iter()
            .filter(|n| n != requester && n != self.name())
            .collect();
        candidates
            .choose_multiple(&mut rand::thread_rng(), self.config.relay_factor)
            .cloned()
            .collect()
    }

    // =========================================================================
    // LOCALLY ORIGINATED EVENTS
    // =========================================================================

    /// Announce the local node to the cluster
    pub fn join(&self) -> Result<(), ClusterError> {
        self.left.store(false, Ordering::SeqCst);
        let time = self.announce_join()?;
        info!(node = %self.name(), time, "announced join");
        Ok(())
    }

    fn announce_join(&self) -> Result<LogicalTime, ClusterError> {
        let msg = MemberJoin {
            join_time: self.member_clock.next(),
            node_name: self.name().to_string(),
        };
        let buf = pack_with_header(&msg)?;

        self.operate_node_join(&msg);
        self.member_queue
            .queue_broadcast(Some(msg.node_name.clone()), buf);
        Ok(msg.join_time)
    }

    /// Announce that the local node is leaving
    pub fn leave(&self) -> Result<(), ClusterError> {
        let msg = MemberLeave {
            leave_time: self.member_clock.next(),
            node_name: self.name().to_string(),
        };
        let buf = pack_with_header(&msg)?;

        self.left.store(true, Ordering::SeqCst);
        self.operate_node_leave(&msg);
        self.member_queue
            .queue_broadcast(Some(msg.node_name.clone()), buf);
        info!(node = %msg.node_name, time = msg.leave_time, "announced leave");
        Ok(())
    }

    /// Whether the local node has announced its departure
    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    /// Send a cluster-wide request and collect responses
    pub fn request(
        &self,
        name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<ResponseStream, ClusterError> {
        if self.has_left() {
            return Err(ClusterError::Left);
        }

        let msg = Request {
            request_time: self.request_clock.next(),
            request_node_name: self.name().to_string(),
            request_name: name.into(),
            payload,
        };
        let buf = pack_with_header(&msg)?;

        // our own request coming back through gossip is a duplicate
        self.request_log.lock().observe(
            msg.request_time,
            msg.request_time,
            &msg.request_node_name,
            &msg.request_name,
        );
        let stream = self
            .pending
            .register(msg.request_time, &msg.request_name, self.config.request_timeout);
        self.request_queue.queue_broadcast(None, buf);

        debug!(name = %msg.request_name, time = msg.request_time, "sent request");
        Ok(stream)
    }

    /// Drain unicast messages (responses, relays) for the transport
    pub fn take_outgoing(&self) -> Vec<Outgoing> {
        std::mem::take(&mut *self.outgoing.lock())
    }

    // =========================================================================
    // TRANSPORT NOTIFICATIONS
    // =========================================================================

    /// The transport discovered `node`.
    ///
    /// Transport presence ranks below every announced event, so this merges
    /// a join at time zero: it only creates records for nodes never heard of,
    /// or restores one the transport itself removed. Tombstoned nodes stay left.
    pub fn handle_node_join(&self, node: &Node) {
        let tags = Self::decode_tags(node);
        let mut members = self.members.write();
        let joined = if members.apply_join(&node.name, 0) {
            debug!(node = %node.name, addr = %node.addr, "first seen through transport");
            true
        } else if members.mark_reachable(&node.name) {
            debug!(node = %node.name, addr = %node.addr, "reachable again");
            true
        } else {
            false
        };
        members.update_details(&node.name, node.addr, tags);
        let time = members
            .lookup(&node.name)
            .map(|r| r.last_message_time)
            .unwrap_or_default();
        drop(members);

        if joined {
            self.emit(ClusterEvent::MemberJoin {
                name: node.name.clone(),
                time,
            });
        }
    }

    /// The transport lost `node`.
    ///
    /// The node is marked left locally at its last known time but not
    /// tombstoned: a failure is not a departure, and is neither gossiped nor
    /// sent in push/pull.
    pub fn handle_node_leave(&self, node: &Node) {
        if node.name == self.name() {
            return;
        }
        let removed = self.members.write().mark_unreachable(&node.name);
        if let Some(time) = removed {
            debug!(node = %node.name, time, "unreachable through transport");
            self.emit(ClusterEvent::MemberLeave {
                name: node.name.clone(),
                time,
            });
        }
    }

    /// The transport saw new metadata for `node`.
    pub fn handle_node_update(&self, node: &Node) {
        let tags = Self::decode_tags(node);
        let updated = self
            .members
            .write()
            .update_details(&node.name, node.addr, tags);
        if updated {
            self.emit(ClusterEvent::MemberUpdate {
                name: node.name.clone(),
            });
        }
    }

    /// Two transport nodes claim the same name.
    pub(crate) fn record_conflict(&self, known: &Node, other: &Node) {
        self.emit(ClusterEvent::MemberConflict {
            known: known.clone(),
            other: other.clone(),
        });
    }

    fn decode_tags(node: &Node) -> member_gossip_core::NodeTags {
        codec::unpack_node_tags(&node.meta).unwrap_or_else(|e| {
            warn!(node = %node.name, "unpack node tags failed: {}", e);
            Default::default()
        })
    }

    /// Packed local tags, or nothing if they do not fit `limit`
    pub fn node_meta(&self, limit: usize) -> Vec<u8> {
        match codec::pack_node_tags_limited(&self.config.tags, limit) {
            Ok(meta) => meta,
            Err(e) => {
                error!("node tags unavailable: {}", e);
                Vec::new()
            }
        }
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Close request collectors past their timeout
    pub fn expire_requests(&self) -> usize {
        self.pending.expire(Instant::now())
    }

    /// Evict tombstones older than the retention window
    pub fn reap(&self) -> Vec<String> {
        let reaped = self
            .members
            .write()
            .reap_left(self.config.tombstone_retention);
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped left members");
        }
        reaped
    }

    /// Get cluster statistics
    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            member_time: self.member_clock.time(),
            request_time: self.request_clock.time(),
            members: self.members.read().stats(),
            queued_member_broadcasts: self.member_queue.num_queued(),
            queued_request_broadcasts: self.request_queue.num_queued(),
            pending_requests: self.pending.len(),
        }
    }
}
