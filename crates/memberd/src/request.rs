//! Request tracking: duplicate suppression and response collection

use member_gossip_core::{LogicalTime, Request, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// A request as seen by the local handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub request_time: LogicalTime,
    pub from: String,
    pub name: String,
    pub payload: Vec<u8>,
}

impl From<&Request> for IncomingRequest {
    fn from(req: &Request) -> Self {
        Self {
            request_time: req.request_time,
            from: req.request_node_name.clone(),
            name: req.request_name.clone(),
            payload: req.payload.clone(),
        }
    }
}

/// Application logic answering cluster-wide requests.
///
/// Called once per novel request; returning `Some` sends a response back
/// to the requester.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &IncomingRequest) -> Option<Vec<u8>>;
}

/// Handler that never answers
#[derive(Debug, Default)]
pub struct NoopRequestHandler;

impl RequestHandler for NoopRequestHandler {
    fn handle(&self, _request: &IncomingRequest) -> Option<Vec<u8>> {
        None
    }
}

impl<F> RequestHandler for F
where
    F: Fn(&IncomingRequest) -> Option<Vec<u8>> + Send + Sync,
{
    fn handle(&self, request: &IncomingRequest) -> Option<Vec<u8>> {
        self(request)
    }
}

// =============================================================================
// SEEN REQUESTS
// =============================================================================

#[derive(Debug, Default, Clone)]
struct Slot {
    time: LogicalTime,
    seen: Vec<(String, String)>,
}

/// Ring buffer of recently handled requests, indexed by `time % capacity`
#[derive(Debug)]
pub struct RequestLog {
    slots: Vec<Slot>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record a request; `false` if it is a duplicate or too old to judge.
    ///
    /// `clock_time` is the request clock after witnessing the request.
    pub fn observe(
        &mut self,
        clock_time: LogicalTime,
        time: LogicalTime,
        node: &str,
        name: &str,
    ) -> bool {
        let capacity = self.slots.len() as LogicalTime;
        if clock_time >= capacity && time < clock_time - capacity {
            return false;
        }

        let idx = (time % capacity) as usize;
        let slot = &mut self.slots[idx];
        if slot.time != time {
            slot.time = time;
            slot.seen.clear();
        }
        if slot.seen.iter().any(|(n, r)| n == node && r == name) {
            return false;
        }
        slot.seen.push((node.to_string(), name.to_string()));
        true
    }
}

// =============================================================================
// PENDING RESPONSES
// =============================================================================

/// One response delivered to the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Responses to a request issued by this node
#[derive(Debug)]
pub struct ResponseStream {
    request_time: LogicalTime,
    receiver: mpsc::UnboundedReceiver<RequestResponse>,
}

impl ResponseStream {
    /// Request clock time the request was stamped with
    pub fn request_time(&self) -> LogicalTime {
        self.request_time
    }

    /// Next response, waiting until one arrives or the request closes
    pub async fn recv(&mut self) -> Option<RequestResponse> {
        self.receiver.recv().await
    }

    /// Next already-delivered response, without waiting
    pub fn try_recv(&mut self) -> Option<RequestResponse> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
struct PendingRequest {
    name: String,
    deadline: Instant,
    responders: Vec<String>,
    sender: mpsc::UnboundedSender<RequestResponse>,
}

/// Collectors for requests awaiting responses, keyed by request time
#[derive(Debug, Default)]
pub struct PendingRequests {
    pending: Mutex<HashMap<LogicalTime, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a collector
    pub fn register(&self, request_time: LogicalTime, name: &str, timeout: Duration) -> ResponseStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.pending.lock().insert(
            request_time,
            PendingRequest {
                name: name.to_string(),
                deadline: Instant::now() + timeout,
                responders: Vec::new(),
                sender,
            },
        );
        ResponseStream {
            request_time,
            receiver,
        }
    }

    /// Route a response to its collector; `false` if unmatched or duplicate.
    pub fn deliver(&self, response: &Response) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&response.request_time) else {
            debug!(time = response.request_time, "response for unknown request");
            return false;
        };
        if entry.name != response.request_name {
            debug!(
                time = response.request_time,
                name = %response.request_name,
                "response name does not match pending request"
            );
            return false;
        }
        if entry.responders.contains(&response.response_node_name) {
            return false;
        }
        entry.responders.push(response.response_node_name.clone());

        let delivered = entry
            .sender
            .send(RequestResponse {
                from: response.response_node_name.clone(),
                payload: response.payload.clone(),
            })
            .is_ok();
        if !delivered {
            // receiver dropped; nobody is listening anymore
            pending.remove(&response.request_time);
        }
        delivered
    }

    /// Close a collector early
    pub fn close(&self, request_time: LogicalTime) -> bool {
        self.pending.lock().remove(&request_time).is_some()
    }

    /// Close collectors past their deadline; returns how many were closed
    pub fn expire(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.deadline > now);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
