//! Retransmit-limited broadcast queues
//!
//! Pending gossip is piggybacked onto the transport's outgoing packets.
//! Each entry is handed out up to `retransmit_mult * ceil(log10(n + 1))`
//! times for a cluster of `n` alive nodes, then dropped. An entry with a key
//! supersedes every older entry with the same key.

use parking_lot::Mutex;
use tracing::trace;

/// Queued broadcast
#[derive(Debug, Clone)]
struct Broadcast {
    /// Insertion order; higher is newer
    id: u64,
    /// Entries with equal keys invalidate each other
    key: Option<String>,
    payload: Vec<u8>,
    transmits: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<Broadcast>,
    next_id: u64,
}

/// Broadcast queue bounded by a per-entry retransmit limit
#[derive(Debug)]
pub struct TransmitLimitedQueue {
    retransmit_mult: u32,
    state: Mutex<QueueState>,
}

/// Maximum transmissions of one entry for `num_nodes` alive nodes
pub fn retransmit_limit(retransmit_mult: u32, num_nodes: usize) -> u32 {
    let scale = ((num_nodes as f64) + 1.0).log10().ceil() as u32;
    retransmit_mult.saturating_mul(scale.max(1))
}

impl TransmitLimitedQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            retransmit_mult: retransmit_mult.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queue `payload`, dropping older entries that carry the same key.
    pub fn queue_broadcast(&self, key: Option<String>, payload: Vec<u8>) {
        let mut state = self.state.lock();
        if let Some(k) = key.as_deref() {
            let before = state.entries.len();
            state.entries.retain(|b| b.key.as_deref() != Some(k));
            let dropped = before - state.entries.len();
            if dropped > 0 {
                trace!(key = k, dropped, "superseded queued broadcasts");
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Broadcast {
            id,
            key,
            payload,
            transmits: 0,
        });
    }

    /// Select broadcasts whose `overhead + len` fit within `limit` bytes.
    ///
    /// Entries with the most retransmissions left go first, newest first on
    /// ties. Selected entries count one transmission and are dropped once
    /// they reach the retransmit limit for `num_nodes`. An entry larger than
    /// the whole of `limit` also counts a transmission, so one that never
    /// fits still ages out.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize, num_nodes: usize) -> Vec<Vec<u8>> {
        self.get_broadcasts_within(overhead, limit, limit, num_nodes)
    }

    /// Like [`TransmitLimitedQueue::get_broadcasts`] with only `budget` of a
    /// `limit`-byte packet left; entries too large for `limit` age out.
    pub fn get_broadcasts_within(
        &self,
        overhead: usize,
        budget: usize,
        limit: usize,
        num_nodes: usize,
    ) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return Vec::new();
        }

        let transmit_limit = retransmit_limit(self.retransmit_mult, num_nodes);
        state
            .entries
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

        let mut used = 0usize;
        let mut selected = Vec::new();
        for entry in state.entries.iter_mut() {
            let cost = overhead + entry.payload.len();
            if cost > limit {
                trace!(size = entry.payload.len(), limit, "broadcast exceeds packet budget");
                entry.transmits += 1;
                continue;
            }
            if used + cost > budget {
                continue;
            }
            used += cost;
            entry.transmits += 1;
            selected.push(entry.payload.clone());
        }

        state.entries.retain(|b| b.transmits < transmit_limit);
        selected
    }

    /// Number of queued entries
    pub fn num_queued(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Drop everything queued
    pub fn reset(&self) {
        self.state.lock().entries.clear();
    }

    /// Copies of the queued payloads, in no particular order
    pub fn queued_payloads(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|b| b.payload.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_limit() {
        assert_eq!(retransmit_limit(4, 0), 4);
        assert_eq!(retransmit_limit(4, 1), 4);
        assert_eq!(retransmit_limit(4, 9), 4);
        assert_eq!(retransmit_limit(4, 10), 8);
        assert_eq!(retransmit_limit(3, 100), 9);
    }

    #[test]
    fn test_byte_budget() {
        let queue = TransmitLimitedQueue::new(4);
        queue.queue_broadcast(None, vec![1; 10]);
        queue.queue_broadcast(None, vec![2; 10]);
        queue.queue_broadcast(None, vec![3; 10]);

        // room for two entries of 10 bytes + 2 overhead
        let out = queue.get_broadcasts(2, 25, 3);
        assert_eq!(out.len(), 2);
        // newest first
        assert_eq!(out[0], vec![3; 10]);
        assert_eq!(out[1], vec![2; 10]);

        // the untransmitted entry now has priority
        let out = queue.get_broadcasts(2, 12, 3);
        assert_eq!(out, vec![vec![1; 10]]);
    }

    #[test]
    fn test_small_entry_fills_leftover_budget() {
        let queue = TransmitLimitedQueue::new(4);
        queue.queue_broadcast(None, vec![1; 3]);
        queue.queue_broadcast(None, vec![2; 20]);

        let out = queue.get_broadcasts(0, 10, 3);
        assert_eq!(out, vec![vec![1; 3]]);
    }

    #[test]
    fn test_entries_expire_after_limit() {
        let queue = TransmitLimitedQueue::new(2);
        queue.queue_broadcast(None, vec![7]);

        // 3 nodes -> limit 2
        assert_eq!(queue.get_broadcasts(0, 100, 3).len(), 1);
        assert_eq!(queue.num_queued(), 1);
        assert_eq!(queue.get_broadcasts(0, 100, 3).len(), 1);
        assert_eq!(queue.num_queued(), 0);
        assert!(queue.get_broadcasts(0, 100, 3).is_empty());
    }

    #[test]
    fn test_oversized_entry_ages_out() {
        let queue = TransmitLimitedQueue::new(2);
        queue.queue_broadcast(None, vec![9; 50]);
        queue.queue_broadcast(None, vec![1; 4]);

        // 3 nodes -> limit 2; the large entry never fits 20 bytes
        assert_eq!(queue.get_broadcasts(2, 20, 3), vec![vec![1; 4]]);
        assert_eq!(queue.num_queued(), 2);
        assert_eq!(queue.get_broadcasts(2, 20, 3), vec![vec![1; 4]]);
        assert_eq!(queue.num_queued(), 0);
    }

    #[test]
    fn test_crowded_out_entry_is_not_charged() {
        let queue = TransmitLimitedQueue::new(1);
        queue.queue_broadcast(None, vec![5; 30]);

        // fits the packet, not the space left in it
        assert!(queue.get_broadcasts_within(0, 10, 100, 3).is_empty());
        assert!(queue.get_broadcasts_within(0, 10, 100, 3).is_empty());
        assert_eq!(queue.num_queued(), 1);
        assert_eq!(queue.get_broadcasts_within(0, 40, 100, 3), vec![vec![5; 30]]);
    }

    #[test]
    fn test_keyed_entries_supersede() {
        let queue = TransmitLimitedQueue::new(4);
        queue.queue_broadcast(Some("b".into()), vec![1]);
        queue.queue_broadcast(Some("c".into()), vec![2]);
        queue.queue_broadcast(Some("b".into()), vec![3]);
        queue.queue_broadcast(None, vec![4]);

        let mut payloads = queue.queued_payloads();
        payloads.sort();
        assert_eq!(payloads, vec![vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_reset() {
        let queue = TransmitLimitedQueue::new(4);
        queue.queue_broadcast(None, vec![1]);
        queue.reset();
        assert_eq!(queue.num_queued(), 0);
    }
}
