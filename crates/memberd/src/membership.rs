//! Membership state table with left-member tombstones
//!
//! Last-writer-wins per node, ordered by the membership logical clock. The
//! table itself is not synchronized; the cluster guards it with a single
//! `RwLock` so each merge decision and its mutation happen atomically.
//!
//! Failures reported by the transport only mark a node unreachable: its
//! status becomes `Left` locally, but no tombstone is written, so the
//! transport seeing it again restores it.

use member_gossip_core::{LogicalTime, NodeTags};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::trace;

/// Member status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Last accepted event was a join
    Alive,
    /// Last accepted event was a leave
    Left,
}

/// Member information
#[derive(Debug, Clone)]
pub struct MemberRecord {
    /// Unique node name
    pub name: String,
    /// Current status
    pub status: MemberStatus,
    /// Membership clock time of the last accepted join/leave
    pub last_message_time: LogicalTime,
    /// Address reported by the transport, if it has seen the node
    pub addr: Option<SocketAddr>,
    /// Tags decoded from transport metadata
    pub tags: NodeTags,
}

impl MemberRecord {
    fn new(name: &str, status: MemberStatus, time: LogicalTime) -> Self {
        Self {
            name: name.to_string(),
            status,
            last_message_time: time,
            addr: None,
            tags: NodeTags::new(),
        }
    }
}

/// Tombstone for a departed node
#[derive(Debug, Clone, Copy)]
struct LeftMember {
    leave_time: LogicalTime,
    recorded_at: Instant,
}

/// Per-node records plus the left-member set
#[derive(Debug, Default)]
pub struct MembershipTable {
    members: HashMap<String, MemberRecord>,
    left: HashMap<String, LeftMember>,
    /// Nodes removed by the transport, with when that happened
    unreachable: HashMap<String, Instant>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node
    pub fn lookup(&self, name: &str) -> Option<&MemberRecord> {
        self.members.get(name)
    }

    /// Departure time of a tombstoned node
    pub fn left_time(&self, name: &str) -> Option<LogicalTime> {
        self.left.get(name).map(|l| l.leave_time)
    }

    /// Merge a join for `name` at `time`.
    ///
    /// Accepted only if no tombstone at or after `time` exists and the node is
    /// unknown or last seen strictly before `time`.
    pub fn apply_join(&mut self, name: &str, time: LogicalTime) -> bool {
        if let Some(left) = self.left.get(name) {
            if left.leave_time >= time {
                trace!(node = name, time, left_at = left.leave_time, "join shadowed by tombstone");
                return false;
            }
        }

        match self.members.get_mut(name) {
            Some(record) if record.last_message_time >= time => {
                trace!(node = name, time, last = record.last_message_time, "stale join");
                return false;
            }
            Some(record) => {
                record.last_message_time = time;
                record.status = MemberStatus::Alive;
            }
            None => {
                self.members
                    .insert(name.to_string(), MemberRecord::new(name, MemberStatus::Alive, time));
            }
        }

        self.left.remove(name);
        self.unreachable.remove(name);
        true
    }

    /// Merge a leave for `name` at `time`.
    ///
    /// Accepted if the node is unknown or last seen at or before `time`; a
    /// tombstone already at or after `time` makes it a duplicate.
    pub fn apply_leave(&mut self, name: &str, time: LogicalTime) -> bool {
        if let Some(left) = self.left.get(name) {
            if left.leave_time >= time {
                trace!(node = name, time, "duplicate leave");
                return false;
            }
        }

        match self.members.get_mut(name) {
            Some(record) if record.last_message_time > time => {
                trace!(node = name, time, last = record.last_message_time, "stale leave");
                return false;
            }
            Some(record) => {
                record.last_message_time = time;
                record.status = MemberStatus::Left;
            }
            None => {
                self.members
                    .insert(name.to_string(), MemberRecord::new(name, MemberStatus::Left, time));
            }
        }

        self.unreachable.remove(name);
        self.left.insert(
            name.to_string(),
            LeftMember {
                leave_time: time,
                recorded_at: Instant::now(),
            },
        );
        true
    }

    /// Mark an alive node unreachable without tombstoning it.
    ///
    /// Returns its last message time if the status changed.
    pub fn mark_unreachable(&mut self, name: &str) -> Option<LogicalTime> {
        let record = self.members.get_mut(name)?;
        if record.status != MemberStatus::Alive {
            return None;
        }
        record.status = MemberStatus::Left;
        self.unreachable.insert(name.to_string(), Instant::now());
        Some(record.last_message_time)
    }

    /// Restore a node removed by [`MembershipTable::mark_unreachable`].
    ///
    /// Tombstoned nodes stay left.
    pub fn mark_reachable(&mut self, name: &str) -> bool {
        if self.unreachable.remove(name).is_none() {
            return false;
        }
        match self.members.get_mut(name) {
            Some(record) if record.status == MemberStatus::Left => {
                record.status = MemberStatus::Alive;
                true
            }
            _ => false,
        }
    }

    /// Whether the node was removed by the transport and not since heard from
    pub fn is_unreachable(&self, name: &str) -> bool {
        self.unreachable.contains_key(name)
    }

    /// Refresh transport-level details of a known node
    pub fn update_details(&mut self, name: &str, addr: SocketAddr, tags: NodeTags) -> bool {
        match self.members.get_mut(name) {
            Some(record) => {
                record.addr = Some(addr);
                record.tags = tags;
                true
            }
            None => false,
        }
    }

    /// Copy of `{name: last_message_time}` for every record
    pub fn snapshot(&self) -> BTreeMap<String, LogicalTime> {
        self.members
            .iter()
            .map(|(name, record)| (name.clone(), record.last_message_time))
            .collect()
    }

    /// Names in the left-member set, sorted
    pub fn left_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.left.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of alive members, sorted
    pub fn alive_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Alive)
            .map(|m| m.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of alive members
    pub fn alive_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.status == MemberStatus::Alive)
            .count()
    }

    /// Evict tombstones and unreachable nodes (with their records) older
    /// than `retention`.
    ///
    /// Returns the evicted names.
    pub fn reap_left(&mut self, retention: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .left
            .iter()
            .filter(|(_, l)| now.duration_since(l.recorded_at) >= retention)
            .map(|(name, _)| name.clone())
            .collect();
        expired.extend(
            self.unreachable
                .iter()
                .filter(|(_, since)| now.duration_since(**since) >= retention)
                .map(|(name, _)| name.clone()),
        );

        for name in &expired {
            self.left.remove(name);
            self.unreachable.remove(name);
            if matches!(self.members.get(name), Some(r) if r.status == MemberStatus::Left) {
                self.members.remove(name);
            }
        }
        expired.sort();
        expired
    }

    /// Iterate all records
    pub fn iter(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    /// Get membership stats
    pub fn stats(&self) -> MembershipStats {
        let alive = self.alive_count();
        MembershipStats {
            total: self.members.len(),
            alive,
            left: self.members.len() - alive,
        }
    }
}

/// Membership statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipStats {
    pub total: usize,
    pub alive: usize,
    pub left: usize,
}
