//! Push/pull anti-entropy
//!
//! The transport exchanges full local views when a node joins and
//! periodically afterwards. Remote views are merged through the same
//! last-writer-wins rules as gossiped events, and nothing merged here is
//! re-broadcast.

use crate::cluster::Cluster;
use member_gossip_core::codec::{self, pack_with_header};
use member_gossip_core::{MemberJoin, MemberLeave, MessageType, PushPull};
use std::collections::HashSet;
use tracing::{debug, error};

impl Cluster {
    /// Current view tagged as a push/pull message; `None` if it cannot be packed.
    pub fn local_state(&self, join: bool) -> Option<Vec<u8>> {
        let msg = {
            let members = self.read_members();
            PushPull {
                member_clock_time: self.member_clock().time(),
                request_clock_time: self.request_clock().time(),
                member_last_message_times: members.snapshot(),
                left_member_names: members.left_names(),
            }
        };

        match pack_with_header(&msg) {
            Ok(buf) => {
                debug!(
                    join,
                    members = msg.member_last_message_times.len(),
                    left = msg.left_member_names.len(),
                    "prepared local state"
                );
                Some(buf)
            }
            Err(e) => {
                error!("pack state push/pull message failed: {}", e);
                None
            }
        }
    }

    /// Merge a remote view produced by [`Cluster::local_state`].
    pub fn merge_remote_state(&self, buf: &[u8], join: bool) {
        let msg: PushPull = match codec::split_header(buf) {
            Ok((MessageType::PushPull, body)) => match codec::unpack(body) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("unpack state push/pull message failed: {}", e);
                    return;
                }
            },
            Ok((other, _)) => {
                error!("BUG: received illegal state push/pull message, ignored: {}", other);
                return;
            }
            Err(e) => {
                error!("BUG: received illegal state push/pull message, ignored: {}", e);
                return;
            }
        };

        debug!(join, members = msg.member_last_message_times.len(), "received remote state");

        // remote clocks are sent as current values; witness one below
        if msg.member_clock_time > 0 {
            self.member_clock().update(msg.member_clock_time - 1);
        }
        if msg.request_clock_time > 0 {
            self.request_clock().update(msg.request_clock_time - 1);
        }

        // leaves first, so a node listed in both is not revived by its own time
        let mut left = HashSet::with_capacity(msg.left_member_names.len());
        for name in &msg.left_member_names {
            left.insert(name.as_str());
            self.operate_node_leave(&MemberLeave {
                leave_time: msg
                    .member_last_message_times
                    .get(name)
                    .copied()
                    .unwrap_or_default(),
                node_name: name.clone(),
            });
        }

        for (name, time) in &msg.member_last_message_times {
            if left.contains(name.as_str()) {
                continue;
            }
            self.operate_node_join(&MemberJoin {
                join_time: *time,
                node_name: name.clone(),
            });
        }
    }
}
