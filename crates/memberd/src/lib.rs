//! memberd - gossip membership coordination
//!
//! This crate provides:
//! - Last-writer-wins membership table with left-member tombstones
//! - Retransmit-limited broadcast queues for epidemic forwarding
//! - Message dispatch and transport hooks (delegates)
//! - Push/pull anti-entropy
//! - Cluster-wide requests with relayed responses
//! - A lossy in-memory network for exercising all of the above

pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod delegate;
pub mod membership;
pub mod request;
pub mod sim;
pub mod sync;

pub use broadcast::TransmitLimitedQueue;
pub use cluster::{Cluster, ClusterError, ClusterEvent};
pub use config::{ClusterConfig, Config};
pub use delegate::{
    ConflictDelegate, Delegate, EventDelegate, MessageDelegate, NodeConflictDelegate,
    NodeEventDelegate,
};
pub use membership::{MemberRecord, MemberStatus, MembershipTable};
pub use request::{RequestHandler, ResponseStream};
pub use sim::Simulation;
