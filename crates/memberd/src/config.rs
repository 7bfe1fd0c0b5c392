//! Configuration for memberd

use clap::Parser;
use member_gossip_core::NodeTags;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// memberd - gossip membership coordination simulator
#[derive(Parser, Debug, Clone)]
#[command(name = "memberd")]
#[command(about = "Runs member-gossip nodes over a lossy in-memory network")]
pub struct Config {
    /// Number of simulated nodes
    #[arg(short, long, default_value = "16")]
    pub nodes: usize,

    /// Gossip rounds to run before checking convergence
    #[arg(short, long, default_value = "60")]
    pub rounds: u32,

    /// Seed for the simulated network
    #[arg(long, env = "MEMBERD_SEED", default_value = "7")]
    pub seed: u64,

    /// Probability that a message is lost in flight
    #[arg(long, default_value = "0.2")]
    pub loss_rate: f64,

    /// Probability that a delivered message is delivered twice
    #[arg(long, default_value = "0.1")]
    pub duplicate_rate: f64,

    /// Peers each node gossips to per round
    #[arg(long, default_value = "3")]
    pub fanout: usize,

    /// Byte budget of one gossip packet
    #[arg(long, default_value = "1400")]
    pub packet_limit: usize,

    /// Per-message framing overhead charged against the packet budget
    #[arg(long, default_value = "2")]
    pub message_overhead: usize,

    /// Run a push/pull exchange every N rounds (0 disables)
    #[arg(long, default_value = "10")]
    pub push_pull_every: u32,

    /// Number of nodes that leave gracefully mid-run
    #[arg(long, default_value = "2")]
    pub leavers: usize,

    /// Retransmit multiplier for broadcast queues
    #[arg(long, default_value = "4")]
    pub retransmit_mult: u32,

    /// Extra relay paths per response
    #[arg(long, default_value = "1")]
    pub relay_factor: usize,

    /// Node tags advertised as metadata (key=value, comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nodes < 2 {
            anyhow::bail!("At least 2 nodes are needed to gossip");
        }
        if self.leavers >= self.nodes {
            anyhow::bail!("At least one node must stay in the cluster");
        }
        for (name, rate) in [("loss rate", self.loss_rate), ("duplicate rate", self.duplicate_rate)] {
            if !(0.0..1.0).contains(&rate) {
                anyhow::bail!("{name} must be in [0, 1), got {rate}");
            }
        }
        if self.fanout == 0 {
            anyhow::bail!("Fanout must be at least 1");
        }
        if self.packet_limit <= self.message_overhead {
            anyhow::bail!("Packet limit must exceed the per-message overhead");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        parse_tags(&self.tags)?;
        Ok(())
    }

    /// Cluster settings for the simulated node called `node_name`
    pub fn cluster_config(&self, node_name: &str) -> anyhow::Result<ClusterConfig> {
        Ok(ClusterConfig {
            node_name: node_name.to_string(),
            tags: parse_tags(&self.tags)?,
            retransmit_mult: self.retransmit_mult,
            relay_factor: self.relay_factor,
            ..ClusterConfig::default()
        })
    }
}

/// Parse `key=value` pairs
pub fn parse_tags(pairs: &[String]) -> anyhow::Result<NodeTags> {
    let mut tags = NodeTags::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Tag must look like key=value: {pair}"))?;
        if key.is_empty() {
            anyhow::bail!("Tag key cannot be empty: {pair}");
        }
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

/// Settings of one cluster node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Unique name of the local node
    pub node_name: String,
    /// Tags advertised through transport metadata
    pub tags: NodeTags,
    /// Broadcast retransmit multiplier
    pub retransmit_mult: u32,
    /// Number of recent request times remembered for duplicate detection
    pub request_log_capacity: usize,
    /// How long a local request collects responses
    pub request_timeout: Duration,
    /// Extra relay copies sent with every response
    pub relay_factor: usize,
    /// How long left-member tombstones are kept
    pub tombstone_retention: Duration,
    /// Capacity of the cluster event channel
    pub event_buffer: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: "local".to_string(),
            tags: NodeTags::new(),
            retransmit_mult: 4,
            request_log_capacity: 512,
            request_timeout: Duration::from_secs(15),
            relay_factor: 0,
            tombstone_retention: Duration::from_secs(24 * 3600),
            event_buffer: 256,
        }
    }
}

impl ClusterConfig {
    /// Default settings for a node called `name`
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            node_name: name.into(),
            ..Self::default()
        }
    }
}
