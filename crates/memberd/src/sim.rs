//! Lossy in-memory network driving a set of nodes
//!
//! Stands in for the probing transport: every round each running node
//! piggybacks its pending broadcasts to a few random peers, unicast replies
//! are routed by name, and push/pull exchanges run on a fixed cadence.
//! Messages are dropped, duplicated and reordered according to the
//! configuration.

use crate::cluster::Cluster;
use crate::config::Config;
use crate::delegate::{Delegate, EventDelegate, MessageDelegate, NodeEventDelegate};
use crate::membership::MemberStatus;
use crate::request::{IncomingRequest, ResponseStream};
use member_gossip_core::{LogicalTime, Node};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// Rounds a leaving node keeps gossiping before it stops
const LEAVE_GRACE_ROUNDS: u32 = 5;

/// One member's view as compared for convergence
pub type View = Vec<(String, MemberStatus, LogicalTime)>;

/// A simulated process
pub struct SimNode {
    pub cluster: Arc<Cluster>,
    pub node: Node,
    delegate: MessageDelegate,
    presence: NodeEventDelegate,
    running: bool,
    stop_at: Option<u32>,
}

impl SimNode {
    fn new(cluster: Cluster, index: usize) -> Self {
        let cluster = Arc::new(cluster);
        let addr = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 7000 + index as u16));
        let mut node = Node::new(cluster.name(), addr);
        node.meta = cluster.node_meta(512);
        Self {
            delegate: MessageDelegate::new(cluster.clone()),
            presence: NodeEventDelegate::new(cluster.clone()),
            cluster,
            node,
            running: true,
            stop_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Membership view, sorted by name
    pub fn view(&self) -> View {
        self.cluster
            .members()
            .into_iter()
            .map(|m| (m.name, m.status, m.last_message_time))
            .collect()
    }
}

/// Network counters
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub sent: u64,
    pub lost: u64,
    pub duplicated: u64,
    pub delivered: u64,
    pub push_pulls: u64,
}

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimReport {
    pub rounds: u32,
    pub converged: bool,
    /// First round after which all running nodes agreed
    pub converged_at: Option<u32>,
    pub running: usize,
    pub alive: usize,
    pub left: usize,
    pub responses: usize,
    pub network: NetworkStats,
}

/// Simulated cluster
pub struct Simulation {
    config: Config,
    nodes: Vec<SimNode>,
    rng: StdRng,
    network: NetworkStats,
    probe: Option<ResponseStream>,
    responses: usize,
}

impl Simulation {
    /// Build and start `config.nodes` nodes
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let mut nodes = Vec::with_capacity(config.nodes);
        for i in 0..config.nodes {
            let name = format!("node-{i}");
            let cluster = Cluster::new(config.cluster_config(&name)?).with_handler(
                move |req: &IncomingRequest| {
                    (req.name == "ping").then(|| format!("pong from node-{i}").into_bytes())
                },
            );
            nodes.push(SimNode::new(cluster, i));
        }

        // every node announces itself; the transport has already probed all peers
        for node in &nodes {
            node.cluster.join()?;
        }
        for a in 0..nodes.len() {
            for b in 0..nodes.len() {
                if a != b {
                    nodes[a].presence.notify_join(&nodes[b].node);
                }
            }
        }

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            nodes,
            network: NetworkStats::default(),
            probe: None,
            responses: 0,
        })
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    fn running(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].running)
            .collect()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.cluster.name() == name)
    }

    /// Push `payload` through the lossy network into `inbox`
    fn transmit(&mut self, target: usize, payload: Vec<u8>, inbox: &mut Vec<(usize, Vec<u8>)>) {
        self.network.sent += 1;
        if self.rng.gen_bool(self.config.loss_rate) {
            self.network.lost += 1;
            return;
        }
        if self.rng.gen_bool(self.config.duplicate_rate) {
            self.network.duplicated += 1;
            inbox.push((target, payload.clone()));
        }
        inbox.push((target, payload));
    }

    fn gossip(&mut self) {
        let running = self.running();
        let mut inbox = Vec::new();

        for &from in &running {
            let peers: Vec<usize> = running
                .iter()
                .copied()
                .filter(|&p| p != from)
                .collect::<Vec<_>>()
                .choose_multiple(&mut self.rng, self.config.fanout)
                .copied()
                .collect();

            for to in peers {
                let msgs = self.nodes[from]
                    .delegate
                    .get_broadcasts(self.config.message_overhead, self.config.packet_limit);
                for msg in msgs {
                    self.transmit(to, msg, &mut inbox);
                }
            }

            for out in self.nodes[from].cluster.take_outgoing() {
                match self.index_of(&out.target) {
                    Some(to) if self.nodes[to].running => self.transmit(to, out.payload, &mut inbox),
                    _ => debug!(node = %out.target, "unicast target unreachable"),
                }
            }
        }

        inbox.shuffle(&mut self.rng);
        for (to, payload) in inbox {
            if self.nodes[to].running {
                self.network.delivered += 1;
                self.nodes[to].delegate.notify_msg(&payload);
            }
        }
    }

    fn push_pull(&mut self) {
        let running = self.running();
        for &a in &running {
            let Some(&b) = running
                .iter()
                .filter(|&&p| p != a)
                .collect::<Vec<_>>()
                .choose(&mut self.rng)
                .copied()
            else {
                continue;
            };

            if let Some(state) = self.nodes[a].delegate.local_state(false) {
                self.nodes[b].delegate.merge_remote_state(&state, false);
            }
            if let Some(state) = self.nodes[b].delegate.local_state(false) {
                self.nodes[a].delegate.merge_remote_state(&state, false);
            }
            self.network.push_pulls += 1;
        }
    }

    fn lifecycle(&mut self, round: u32) -> anyhow::Result<()> {
        if round == 1 {
            self.probe = Some(self.nodes[0].cluster.request("ping", Vec::new())?);
        }

        if round == self.config.rounds / 3 {
            let total = self.nodes.len();
            for node in &mut self.nodes[total - self.config.leavers..] {
                node.cluster.leave()?;
                node.stop_at = Some(round + LEAVE_GRACE_ROUNDS);
            }
        }

        let stopping: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].running && self.nodes[i].stop_at == Some(round))
            .collect();
        for i in stopping {
            self.nodes[i].running = false;
            info!(node = %self.nodes[i].node.name, round, "node stopped");
            // failure detection on the survivors notices the departure
            let gone = self.nodes[i].node.clone();
            for other in self.running() {
                self.nodes[other].presence.notify_leave(&gone);
            }
        }
        Ok(())
    }

    /// Whether every running node holds the same view
    pub fn converged(&self) -> bool {
        let mut views = self
            .nodes
            .iter()
            .filter(|n| n.running)
            .map(SimNode::view);
        match views.next() {
            Some(first) => views.all(|v| v == first),
            None => true,
        }
    }

    /// Advance one round
    pub fn step(&mut self, round: u32) -> anyhow::Result<()> {
        self.lifecycle(round)?;
        self.gossip();
        if self.config.push_pull_every > 0 && round % self.config.push_pull_every == 0 {
            self.push_pull();
        }

        for node in self.nodes.iter().filter(|n| n.running) {
            node.cluster.expire_requests();
            node.cluster.reap();
        }
        if let Some(probe) = self.probe.as_mut() {
            while probe.try_recv().is_some() {
                self.responses += 1;
            }
        }
        Ok(())
    }

    /// Run all configured rounds
    pub fn run(&mut self) -> anyhow::Result<SimReport> {
        let mut converged_at = None;
        for round in 1..=self.config.rounds {
            self.step(round)?;

            let converged = self.converged();
            match (converged, converged_at) {
                (true, None) => converged_at = Some(round),
                (false, Some(_)) => converged_at = None,
                _ => {}
            }
            debug!(round, converged, "round finished");
        }

        let reference = self
            .nodes
            .iter()
            .find(|n| n.running)
            .map(|n| n.cluster.stats().members)
            .unwrap_or_default();

        Ok(SimReport {
            rounds: self.config.rounds,
            converged: self.converged(),
            converged_at,
            running: self.running().len(),
            alive: reference.alive,
            left: reference.left,
            responses: self.responses,
            network: self.network.clone(),
        })
    }
}
