//! Order-independence of membership merging under shuffled, duplicated and
//! concurrent delivery.

use clap::Parser;
use member_gossip_core::codec::pack_with_header;
use member_gossip_core::{MemberJoin, MemberLeave, Node};
use memberd::delegate::{Delegate, EventDelegate, MessageDelegate, NodeEventDelegate};
use memberd::{Cluster, ClusterConfig, Config, MemberStatus, Simulation};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;

type View = Vec<(String, MemberStatus, u64)>;

/// Random join/leave history with distinct, totally ordered times per node
fn history(rng: &mut StdRng, nodes: usize) -> Vec<Vec<u8>> {
    let mut msgs = Vec::new();
    for n in 0..nodes {
        let name = format!("n{n}");
        let mut times: Vec<u64> = (1..=30).collect();
        times.shuffle(rng);
        for &time in times.iter().take(rng.gen_range(1..6)) {
            let buf = if rng.gen_bool(0.5) {
                pack_with_header(&MemberJoin {
                    join_time: time,
                    node_name: name.clone(),
                })
            } else {
                pack_with_header(&MemberLeave {
                    leave_time: time,
                    node_name: name.clone(),
                })
            };
            msgs.push(buf.unwrap());
        }
    }
    msgs
}

fn view(cluster: &Cluster) -> View {
    cluster
        .members()
        .into_iter()
        .map(|m| (m.name, m.status, m.last_message_time))
        .collect()
}

fn deliver(msgs: &[Vec<u8>]) -> View {
    let cluster = Arc::new(Cluster::new(ClusterConfig::named("observer")));
    let delegate = MessageDelegate::new(cluster.clone());
    for msg in msgs {
        delegate.notify_msg(msg);
    }
    view(&cluster)
}

#[test]
fn shuffled_and_duplicated_delivery_converges() {
    for seed in 0..50 {
        let mut rng = StdRng::seed_from_u64(seed);
        let msgs = history(&mut rng, 6);
        let expected = deliver(&msgs);

        for _ in 0..10 {
            let mut replay = msgs.clone();
            let extra: Vec<Vec<u8>> = replay
                .choose_multiple(&mut rng, msgs.len() / 2)
                .cloned()
                .collect();
            replay.extend(extra);
            replay.shuffle(&mut rng);

            assert_eq!(deliver(&replay), expected, "seed {seed}");
        }
    }
}

#[test]
fn final_state_follows_latest_event() {
    let mut rng = StdRng::seed_from_u64(99);
    let msgs = history(&mut rng, 8);
    let result = deliver(&msgs);

    for (name, status, time) in result {
        // the greatest timestamp seen for the node decides its state
        let latest = msgs
            .iter()
            .filter_map(|buf| match member_gossip_core::codec::decode(buf).unwrap() {
                member_gossip_core::Message::MemberJoin(j) if j.node_name == name => {
                    Some((j.join_time, MemberStatus::Alive))
                }
                member_gossip_core::Message::MemberLeave(l) if l.node_name == name => {
                    Some((l.leave_time, MemberStatus::Left))
                }
                _ => None,
            })
            .max_by_key(|(t, _)| *t)
            .unwrap();
        assert_eq!((time, status), latest, "node {name}");
    }
}

#[test]
fn concurrent_dispatch_matches_sequential() {
    let mut rng = StdRng::seed_from_u64(7);
    let msgs = history(&mut rng, 10);
    let expected = deliver(&msgs);

    let cluster = Arc::new(Cluster::new(ClusterConfig::named("observer")));
    let chunks: Vec<Vec<Vec<u8>>> = msgs.chunks(5).map(|c| c.to_vec()).collect();
    let handles: Vec<_> = chunks
        .into_iter()
        .map(|chunk| {
            let delegate = MessageDelegate::new(cluster.clone());
            thread::spawn(move || {
                for msg in chunk.iter().rev() {
                    delegate.notify_msg(msg);
                    let _ = delegate.local_state(false);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(view(&cluster), expected);
    // witnessed every timestamp
    let max_time = expected.iter().map(|(_, _, t)| *t).max().unwrap();
    assert!(cluster.member_clock().time() >= max_time);
}

#[test]
fn anti_entropy_spreads_view() {
    let mut rng = StdRng::seed_from_u64(3);
    let msgs = history(&mut rng, 5);

    let source = Arc::new(Cluster::new(ClusterConfig::named("source")));
    let delegate = MessageDelegate::new(source.clone());
    for msg in &msgs {
        delegate.notify_msg(msg);
    }

    let fresh = Cluster::new(ClusterConfig::named("fresh"));
    fresh.merge_remote_state(&source.local_state(true).unwrap(), true);

    assert_eq!(view(&fresh), view(&source));
    assert_eq!(fresh.member_queue().num_queued(), 0);
}

fn status(cluster: &Cluster, name: &str) -> Option<MemberStatus> {
    cluster.member(name).map(|m| m.status)
}

fn exchange(a: &MessageDelegate, b: &MessageDelegate) {
    b.merge_remote_state(&a.local_state(false).unwrap(), false);
    a.merge_remote_state(&b.local_state(false).unwrap(), false);
}

#[test]
fn transport_flap_does_not_evict_running_node() {
    let a = Arc::new(Cluster::new(ClusterConfig::named("a")));
    let b = Arc::new(Cluster::new(ClusterConfig::named("b")));
    let (a_msgs, b_msgs) = (MessageDelegate::new(a.clone()), MessageDelegate::new(b.clone()));
    let a_presence = NodeEventDelegate::new(a.clone());
    let b_node = Node::new("b", "10.0.0.2:7946".parse().unwrap());

    b.join().unwrap();
    for msg in b_msgs.get_broadcasts(2, 1400) {
        a_msgs.notify_msg(&msg);
    }
    assert_eq!(status(&a, "b"), Some(MemberStatus::Alive));

    a_presence.notify_leave(&b_node);
    a_presence.notify_join(&b_node);
    assert_eq!(status(&a, "b"), Some(MemberStatus::Alive));

    exchange(&a_msgs, &b_msgs);
    exchange(&b_msgs, &a_msgs);
    assert_eq!(status(&a, "b"), Some(MemberStatus::Alive));
    assert_eq!(status(&b, "b"), Some(MemberStatus::Alive));
    assert!(!b.has_left());
}

#[test]
fn restarted_node_overturns_stale_tombstone() {
    let a = Arc::new(Cluster::new(ClusterConfig::named("a")));
    let a_msgs = MessageDelegate::new(a.clone());
    a.join().unwrap();

    // b left at 5 in an earlier life
    a_msgs.notify_msg(
        &pack_with_header(&MemberLeave {
            leave_time: 5,
            node_name: "b".into(),
        })
        .unwrap(),
    );

    // restarted with a fresh clock, its join is too old to count
    let b = Arc::new(Cluster::new(ClusterConfig::named("b")));
    let b_msgs = MessageDelegate::new(b.clone());
    b.join().unwrap();
    for msg in b_msgs.get_broadcasts(2, 1400) {
        a_msgs.notify_msg(&msg);
    }
    assert_eq!(status(&a, "b"), Some(MemberStatus::Left));

    // b learns of the tombstone and announces itself past it
    exchange(&a_msgs, &b_msgs);
    let b_record = b.member("b").unwrap();
    assert_eq!(b_record.status, MemberStatus::Alive);
    assert!(b_record.last_message_time > 5);
    assert_eq!(status(&a, "b"), Some(MemberStatus::Alive));

    // and gossips the refutation
    let fresh = Arc::new(Cluster::new(ClusterConfig::named("c")));
    let c_msgs = MessageDelegate::new(fresh.clone());
    for msg in b_msgs.get_broadcasts(2, 1400) {
        c_msgs.notify_msg(&msg);
    }
    let seen = fresh.member("b").unwrap();
    assert_eq!(seen.status, MemberStatus::Alive);
    assert_eq!(seen.last_message_time, b_record.last_message_time);
}

#[test]
fn lossy_simulation_converges() {
    let config = Config::parse_from([
        "memberd",
        "--nodes",
        "8",
        "--rounds",
        "40",
        "--loss-rate",
        "0.1",
        "--duplicate-rate",
        "0.2",
        "--push-pull-every",
        "2",
        "--leavers",
        "2",
        "--seed",
        "11",
    ]);
    let mut sim = Simulation::new(config).unwrap();
    let report = sim.run().unwrap();

    assert!(report.converged);
    assert_eq!(report.running, 6);
    assert_eq!(report.alive, 6);
    assert_eq!(report.left, 2);
    assert!(report.network.lost > 0);
}
