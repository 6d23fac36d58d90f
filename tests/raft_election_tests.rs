//! Election tests for the Raft backend over real localhost gRPC.
//!
//! These tests verify self-election of a lone node, a single leader in a
//! three-node group, leadership hand-over on resignation and failover
//! after the leader goes away.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tew_node::config::ElectionTiming;
use tew_node::election::{election_name, ElectionClient, ElectionFactory, Peers};
use tew_node::raft::{RaftElection, RaftElectionFactory};
use test_harness::{leaders, raft_group, test_election_config, wait_for};

fn spawn_campaigns(group: &[Arc<RaftElection>]) {
    for election in group {
        let election = election.clone();
        tokio::spawn(async move {
            let _ = election.campaign().await;
        });
    }
}

async fn shutdown(group: &[Arc<RaftElection>]) {
    for election in group {
        election.shutdown().await;
    }
}

/// Test 1: A node without peers elects itself
#[tokio::test]
async fn test_single_node_self_election() {
    let election = RaftElection::new(test_election_config("n1", 51200, &[])).unwrap();

    tokio::time::timeout(Duration::from_secs(5), election.campaign())
        .await
        .expect("campaign should finish")
        .unwrap();

    assert!(election.node().is_leader().await);
    assert_eq!(election.observe().borrow().as_deref(), Some("n1"));

    election.resign().await.unwrap();
    assert!(!election.node().is_leader().await);
    assert_eq!(*election.observe().borrow(), None);

    election.shutdown().await;
}

/// Test 2: Exactly one leader among three campaigning nodes
#[tokio::test]
async fn test_three_nodes_elect_single_leader() {
    let group = raft_group(3, 51210);
    spawn_campaigns(&group);

    let elected = wait_for(
        || async { leaders(&group).await.len() == 1 },
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
    .await;
    assert!(elected, "a leader should be elected");

    let leader = leaders(&group).await[0].clone();

    // Followers learn the leader through heartbeats.
    let observed = wait_for(
        || async {
            group
                .iter()
                .all(|e| e.observe().borrow().as_deref() == Some(leader.as_str()))
        },
        Duration::from_secs(2),
        Duration::from_millis(50),
    )
    .await;
    assert!(observed, "all nodes should observe leader {}", leader);

    // Leadership is stable while everyone is healthy.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(leaders(&group).await.len() <= 1, "two leaders at once");
    }

    shutdown(&group).await;
}

/// Test 3: Resigning hands leadership to another candidate
#[tokio::test]
async fn test_resign_hands_over_leadership() {
    let group = raft_group(3, 51220);
    spawn_campaigns(&group);

    assert!(
        wait_for(
            || async { leaders(&group).await.len() == 1 },
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await
    );
    let first = leaders(&group).await[0].clone();
    let resigning = group
        .iter()
        .find(|e| e.node().id == first)
        .unwrap()
        .clone();

    resigning.resign().await.unwrap();

    let handed_over = wait_for(
        || async {
            let current = leaders(&group).await;
            current.len() == 1 && current[0] != first
        },
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
    .await;
    assert!(handed_over, "another node should take over from {}", first);

    shutdown(&group).await;
}

/// Test 4: The remaining majority elects a new leader after leader shutdown
#[tokio::test]
async fn test_new_leader_after_leader_shutdown() {
    let group = raft_group(3, 51230);
    spawn_campaigns(&group);

    assert!(
        wait_for(
            || async { leaders(&group).await.len() == 1 },
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await
    );
    let first = leaders(&group).await[0].clone();
    let (stopped, remaining): (Vec<_>, Vec<_>) = group.iter().cloned().partition(|e| e.node().id == first);

    shutdown(&stopped).await;

    let recovered = wait_for(
        || async { leaders(&remaining).await.len() == 1 },
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
    .await;
    assert!(recovered, "remaining nodes should elect a new leader");

    let second = leaders(&remaining).await[0].clone();
    assert_ne!(second, first);

    shutdown(&remaining).await;
}

/// Test 5: An occupied port surfaces as a campaign error
#[tokio::test]
async fn test_port_conflict_fails_campaign() {
    let _occupied = tokio::net::TcpListener::bind("127.0.0.1:51240").await.unwrap();
    let election = RaftElection::new(test_election_config("n1", 51240, &[])).unwrap();

    assert!(election.campaign().await.is_err());
    election.shutdown().await;
}

/// Test 6: The factory excludes the local node from its peers
#[tokio::test]
async fn test_factory_builds_peer_list() {
    let factory = RaftElectionFactory::new(ElectionTiming::default());
    let peers: Peers = [
        ("n1".to_string(), "127.0.0.1:51250".to_string()),
        ("n2".to_string(), "127.0.0.1:51251".to_string()),
        ("n3".to_string(), "127.0.0.1:51252".to_string()),
    ]
    .into_iter()
    .collect();

    let client = factory
        .create(&election_name("controller"), "n2", "127.0.0.1:51251", &peers)
        .unwrap();

    assert_eq!(client.candidate_id(), "n2");
    assert_eq!(*client.observe().borrow(), None);
    client.shutdown().await;
}
