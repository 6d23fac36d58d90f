//! VIP manager tests against the in-memory election backend.
//!
//! These tests verify that the virtual IP follows leadership, is released
//! as soon as leadership is lost and is never held by two nodes at once.

mod test_harness;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tew_node::election::memory::MemoryElectionBackend;
use tew_node::election::{election_name, ElectionFactory, MemoryElectionFactory};
use tew_node::vip::{NetworkInterface, VipManager, VipRole, VipSettings};
use test_harness::{assert_eventually, HostInterface, Network};

const VIP: &str = "192.168.100.50";

fn settings(node_id: &str, peers: &[&str]) -> VipSettings {
    let peers: HashMap<String, String> = peers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), format!("10.0.0.{}:16277", i + 1)))
        .collect();
    VipSettings {
        role: "controller".to_string(),
        node_id: node_id.to_string(),
        endpoint: peers.get(node_id).cloned().unwrap_or_default(),
        virtual_ip: VIP.to_string(),
        interface: "eth0".to_string(),
        peers,
    }
}

fn manager(backend: &Arc<MemoryElectionBackend>, interface: Arc<HostInterface>, node_id: &str, peers: &[&str]) -> VipManager {
    VipManager::with_client(
        settings(node_id, peers),
        Arc::new(backend.client(node_id)),
        interface,
    )
    .expect("manager should be configured")
    .with_retry_interval(Duration::from_millis(20))
}

/// Test 1: A single candidate binds the VIP and releases it on stop
#[tokio::test]
async fn test_single_node_binds_and_releases() {
    let backend = MemoryElectionBackend::new(election_name("controller"));
    let network = Network::new();
    let a = manager(&backend, network.host("a"), "a", &["a"]);

    assert_eq!(a.name(), "controller-vip-manager");
    assert_eq!(a.role(), VipRole::Follower);

    a.start();
    assert_eventually(
        || async { a.role() == VipRole::Leader },
        Duration::from_secs(2),
        "single candidate should lead",
    )
    .await;
    assert!(a.is_bound());
    assert_eq!(network.holders(), vec!["a".to_string()]);

    a.stop().await;
    assert!(!a.is_bound());
    assert_eq!(a.role(), VipRole::Follower);
    assert!(network.holders().is_empty());
    assert_eq!(backend.leader(), None);

    // Stopping again is a no-op.
    a.stop().await;
    assert!(network.holders().is_empty());
}

/// Test 2: Session expiry moves the VIP without overlap
#[tokio::test]
async fn test_failover_never_binds_twice() {
    let backend = MemoryElectionBackend::new(election_name("controller"));
    let network = Network::new();
    let peers = ["a", "b"];
    let a = manager(&backend, network.host("a"), "a", &peers);
    let b = manager(&backend, network.host("b"), "b", &peers);

    a.start();
    b.start();

    assert_eventually(
        || async { network.holders().len() == 1 },
        Duration::from_secs(2),
        "one node should hold the VIP",
    )
    .await;
    assert!(backend.leader().is_some());

    for _ in 0..3 {
        let current = backend.leader().expect("leader expected");
        backend.expire_session(&current);

        let network_ref = &network;
        let current_ref = &current;
        assert_eventually(
            || async move {
                let holders = network_ref.holders();
                holders.len() == 1 && holders[0] != *current_ref
            },
            Duration::from_secs(2),
            "VIP should move to the other node",
        )
        .await;
    }

    assert_ne!(backend.leader(), None);
    assert_eq!(network.max_holders(), 1, "VIP was bound on two nodes at once");

    a.stop().await;
    b.stop().await;
    assert!(network.holders().is_empty());
}

/// Test 3: Losing the backend connection drops the VIP until reconnection
#[tokio::test]
async fn test_disconnect_releases_and_rebinds() {
    let backend = MemoryElectionBackend::new(election_name("controller"));
    let network = Network::new();
    let a = manager(&backend, network.host("a"), "a", &["a"]);

    a.start();
    assert_eventually(
        || async { a.is_bound() },
        Duration::from_secs(2),
        "VIP should be bound",
    )
    .await;

    backend.disconnect("a");
    assert_eventually(
        || async { !a.is_bound() && network.holders().is_empty() },
        Duration::from_secs(2),
        "VIP should be released after disconnection",
    )
    .await;

    // Campaigns keep failing while disconnected.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!a.is_bound());
    assert_ne!(a.role(), VipRole::Leader);

    backend.reconnect("a");
    assert_eventually(
        || async { a.is_bound() && a.role() == VipRole::Leader },
        Duration::from_secs(2),
        "VIP should be bound again after reconnection",
    )
    .await;

    a.stop().await;
}

/// Test 4: A node that cannot bind gives leadership away
#[tokio::test]
async fn test_bind_failure_resigns() {
    let backend = MemoryElectionBackend::new(election_name("controller"));
    let network = Network::new();
    let peers = ["a", "b"];
    let broken = network.host("a");
    broken.fail_add(true);
    let a = manager(&backend, broken, "a", &peers);
    let b = manager(&backend, network.host("b"), "b", &peers);

    a.start();
    b.start();

    assert_eventually(
        || async { network.holders() == vec!["b".to_string()] },
        Duration::from_secs(2),
        "the healthy node should end up with the VIP",
    )
    .await;
    assert!(!a.is_bound());

    a.stop().await;
    b.stop().await;
}

/// Test 5: Missing VIP, interface or peers means no manager
#[tokio::test]
async fn test_unconfigured_manager_is_not_created() {
    let factory = MemoryElectionFactory::new();
    let network = Network::new();

    let mut no_vip = settings("a", &["a"]);
    no_vip.virtual_ip.clear();
    let mut no_interface = settings("a", &["a"]);
    no_interface.interface.clear();
    let no_peers = settings("a", &[]);

    for unconfigured in [no_vip, no_interface, no_peers] {
        let created = VipManager::new(unconfigured, &factory, network.host("a")).unwrap();
        assert!(created.is_none());
    }

    let configured = VipManager::new(settings("a", &["a"]), &factory, network.host("a")).unwrap();
    assert!(configured.is_some());
}

/// Test 6: Role transitions are observable
#[tokio::test]
async fn test_role_changes_are_published() {
    let factory = MemoryElectionFactory::new();
    let network = Network::new();
    let settings = settings("a", &["a"]);
    let client = factory
        .create(&settings.election(), "a", &settings.endpoint, &settings.peers)
        .unwrap();
    let a = VipManager::with_client(settings, client, network.host("a")).unwrap();

    let mut roles = a.subscribe_role();
    a.start();
    tokio::time::timeout(Duration::from_secs(2), roles.wait_for(|role| *role == VipRole::Leader))
        .await
        .expect("leader role should be published")
        .unwrap();

    a.stop().await;
    assert_eq!(*roles.borrow(), VipRole::Follower);
    assert_eq!(factory.backend(&election_name("controller")).leader(), None);
}

/// Test 7: A leftover alias is taken over and released with leadership
#[tokio::test]
async fn test_existing_alias_is_taken_over() {
    let backend = MemoryElectionBackend::new(election_name("controller"));
    let network = Network::new();
    let host = network.host("a");
    assert!(host.add_address(VIP, "eth0").await.unwrap());
    assert!(!host.add_address(VIP, "eth0").await.unwrap());

    let a = manager(&backend, host.clone(), "a", &["a"]);
    a.start();
    assert_eventually(
        || async { a.role() == VipRole::Leader },
        Duration::from_secs(2),
        "single candidate should lead",
    )
    .await;
    assert!(a.is_bound());
    assert_eq!(network.holders(), vec!["a".to_string()]);

    a.stop().await;
    assert!(!host.has_address(VIP, "eth0").await.unwrap());
    assert!(network.holders().is_empty());
}
