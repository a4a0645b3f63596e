//! End-to-end membership scenarios over the in-process lab network.
//!
//! These tests drive full coordinators - failure detection, intent
//! propagation, reaping, and reconnection - through `testing::LabNetwork`
//! instead of sockets, so multi-node scenarios stay fast and deterministic.

use std::net::SocketAddr;
use std::time::Duration;

use gossip_roster::testing::{LabGossip, LabNetwork};
use gossip_roster::{
    Error, GossipConfig, LeaveMessage, Member, MemberEvent, MemberEventKind, MemberStatus, Roster,
    RosterConfig, RosterState,
};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Aggressive timings so failure detection, reaping, and reconnection all
/// happen within a test run. The reconnect/tombstone timeouts are near
/// zero so entries age out on the first reaper pass, and the reaper period
/// is long enough that assertions on transient states land before it.
fn test_config(name: &str, port: u16) -> RosterConfig {
    RosterConfig::new(name)
        .with_reap_interval(Duration::from_millis(600))
        .with_reconnect_interval(Duration::from_millis(50))
        .with_reconnect_timeout(Duration::from_micros(1))
        .with_tombstone_timeout(Duration::from_micros(1))
        .with_leave_timeout(Duration::from_millis(200))
        .with_gossip(
            GossipConfig::new()
                .with_bind_addr(addr(port))
                .with_probe_interval(Duration::from_millis(25))
                .with_probe_timeout(Duration::from_millis(10))
                .with_suspicion_mult(1),
        )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Time for the probers to declare a silent peer dead.
async fn wait_for_failure_detection() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn status_of(members: &[Member], name: &str) -> MemberStatus {
    members
        .iter()
        .find(|m| m.name == name)
        .map(|m| m.status)
        .unwrap_or(MemberStatus::None)
}

/// Drain pending events and keep the kinds concerning `name`.
fn events_for(rx: &async_channel::Receiver<MemberEvent>, name: &str) -> Vec<MemberEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.member.name == name {
            kinds.push(event.kind);
        }
    }
    kinds
}

#[tokio::test]
async fn test_create_without_name_fails() {
    let network = LabNetwork::new();
    let config = RosterConfig::default();
    let result = Roster::create(config, LabGossip::new(&network)).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_two_node_join() {
    let network = LabNetwork::new();
    let (event_tx, event_rx) = async_channel::bounded(16);

    let a = Roster::create(
        test_config("a", 8001).with_event_sink(event_tx),
        LabGossip::new(&network),
    )
    .await
    .unwrap();
    let b = Roster::create(test_config("b", 8002), LabGossip::new(&network))
        .await
        .unwrap();

    assert_eq!(a.members().len(), 1);
    assert_eq!(b.members().len(), 1);

    let contacted = a.join(&[addr(8002)]).await.unwrap();
    assert_eq!(contacted, 1);
    settle().await;

    for roster in [&a, &b] {
        let members = roster.members();
        assert_eq!(members.len(), 2);
        assert_eq!(status_of(&members, "a"), MemberStatus::Alive);
        assert_eq!(status_of(&members, "b"), MemberStatus::Alive);
    }
    assert_eq!(events_for(&event_rx, "b"), vec![MemberEventKind::Join]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_without_reachable_seed_fails() {
    let network = LabNetwork::new();
    let a = Roster::create(test_config("a", 8011), LabGossip::new(&network))
        .await
        .unwrap();

    let result = a.join(&[addr(8999)]).await;
    assert!(matches!(result, Err(Error::NoPeers)));

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_detected_failure() {
    let network = LabNetwork::new();
    let (event_tx, event_rx) = async_channel::bounded(16);

    let a = Roster::create(
        test_config("a", 8021).with_event_sink(event_tx),
        LabGossip::new(&network),
    )
    .await
    .unwrap();
    let b = Roster::create(test_config("b", 8022), LabGossip::new(&network))
        .await
        .unwrap();

    a.join(&[addr(8022)]).await.unwrap();
    settle().await;

    // Hard stop: no leave intent is broadcast.
    b.shutdown().await.unwrap();
    wait_for_failure_detection().await;

    assert_eq!(status_of(&a.members(), "b"), MemberStatus::Failed);
    assert_eq!(
        events_for(&event_rx, "b"),
        vec![MemberEventKind::Join, MemberEventKind::Failed]
    );

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_leave_is_reaped() {
    let network = LabNetwork::new();
    let (event_tx, event_rx) = async_channel::bounded(16);

    let a = Roster::create(
        test_config("a", 8031).with_event_sink(event_tx),
        LabGossip::new(&network),
    )
    .await
    .unwrap();
    let b = Roster::create(test_config("b", 8032), LabGossip::new(&network))
        .await
        .unwrap();

    a.join(&[addr(8032)]).await.unwrap();
    settle().await;

    b.leave().await.unwrap();
    settle().await;

    assert_eq!(
        events_for(&event_rx, "b"),
        vec![MemberEventKind::Join, MemberEventKind::Leave]
    );

    // Two reaper periods with a near-zero tombstone timeout: the left
    // member is gone from the table.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let members = a.members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name, "a");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_after_failure() {
    let network = LabNetwork::new();
    let (event_tx, event_rx) = async_channel::bounded(64);

    let a = Roster::create(
        test_config("a", 8041).with_event_sink(event_tx),
        LabGossip::new(&network),
    )
    .await
    .unwrap();
    let b = Roster::create(test_config("b", 8042), LabGossip::new(&network))
        .await
        .unwrap();

    a.join(&[addr(8042)]).await.unwrap();
    settle().await;

    // Force a failure, then bring back a node with b's name and address.
    b.shutdown().await.unwrap();
    wait_for_failure_detection().await;

    let b2 = Roster::create(test_config("b", 8042), LabGossip::new(&network))
        .await
        .unwrap();

    // The reconnector contacts b's last known address within a few
    // periods; the rejoin flows through the normal join path.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(status_of(&a.members(), "b"), MemberStatus::Alive);
    assert_eq!(
        events_for(&event_rx, "b"),
        vec![
            MemberEventKind::Join,
            MemberEventKind::Failed,
            MemberEventKind::Join,
        ]
    );

    a.shutdown().await.unwrap();
    b2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_failed_node() {
    let network = LabNetwork::new();

    let a = Roster::create(test_config("a", 8051), LabGossip::new(&network))
        .await
        .unwrap();
    let b = Roster::create(test_config("b", 8052), LabGossip::new(&network))
        .await
        .unwrap();
    let c = Roster::create(test_config("c", 8053), LabGossip::new(&network))
        .await
        .unwrap();

    a.join(&[addr(8052)]).await.unwrap();
    a.join(&[addr(8053)]).await.unwrap();
    settle().await;
    assert_eq!(c.members().len(), 3);

    b.shutdown().await.unwrap();
    wait_for_failure_detection().await;
    assert_eq!(status_of(&a.members(), "b"), MemberStatus::Failed);
    assert_eq!(status_of(&c.members(), "b"), MemberStatus::Failed);

    a.remove_failed_node("b").await.unwrap();
    settle().await;

    // Both survivors converge on the removal.
    assert_eq!(status_of(&a.members(), "b"), MemberStatus::Left);
    assert_eq!(status_of(&c.members(), "b"), MemberStatus::Left);

    a.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leave_timeout_reverts_intent() {
    let network = LabNetwork::new();
    let config = test_config("a", 8061).with_leave_timeout(Duration::from_millis(10));
    let a = Roster::create(config, LabGossip::new(&network)).await.unwrap();

    a.handle_leave_intent(LeaveMessage::new(1, "a"));
    assert_eq!(status_of(&a.members(), "a"), MemberStatus::Leaving);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(status_of(&a.members(), "a"), MemberStatus::Alive);

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_role_propagation() {
    let network = LabNetwork::new();

    let a = Roster::create(
        test_config("a", 8071).with_role("web"),
        LabGossip::new(&network),
    )
    .await
    .unwrap();
    let b = Roster::create(
        test_config("b", 8072).with_role("lb"),
        LabGossip::new(&network),
    )
    .await
    .unwrap();

    a.join(&[addr(8072)]).await.unwrap();
    settle().await;

    for roster in [&a, &b] {
        let members = roster.members();
        assert_eq!(members.len(), 2);
        let role_of = |name: &str| {
            members
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.role.clone())
                .unwrap()
        };
        assert_eq!(role_of("a"), "web");
        assert_eq!(role_of("b"), "lb");
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_transitions() {
    let network = LabNetwork::new();
    let a = Roster::create(test_config("a", 8081), LabGossip::new(&network))
        .await
        .unwrap();

    assert_eq!(a.state(), RosterState::Alive);

    a.leave().await.unwrap();
    assert_eq!(a.state(), RosterState::Left);
    assert_eq!(status_of(&a.members(), "a"), MemberStatus::Left);
    // Idempotent after the first success.
    a.leave().await.unwrap();

    a.shutdown().await.unwrap();
    assert_eq!(a.state(), RosterState::Shutdown);
}

#[tokio::test]
async fn test_duplicate_intent_emits_single_leave() {
    let network = LabNetwork::new();
    let (event_tx, event_rx) = async_channel::bounded(16);

    let a = Roster::create(
        test_config("a", 8091).with_event_sink(event_tx),
        LabGossip::new(&network),
    )
    .await
    .unwrap();
    let b = Roster::create(test_config("b", 8092), LabGossip::new(&network))
        .await
        .unwrap();
    a.join(&[addr(8092)]).await.unwrap();
    settle().await;
    events_for(&event_rx, "b");

    let intent = LeaveMessage::new(5, "b");
    a.handle_leave_intent(intent.clone());
    a.handle_leave_intent(intent);

    assert_eq!(status_of(&a.members(), "b"), MemberStatus::Leaving);
    assert_eq!(events_for(&event_rx, "b"), vec![MemberEventKind::Leave]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_intent_buffered_until_join() {
    let network = LabNetwork::new();
    let (event_tx, event_rx) = async_channel::bounded(16);

    let a = Roster::create(
        test_config("a", 8101).with_event_sink(event_tx),
        LabGossip::new(&network),
    )
    .await
    .unwrap();

    // Intent races ahead of the join: the target is unknown, so the
    // intent is retained.
    a.handle_leave_intent(LeaveMessage::new(5, "b"));
    assert_eq!(status_of(&a.members(), "b"), MemberStatus::None);

    let b = Roster::create(test_config("b", 8102), LabGossip::new(&network))
        .await
        .unwrap();
    a.join(&[addr(8102)]).await.unwrap();
    settle().await;

    // Join is observed first, then the buffered intent applies.
    assert_eq!(
        events_for(&event_rx, "b"),
        vec![MemberEventKind::Join, MemberEventKind::Leave]
    );
    assert_eq!(status_of(&a.members(), "b"), MemberStatus::Leaving);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delivery_order_converges() {
    // One observer sees the intent before the join, the other after;
    // both reach the same view of the target.
    let net1 = LabNetwork::new();
    let x = Roster::create(test_config("x", 8111), LabGossip::new(&net1))
        .await
        .unwrap();
    x.handle_leave_intent(LeaveMessage::new(5, "b"));
    let b1 = Roster::create(test_config("b", 8112), LabGossip::new(&net1))
        .await
        .unwrap();
    x.join(&[addr(8112)]).await.unwrap();

    let net2 = LabNetwork::new();
    let y = Roster::create(test_config("y", 8111), LabGossip::new(&net2))
        .await
        .unwrap();
    let b2 = Roster::create(test_config("b", 8112), LabGossip::new(&net2))
        .await
        .unwrap();
    y.join(&[addr(8112)]).await.unwrap();
    y.handle_leave_intent(LeaveMessage::new(5, "b"));

    settle().await;
    assert_eq!(status_of(&x.members(), "b"), MemberStatus::Leaving);
    assert_eq!(status_of(&y.members(), "b"), MemberStatus::Leaving);

    for roster in [&x, &y] {
        roster.shutdown().await.unwrap();
    }
    b1.shutdown().await.unwrap();
    b2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_member_eventually_removed() {
    let network = LabNetwork::new();

    let a = Roster::create(test_config("a", 8121), LabGossip::new(&network))
        .await
        .unwrap();
    let b = Roster::create(test_config("b", 8122), LabGossip::new(&network))
        .await
        .unwrap();
    a.join(&[addr(8122)]).await.unwrap();
    settle().await;

    b.shutdown().await.unwrap();
    wait_for_failure_detection().await;
    assert_eq!(status_of(&a.members(), "b"), MemberStatus::Failed);

    // First reaper pass demotes the failed member to a tombstone, the
    // second deletes it.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(status_of(&a.members(), "b"), MemberStatus::None);
    assert_eq!(a.members().len(), 1);

    a.shutdown().await.unwrap();
}
