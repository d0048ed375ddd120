//! Presence scenarios over the in-process hub: joins, leaves, liveness
//! timeouts and late subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use basket_sync::{
    BackoffConfig, LocalHub, PresenceChannel, PresenceConfig, PresenceDelta, PresenceFrame,
};

fn fast_config() -> PresenceConfig {
    PresenceConfig {
        heartbeat_interval: Duration::from_millis(50),
        liveness_multiplier: 3,
        backoff: BackoffConfig {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
            max_retries: 1000,
        },
    }
}

#[tokio::test]
async fn test_join_and_leave_visible_to_peers() {
    let hub = Arc::new(LocalHub::new());
    let alice = PresenceChannel::new(hub.clone(), fast_config());
    let bob = PresenceChannel::new(hub.clone(), fast_config());

    let (mut alice_view, alice_handle) = alice.track("L1", "alice").await;
    let (mut bob_view, bob_handle) = bob.track("L1", "bob").await;

    // Each side sees the other come online
    timeout(
        Duration::from_secs(2),
        alice_view.wait_for(|m| m.get("bob") == Some(&true)),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(
        Duration::from_secs(2),
        bob_view.wait_for(|m| m.get("alice") == Some(&true)),
    )
    .await
    .unwrap()
    .unwrap();

    // Bob untracks; his connection drop announces a leave and Alice's map
    // no longer contains him
    bob.untrack(bob_handle).await;
    timeout(
        Duration::from_secs(2),
        alice_view.wait_for(|m| !m.contains_key("bob")),
    )
    .await
    .unwrap()
    .unwrap();

    alice.untrack(alice_handle).await;
}

#[tokio::test]
async fn test_silent_peer_flips_offline() {
    let hub = Arc::new(LocalHub::new());
    let channel = PresenceChannel::new(hub.clone(), fast_config());
    let (mut view, handle) = channel.track("L1", "me").await;

    // One join delta from a peer that never heartbeats again
    tokio::time::sleep(Duration::from_millis(20)).await;
    hub.emit_presence(
        "L1",
        PresenceFrame::Delta(PresenceDelta::join("ghost")).encode(),
    )
    .await;

    timeout(
        Duration::from_secs(2),
        view.wait_for(|m| m.get("ghost") == Some(&true)),
    )
    .await
    .unwrap()
    .unwrap();

    // Past the liveness timeout the entry flips offline but stays listed
    timeout(
        Duration::from_secs(2),
        view.wait_for(|m| m.get("ghost") == Some(&false)),
    )
    .await
    .unwrap()
    .unwrap();

    channel.untrack(handle).await;
}

#[tokio::test]
async fn test_late_subscriber_gets_baseline() {
    let hub = Arc::new(LocalHub::new());
    let alice = PresenceChannel::new(hub.clone(), fast_config());
    let (_alice_view, alice_handle) = alice.track("L1", "alice").await;

    // Give Alice's first heartbeat time to register on the hub
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bob = PresenceChannel::new(hub.clone(), fast_config());
    let (mut bob_view, bob_handle) = bob.track("L1", "bob").await;

    // Bob learns about Alice from the baseline, not from waiting for her
    // next delta
    timeout(
        Duration::from_secs(2),
        bob_view.wait_for(|m| m.get("alice") == Some(&true)),
    )
    .await
    .unwrap()
    .unwrap();

    alice.untrack(alice_handle).await;
    bob.untrack(bob_handle).await;
}

#[tokio::test]
async fn test_presence_per_list_isolation() {
    let hub = Arc::new(LocalHub::new());
    let alice = PresenceChannel::new(hub.clone(), fast_config());
    let bob = PresenceChannel::new(hub.clone(), fast_config());

    let (mut alice_view, alice_handle) = alice.track("L1", "alice").await;
    let (_bob_view, bob_handle) = bob.track("L2", "bob").await;

    // Bob is on a different list; he never shows up for Alice
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!alice_view.borrow_and_update().contains_key("bob"));

    alice.untrack(alice_handle).await;
    bob.untrack(bob_handle).await;
}
