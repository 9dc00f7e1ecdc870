use super::*;
use std::time::Duration;

/// Lets spawned tasks run until `done` holds, or gives up.
async fn settle<F: Fn() -> bool>(done: F) -> bool {
    for _ in 0..500 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

#[tokio::test(start_paused = true)]
async fn push_is_acknowledged_after_application() {
    let network = MemoryNetwork::new(0.0);
    let (alice, _) = networked_service(&network, "alice", direct_config());
    let (bob, bob_render) = networked_service(&network, "bob", direct_config());

    let bob_id = add_visible_peer(&alice, "bob");
    let alice_id = add_visible_peer(&bob, "alice");
    bob_render.add_handle(&alice_id);

    let id = alice
        .distributor()
        .publish(snapshot("v1"))
        .await
        .unwrap()
        .unwrap();

    assert!(settle(|| !alice.peers().is_pending(&bob_id)).await);
    let view = alice.peer_view(&bob_id).unwrap();
    assert_eq!(view.last_acknowledgment_success, Some(true));
    assert_eq!(view.last_acknowledgment_id, Some(id));

    assert_eq!(bob_render.applied().len(), 1);
    assert_eq!(
        bob.peers().last_applied_hash(&alice_id),
        Some(snapshot("v1").data_hash())
    );
    assert_eq!(alice.session().outstanding_requests(), 0);
    assert_eq!(alice.metrics().total_successful, 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_refreshes_liveness_without_payload() {
    let network = MemoryNetwork::new(0.0);
    let (alice, _) = networked_service(&network, "alice", direct_config());
    let (bob, bob_render) = networked_service(&network, "bob", direct_config());
    let bob_id = add_visible_peer(&alice, "bob");
    let alice_id = add_visible_peer(&bob, "alice");
    bob_render.add_handle(&alice_id);

    alice.distributor().publish(snapshot("v1")).await.unwrap();
    assert!(settle(|| !alice.peers().is_pending(&bob_id)).await);
    assert_eq!(network.delivered(), 2, "push and its acknowledgment");

    assert_eq!(alice.distributor().send_heartbeats().await, 1);
    assert!(settle(|| network.delivered() == 3).await);
    assert!(bob.peers().get(&alice_id).unwrap().last_seen.is_some());
    assert_eq!(bob_render.applied().len(), 1, "heartbeat carries no data");
    assert_eq!(alice.metrics().total_sent, 1, "heartbeats are not acknowledged sends");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batched_push_is_held_until_flushed() {
    let network = MemoryNetwork::new(0.0);
    let (alice, _) = networked_service(&network, "alice", SyncConfig::default());
    let (bob, bob_render) = networked_service(&network, "bob", SyncConfig::default());
    let bob_id = add_visible_peer(&alice, "bob");
    let alice_id = add_visible_peer(&bob, "alice");
    bob_render.add_handle(&alice_id);

    alice.distributor().publish(snapshot("v1")).await.unwrap();
    assert_eq!(
        alice
            .coordinator()
            .queued_in_batch(crate::types::AckPriority::Medium),
        1
    );
    assert_eq!(network.delivered(), 0);

    // Batch age is measured on the service clock, which only moves by hand.
    alice.coordinator().flush_all().await;
    assert!(settle(|| !alice.peers().is_pending(&bob_id)).await);
    assert_eq!(bob_render.applied().len(), 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_push_leaves_peer_pending() {
    let network = MemoryNetwork::new(1.0);
    let (alice, _) = networked_service(&network, "alice", direct_config());
    let bob_id = add_visible_peer(&alice, "bob");

    alice.distributor().publish(snapshot("v1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice.peers().is_pending(&bob_id));
    assert_eq!(network.dropped(), 1);

    alice.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_tasks_stop_on_shutdown() {
    let node = Node::new(direct_config());
    node.service.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    node.service.shutdown().await;
    assert!(node.service.shutdown_token().is_cancelled());
}
