mod common;

use std::time::Duration;

use common::Harness;
use live_sfu::signaling::Channel;
use testresult::TestResult;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn dead_worker_closes_its_rooms_and_the_next_join_recreates_them() -> TestResult {
    let harness = Harness::new().await;
    let mut broadcaster = harness.client(Channel::Streaming);
    let mut viewer = harness.client(Channel::Streaming);

    let send = broadcaster.transport("room-1", "host", "send").await;
    broadcaster.produce("room-1", "host", &send, "video").await;
    viewer.join("room-1").await;

    let handler = harness.handler();
    let router = handler.rooms().get_router("room-1").expect("room has a router");
    assert!(harness.engine.kill_worker(&router.worker_id()));

    let closed = viewer.wait_event("roomClosed").await;
    assert_eq!(closed["roomId"], "room-1");
    broadcaster.wait_event("roomClosed").await;

    assert!(handler.rooms().get_router("room-1").is_none());
    assert!(handler.registry().producer_list("room-1").is_empty());

    viewer.join("room-1").await;
    let replacement = handler.rooms().get_router("room-1").expect("room recreated");
    assert_ne!(replacement.id(), router.id());
    assert!(!replacement.closed());

    // The pool replaces the dead worker in the background.
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.engine.worker_ids().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn rooms_are_evicted_when_the_last_member_leaves() -> TestResult {
    let harness = Harness::new().await;
    let mut first = harness.client(Channel::Streaming);
    let mut second = harness.client(Channel::Streaming);
    first.join("room-1").await;
    second.join("room-1").await;
    let router = harness.handler().rooms().get_router("room-1").expect("router");

    first.disconnect().await;
    assert!(harness.handler().rooms().get_router("room-1").is_some());

    second.disconnect().await;
    assert!(harness.handler().rooms().get_router("room-1").is_none());
    assert!(router.closed());
    Ok(())
}
