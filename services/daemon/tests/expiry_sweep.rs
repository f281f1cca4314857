//! Integration tests for the expiry reconciler.
//!
//! Timer-driven tests run on a paused clock, so injected engine latency
//! decides the order in which teardowns complete.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{at, cluster, container_of, Harness};
use dync_daemon::actor::ActorContext;
use dync_daemon::engine::Engine;
use dync_daemon::reconciler::{
    control_channel, ExpiryReconciler, ReconcilerConfig, SweepError, SweepSummary,
};
use dync_registry::Registry;

fn reconciler(harness: &Harness, interval: Duration) -> ExpiryReconciler {
    ExpiryReconciler::new(
        harness.service.clone(),
        ActorContext::system(),
        ReconcilerConfig { interval },
    )
}

#[tokio::test]
async fn test_sweep_tears_down_only_expired() {
    let now = Utc::now();
    let harness = Harness::new(vec![
        cluster("a", "alice", at(now, -60)),
        cluster("b", "bob", at(now, -1)),
        cluster("c", "alice", at(now, 600)),
    ]);

    let summary = reconciler(&harness, Duration::from_secs(300))
        .sweep_at(now)
        .await
        .unwrap();

    assert_eq!(
        summary,
        SweepSummary {
            listed: 3,
            torn_down: 2
        }
    );
    assert_eq!(harness.remaining(), vec!["c"]);

    let mut removed = harness.engine.inner.removed();
    removed.sort();
    assert_eq!(removed, vec![container_of("a"), container_of("b")]);
    assert!(harness.engine.inner.is_live(&container_of("c")));
}

#[tokio::test]
async fn test_sweep_ignores_owner_of_expired_clusters() {
    let now = Utc::now();
    let harness = Harness::new(vec![
        cluster("a", "alice", at(now, -5)),
        cluster("b", "bob", at(now, -5)),
        cluster("c", "carol", at(now, -5)),
    ]);

    reconciler(&harness, Duration::from_secs(300))
        .sweep_at(now)
        .await
        .unwrap();

    assert!(harness.remaining().is_empty());
}

#[tokio::test]
async fn test_empty_and_alive_sweeps_remove_nothing() {
    let now = Utc::now();

    let empty = Harness::new(vec![]);
    let summary = reconciler(&empty, Duration::from_secs(300))
        .sweep_at(now)
        .await
        .unwrap();
    assert_eq!(summary.torn_down, 0);
    assert!(empty.engine.inner.remove_calls().is_empty());

    let alive = Harness::new(vec![
        cluster("a", "alice", at(now, 0)),
        cluster("b", "bob", at(now, 3600)),
    ]);
    let summary = reconciler(&alive, Duration::from_secs(300))
        .sweep_at(now)
        .await
        .unwrap();
    assert_eq!(summary.torn_down, 0);
    assert!(alive.engine.inner.remove_calls().is_empty());
    assert_eq!(alive.remaining(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_single_failure_waits_for_every_task() {
    let now = Utc::now();
    let harness = Harness::new(vec![
        cluster("a", "alice", at(now, -10)),
        cluster("b", "alice", at(now, -10)),
        cluster("c", "bob", at(now, -10)),
        cluster("d", "bob", at(now, -10)),
    ]);

    // The failure reports first; the others finish well after it.
    harness.fail_removal("b");
    for id in ["a", "c", "d"] {
        harness.set_remove_delay(id, Duration::from_millis(50));
    }

    let err = reconciler(&harness, Duration::from_secs(300))
        .sweep_at(now)
        .await
        .unwrap_err();

    match err {
        SweepError::Teardown { cluster_id, .. } => assert_eq!(cluster_id, "b"),
        other => panic!("unexpected error: {other}"),
    }

    // Every other teardown had completed by the time the sweep returned.
    assert_eq!(harness.remaining(), vec!["b"]);
    assert_eq!(harness.engine.inner.removed().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_first_failure_to_arrive_wins() {
    let now = Utc::now();
    let harness = Harness::new(vec![
        cluster("a", "alice", at(now, -10)),
        cluster("b", "bob", at(now, -10)),
        cluster("c", "carol", at(now, -10)),
    ]);

    harness.fail_removal("a");
    harness.set_remove_delay("a", Duration::from_millis(30));
    harness.fail_removal("b");
    harness.set_remove_delay("b", Duration::from_millis(10));

    let err = reconciler(&harness, Duration::from_secs(300))
        .sweep_at(now)
        .await
        .unwrap_err();

    match err {
        SweepError::Teardown { cluster_id, .. } => assert_eq!(cluster_id, "b"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.remaining(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_vanished_container_does_not_block_teardown() {
    let now = Utc::now();
    let harness = Harness::new(vec![cluster("a", "alice", at(now, -10))]);
    let reconciler = reconciler(&harness, Duration::from_secs(300));

    // The container vanished out of band; the record is still removed.
    harness.engine.inner.remove_container(&container_of("a")).await.unwrap();

    let summary = reconciler.sweep_at(now).await.unwrap();
    assert_eq!(summary.torn_down, 1);
    assert!(harness.remaining().is_empty());

    let summary = reconciler.sweep_at(now).await.unwrap();
    assert_eq!(summary.torn_down, 0);
}

#[tokio::test]
async fn test_list_failure_tears_down_nothing() {
    let now = Utc::now();
    let harness = Harness::new(vec![cluster("a", "alice", at(now, -10))]);
    harness.registry.inner.close().unwrap();

    let err = reconciler(&harness, Duration::from_secs(300))
        .sweep_at(now)
        .await
        .unwrap_err();

    assert!(matches!(err, SweepError::List(_)));
    assert!(harness.engine.inner.remove_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_sweep_delays_next_sweep() {
    let harness = Harness::new(vec![cluster("a", "alice", at(Utc::now(), -10))]);
    harness.set_remove_delay("a", Duration::from_secs(7 * 60));

    let (handle, control) = control_channel();
    let task = tokio::spawn(reconciler(&harness, Duration::from_secs(5 * 60)).run(control));

    // Sweep 1 starts at 5m and finishes at 12m; sweep 2 starts at 17m.
    // A fixed-rate ticker would have listed again at 10m and 15m.
    tokio::time::sleep(Duration::from_secs(17 * 60 + 1)).await;

    assert_eq!(
        harness.log.events(),
        vec!["list", "remove:ctr-a", "list"]
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_sweep() {
    let harness = Harness::new(vec![cluster("a", "alice", at(Utc::now(), -10))]);
    harness.set_remove_delay("a", Duration::from_secs(10 * 60));

    let start = tokio::time::Instant::now();
    let (handle, control) = control_channel();
    let task = tokio::spawn(reconciler(&harness, Duration::from_secs(60)).run(control));

    // Sweep is mid-teardown at 2m.
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    handle.shutdown().await.unwrap();
    harness.log.push("reconciler-ack");

    assert!(start.elapsed() >= Duration::from_secs(11 * 60));
    assert_eq!(
        harness.log.events(),
        vec!["list", "remove:ctr-a", "reconciler-ack"]
    );
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_first_sweep() {
    let harness = Harness::new(vec![cluster("a", "alice", at(Utc::now(), -10))]);

    let (handle, control) = control_channel();
    let task = tokio::spawn(reconciler(&harness, Duration::from_secs(300)).run(control));

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(harness.log.events().is_empty());
    assert_eq!(harness.remaining(), vec!["a"]);
}
