mod common;

use common::*;
use rowsync::batch::{BatchStatus, IncomingStatus};
use rowsync::model::{Channel, EventType};
use rowsync::router::{ColumnTarget, DataRouter, TriggerRouter};
use rowsync::Error;
use serde_json::json;
use tokio::sync::watch;

fn sales(max: usize) -> Channel {
    Channel::new("sales", 1, max)
}

async fn capture_two_transactions(node: &TestNode) {
    for (id, tx) in [(1, "a"), (2, "a"), (3, "a"), (4, "b"), (5, "b")] {
        node.capture(
            "sales",
            EventType::Insert,
            json!({"id": id, "qty": 1}),
            Some(tx),
        )
        .await;
    }
}

#[tokio::test]
async fn test_push_delivers_transactions_in_order() {
    let (corp, store) = corp_and_store(vec![sales(3)]);
    capture_two_transactions(&corp).await;

    let routed = corp.node.router.route().await.unwrap();
    assert_eq!(routed.batches_created, 2);
    let sizes: Vec<u64> = corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .map(|b| b.data_event_count)
        .collect();
    assert_eq!(sizes, vec![3, 2]);

    let pushed = push(&corp, &store).await.unwrap();

    assert_eq!(pushed.sent, 2);
    assert_eq!(pushed.ok, 2);
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::Ok));
    assert_eq!(store.target.row_count("sale").await, 5);
    let incoming = store.store.incoming_batches().await;
    assert_eq!(incoming.len(), 2);
    assert!(incoming
        .iter()
        .all(|b| b.status == IncomingStatus::Ok && b.node_id == CORP));
    // Loader writes must not be captured again on the target.
    assert!(store.target.captured().await.is_empty());
}

#[tokio::test]
async fn test_failed_batch_blocks_only_its_channel() {
    let channels = vec![sales(2), Channel::new("inventory", 2, 2)];
    let (corp, store) = corp_and_store(channels);
    corp.capture("sales", EventType::Insert, json!({"id": 1, "qty": 1}), Some("a"))
        .await;
    let bad = corp
        .capture("sales", EventType::Insert, json!({"id": 2, "qty": -1}), Some("a"))
        .await;
    corp.capture("sales", EventType::Insert, json!({"id": 3, "qty": 1}), Some("b"))
        .await;
    corp.capture("sales", EventType::Insert, json!({"id": 4, "qty": 1}), Some("b"))
        .await;
    corp.capture("inventory", EventType::Insert, json!({"id": 10, "qty": 1}), None)
        .await;
    corp.node.router.route().await.unwrap();
    store.target.reject_value("qty", json!(-1));

    let first = push(&corp, &store).await.unwrap();

    assert_eq!(first.sent, 2);
    assert_eq!(first.failed, 1);
    assert_eq!(first.ok, 1);
    assert_eq!(first.held_back, 1);
    let batches = corp.store.outgoing_batches().await;
    assert_eq!(batches[0].status, BatchStatus::Error);
    assert_eq!(batches[0].failure.failed_data_id, Some(bad.data_id));
    assert_eq!(batches[0].failure.failed_line_number, Some(2));
    assert_eq!(batches[0].failure.sql_state.as_deref(), Some("23514"));
    assert_eq!(batches[1].status, BatchStatus::New);
    assert_eq!(batches[2].status, BatchStatus::Ok);
    assert_eq!(store.target.row_count("sale").await, 1);

    store.target.clear_rejections();
    let second = push(&corp, &store).await.unwrap();

    assert_eq!(second.sent, 2);
    assert_eq!(second.ok, 2);
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::Ok));
    assert_eq!(store.target.row_count("sale").await, 5);
}

#[tokio::test]
async fn test_lost_acknowledgments_lead_to_skipped_redelivery() {
    let (corp, store) = corp_and_store(vec![sales(3)]);
    capture_two_transactions(&corp).await;
    corp.node.router.route().await.unwrap();

    let (first, _lost) = pull_only(&store, &corp).await.unwrap();
    assert_eq!(first.loaded, 2);
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::Sent));

    let second = pull(&store, &corp).await.unwrap();

    assert_eq!(second.received, 2);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.acks_sent, 2);
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::Ok));
    assert_eq!(store.target.row_count("sale").await, 5);
    for batch in store.store.incoming_batches().await {
        assert_eq!(batch.status, IncomingStatus::Skipped);
        assert_eq!(batch.skip_count, 1);
    }
}

#[tokio::test]
async fn test_transport_failure_leaves_batches_pending() {
    let (corp, store) = corp_and_store(vec![sales(3)]);
    capture_two_transactions(&corp).await;
    corp.node.router.route().await.unwrap();

    let batches = corp
        .node
        .scheduler
        .batches_to_send(STORE, chrono::Utc::now())
        .await
        .unwrap();
    let (client, server) = tokio::io::duplex(1024);
    drop(server);
    let err = corp
        .node
        .push
        .push_over(client, STORE, batches)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::New));

    let pushed = push(&corp, &store).await.unwrap();
    assert_eq!(pushed.ok, 2);
    assert_eq!(store.target.row_count("sale").await, 5);
}

#[tokio::test]
async fn test_strict_ordering_defers_later_batches_on_pull() {
    let (corp, store) = corp_and_store(vec![sales(1)]);
    corp.capture("sales", EventType::Insert, json!({"id": 1, "qty": -1}), None)
        .await;
    corp.capture("sales", EventType::Insert, json!({"id": 2, "qty": 1}), None)
        .await;
    corp.node.router.route().await.unwrap();
    store.target.reject_value("qty", json!(-1));

    let first = pull(&store, &corp).await.unwrap();

    assert_eq!(first.failed, 1);
    assert_eq!(first.deferred, 1);
    assert_eq!(first.acks_sent, 1);
    let batches = corp.store.outgoing_batches().await;
    assert_eq!(batches[0].status, BatchStatus::Error);
    assert_eq!(batches[1].status, BatchStatus::Sent);
    assert_eq!(store.target.row_count("sale").await, 0);

    store.target.clear_rejections();
    let second = pull(&store, &corp).await.unwrap();

    assert_eq!(second.loaded, 2);
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::Ok));
    let incoming = store.store.incoming_batches().await;
    assert!(incoming[0].retry);
    assert_eq!(store.target.row_count("sale").await, 2);
}

#[tokio::test]
async fn test_unregistered_node_is_rejected() {
    let corp = TestNode::new(config(CORP, vec![peer(STORE, true, false)], vec![sales(3)]));
    let stranger = TestNode::new(config(STORE, vec![], vec![sales(3)]));
    corp.capture("sales", EventType::Insert, json!({"id": 1}), None)
        .await;
    corp.node.router.route().await.unwrap();

    let err = push(&corp, &stranger).await.unwrap_err();

    assert!(matches!(err, Error::Registration { .. }));
    assert!(!err.is_retryable());
    assert_eq!(stranger.target.row_count("sale").await, 0);
    assert!(stranger.store.incoming_batches().await.is_empty());
}

#[tokio::test]
async fn test_unrouted_records_are_kept_as_audit_batches() {
    let triggers = vec![TriggerRouter {
        table: "sale".into(),
        router: DataRouter::ColumnMatch {
            column: "store_id".into(),
            expected: ColumnTarget::NodeId,
        },
    }];
    let corp = TestNode::new(with_triggers(
        config(CORP, vec![peer(STORE, true, false)], vec![sales(10)]),
        triggers,
    ));
    let store = TestNode::new(config(STORE, vec![peer(CORP, false, true)], vec![sales(10)]));
    corp.capture("sales", EventType::Insert, json!({"id": 1, "store_id": STORE}), None)
        .await;
    corp.capture("sales", EventType::Insert, json!({"id": 2, "store_id": "store404"}), None)
        .await;

    let routed = corp.node.router.route().await.unwrap();

    assert_eq!(routed.routed, 1);
    assert_eq!(routed.unrouted, 1);
    let batches = corp.store.outgoing_batches().await;
    let audit = batches.iter().find(|b| b.node_id == "-1").unwrap();
    assert_eq!(audit.status, BatchStatus::Ok);

    let pushed = push(&corp, &store).await.unwrap();
    assert_eq!(pushed.sent, 1);
    assert_eq!(store.target.row_count("sale").await, 1);
}

#[tokio::test]
async fn test_ignored_batch_rows_are_never_sent() {
    let (corp, store) = corp_and_store(vec![sales(3)]);
    capture_two_transactions(&corp).await;
    corp.node.router.route().await.unwrap();
    let first = corp.store.outgoing_batches().await[0].batch_id;

    let ignored = corp.node.ignore(first).await.unwrap().unwrap();
    assert_eq!(ignored.status, BatchStatus::Ignored);
    assert!(corp.node.ignore(9_999).await.unwrap().is_none());

    let pushed = push(&corp, &store).await.unwrap();
    assert_eq!(pushed.sent, 2);
    assert_eq!(pushed.ignored, 1);
    assert_eq!(pushed.ok, 1);
    assert_eq!(store.target.row_count("sale").await, 2);
    assert!(corp.node.ignore(first).await.unwrap().is_some());

    let again = push(&corp, &store).await.unwrap();
    assert_eq!(again.sent, 0);
}

#[tokio::test]
async fn test_ignoring_failed_batch_releases_its_channel() {
    let (corp, store) = corp_and_store(vec![sales(1)]);
    corp.capture("sales", EventType::Insert, json!({"id": 1, "qty": -1}), None)
        .await;
    corp.capture("sales", EventType::Insert, json!({"id": 2, "qty": 1}), None)
        .await;
    corp.node.router.route().await.unwrap();
    store.target.reject_value("qty", json!(-1));

    let first = push(&corp, &store).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.held_back, 1);
    let failed = corp.store.outgoing_batches().await[0].batch_id;

    corp.node.ignore(failed).await.unwrap().unwrap();
    let second = push(&corp, &store).await.unwrap();

    assert_eq!(second.ignored, 1);
    assert_eq!(second.ok, 1);
    assert_eq!(second.deferred, 0);
    let batches = corp.store.outgoing_batches().await;
    assert_eq!(batches[0].status, BatchStatus::Ignored);
    assert_eq!(batches[0].ignore_count, 1);
    assert_eq!(batches[1].status, BatchStatus::Ok);
    let incoming = store.store.incoming_batches().await;
    assert_eq!(incoming[0].batch_id, failed);
    assert_eq!(incoming[0].status, IncomingStatus::Ok);
    assert_eq!(store.target.row_count("sale").await, 1);
    assert!(store.target.row("sale", &json!({"id": 2})).await.is_some());

    let third = push(&corp, &store).await.unwrap();
    assert_eq!(third.sent, 0);
}

#[tokio::test]
async fn test_pull_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let corp = TestNode::new(config(CORP, vec![peer(STORE, false, false)], vec![sales(3)]));
    let mut source = peer(CORP, false, true);
    source.address = Some(address);
    let store = TestNode::new(config(STORE, vec![source], vec![sales(3)]));
    capture_two_transactions(&corp).await;
    corp.node.router.route().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(corp.node.server.clone().serve(listener, shutdown_rx));

    let results = store.node.pull.pull_all().await;

    assert_eq!(results.len(), 1);
    let summary = results[0].1.as_ref().unwrap();
    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.acks_sent, 2);
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::Ok));

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_errors_lists_both_sides() {
    let (corp, store) = corp_and_store(vec![sales(1)]);
    corp.capture("sales", EventType::Insert, json!({"id": 1, "qty": -1}), None)
        .await;
    corp.node.router.route().await.unwrap();
    store.target.reject_value("qty", json!(-1));
    push(&corp, &store).await.unwrap();

    let (outgoing, _) = corp.node.errors(10).await.unwrap();
    let (_, incoming) = store.node.errors(10).await.unwrap();

    assert_eq!(outgoing.len(), 1);
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].failure.failed_line_number, Some(1));
    let batch = corp.node.batch(outgoing[0].batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Error);
}
