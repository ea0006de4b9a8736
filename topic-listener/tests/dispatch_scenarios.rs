use std::sync::Arc;
use std::time::Duration;

use topic_listener::claim::ClaimConfig;
use topic_listener::dispatcher::{json, Dispatcher};
use topic_listener::offset_tracker::OffsetTracker;
use topic_listener::test_utils::{purchase_message, RecordingHandler, RecordingSink, TestPurchase};
use topic_listener::{Coordinator, Message, OutcomeKind, Partition};

fn coordinator(handler: Arc<RecordingHandler<TestPurchase>>) -> (Coordinator, Arc<RecordingSink>) {
    let dispatcher = Dispatcher::builder()
        .register("purchases", json::<TestPurchase>, handler)
        .build()
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let coordinator = Coordinator::new(
        Arc::new(dispatcher),
        Arc::new(OffsetTracker::new()),
        sink.clone(),
        ClaimConfig::default(),
    );
    (coordinator, sink)
}

async fn wait_for_events(sink: &RecordingSink, count: usize) {
    for _ in 0..200 {
        if sink.events().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} outcome events, got {:?}", sink.events());
}

/// Start a session on `partitions`, route `messages` to it and wait until
/// every one of them has an outcome.
async fn run_session(
    coordinator: &Coordinator,
    sink: &RecordingSink,
    partitions: &[Partition],
    messages: Vec<Message>,
) {
    coordinator.begin_join().unwrap();
    coordinator.assign(partitions).await.unwrap();

    let count = messages.len();
    for message in messages {
        assert!(coordinator.route(message).await);
    }
    wait_for_events(sink, count).await;
}

#[tokio::test]
async fn test_well_formed_purchase_is_handled_once() {
    let handler = Arc::new(RecordingHandler::new());
    let (coordinator, sink) = coordinator(handler.clone());
    let partition = Partition::new("purchases", 0);

    run_session(
        &coordinator,
        &sink,
        &[partition.clone()],
        vec![purchase_message(0, r#"{"id":"p1","amount":10}"#)],
    )
    .await;

    assert_eq!(sink.kinds(), vec![OutcomeKind::Handled]);
    assert_eq!(
        handler.records(),
        vec![TestPurchase {
            id: "p1".to_string(),
            amount: 10
        }]
    );
    assert_eq!(coordinator.close().await.get(&partition), Some(&1));
}

#[tokio::test]
async fn test_malformed_purchase_is_skipped_and_marked() {
    let handler = Arc::new(RecordingHandler::new());
    let (coordinator, sink) = coordinator(handler.clone());
    let partition = Partition::new("purchases", 0);

    run_session(
        &coordinator,
        &sink,
        &[partition.clone()],
        vec![purchase_message(0, "not-json")],
    )
    .await;

    assert_eq!(sink.kinds(), vec![OutcomeKind::DecodeFailed]);
    assert!(handler.records().is_empty());
    assert_eq!(coordinator.close().await.get(&partition), Some(&1));
}

#[tokio::test]
async fn test_unregistered_topic_is_skipped_and_marked() {
    let handler = Arc::new(RecordingHandler::new());
    let (coordinator, sink) = coordinator(handler.clone());
    let partition = Partition::new("unknown-topic", 0);

    run_session(
        &coordinator,
        &sink,
        &[partition.clone()],
        vec![Message::new(partition.clone(), 0, Some(b"anything".to_vec()))],
    )
    .await;

    assert_eq!(sink.kinds(), vec![OutcomeKind::UnknownTopic]);
    assert!(handler.records().is_empty());
    assert_eq!(coordinator.close().await.get(&partition), Some(&1));
}

#[tokio::test]
async fn test_handler_failure_moves_on_to_next_offset() {
    let handler = Arc::new(RecordingHandler::failing_at(|p: &TestPurchase| p.id == "p5"));
    let (coordinator, sink) = coordinator(handler.clone());
    let partition = Partition::new("purchases", 0);

    run_session(
        &coordinator,
        &sink,
        &[partition.clone()],
        vec![
            purchase_message(5, r#"{"id":"p5","amount":10}"#),
            purchase_message(6, r#"{"id":"p6","amount":10}"#),
        ],
    )
    .await;

    let outcomes: Vec<(i64, OutcomeKind)> = sink.events().iter().map(|e| (e.offset, e.kind)).collect();
    assert_eq!(
        outcomes,
        vec![(5, OutcomeKind::HandlerFailed), (6, OutcomeKind::Handled)]
    );
    let ids: Vec<String> = handler.records().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["p5", "p6"]);
    assert_eq!(coordinator.close().await.get(&partition), Some(&7));
}

#[tokio::test]
async fn test_new_claim_redelivers_uncommitted_offsets() {
    let handler = Arc::new(RecordingHandler::new());
    let (coordinator, sink) = coordinator(handler.clone());
    let partition = Partition::new("purchases", 0);

    run_session(
        &coordinator,
        &sink,
        &[partition.clone()],
        vec![purchase_message(0, r#"{"id":"p0","amount":1}"#)],
    )
    .await;
    let revoked = coordinator.revoke(&[partition.clone()]).await;
    assert_eq!(revoked.get(&partition), Some(&1));

    // The broker hands the same offset to the next claim; it is not deduplicated
    coordinator.assign(&[partition.clone()]).await.unwrap();
    assert!(coordinator.route(purchase_message(0, r#"{"id":"p0","amount":1}"#)).await);
    wait_for_events(&sink, 2).await;

    let generations: Vec<(u64, i64)> = sink.events().iter().map(|e| (e.generation, e.offset)).collect();
    assert_eq!(generations, vec![(1, 0), (2, 0)]);
    assert_eq!(handler.records().len(), 2);
    coordinator.close().await;
}
