//! Claim Consumption Loop - one task per claimed partition
//!
//! Each claim owns a bounded channel fed by the poll loop. Messages are taken
//! one at a time: the next message is not requested until the current one has
//! been dispatched, reported and marked, so at most one message per partition
//! is ever in flight and the marked offset never runs ahead of the handlers.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::metrics_consts::CLAIM_DUPLICATES_DROPPED;
use crate::observability::{OutcomeEvent, OutcomeSink};
use crate::offset_tracker::OffsetMarker;
use crate::types::{Message, Partition};

/// Configuration for claim workers
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    /// Size of the channel buffer per partition
    pub channel_buffer_size: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 100,
        }
    }
}

/// Everything a claim loop needs besides its own stream.
#[derive(Clone)]
pub struct ClaimContext {
    pub dispatcher: Arc<Dispatcher>,
    pub marker: Arc<dyn OffsetMarker>,
    pub sink: Arc<dyn OutcomeSink>,
    pub config: ClaimConfig,
}

/// Exclusive ownership of one partition for one session generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionClaim {
    partition: Partition,
    generation: u64,
    /// Offset of the last delivered message
    cursor: Option<i64>,
}

impl PartitionClaim {
    pub fn new(partition: Partition, generation: u64) -> Self {
        Self {
            partition,
            generation,
            cursor: None,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// Move the cursor to `offset`. Returns false, leaving the cursor alone,
    /// if the offset was already delivered under this claim.
    fn advance(&mut self, offset: i64) -> bool {
        match self.cursor {
            Some(cursor) if offset <= cursor => false,
            _ => {
                self.cursor = Some(offset);
                true
            }
        }
    }
}

/// What a claim loop did before it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSummary {
    pub dispatched: u64,
    pub duplicates_dropped: u64,
    pub last_offset: Option<i64>,
    pub cancelled: bool,
}

/// Run the claim loop until the stream ends or `cancel` fires.
pub async fn consume_claim(
    mut claim: PartitionClaim,
    mut messages: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    ctx: ClaimContext,
) -> ClaimSummary {
    let mut summary = ClaimSummary::default();

    loop {
        let message = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                summary.cancelled = true;
                break;
            }

            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if !claim.advance(message.offset()) {
            warn!(
                topic = message.topic(),
                partition = message.partition_number(),
                offset = message.offset(),
                cursor = ?claim.cursor(),
                generation = claim.generation(),
                "Dropping message already delivered under this claim"
            );
            metrics::counter!(
                CLAIM_DUPLICATES_DROPPED,
                "topic" => message.topic().to_string()
            )
            .increment(1);
            summary.duplicates_dropped += 1;
            continue;
        }

        let started = Instant::now();
        let outcome = ctx.dispatcher.dispatch(&message).await;
        let event = OutcomeEvent::new(&message, &outcome, claim.generation());
        ctx.sink.record(&event, started.elapsed());

        // Every outcome, failures included, moves the partition forward
        ctx.marker.mark_processed(&message);

        summary.dispatched += 1;
        summary.last_offset = Some(message.offset());
    }

    summary
}

/// A running claim loop and the sending half of its stream.
pub struct ClaimWorker {
    partition: Partition,
    sender: mpsc::Sender<Message>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<ClaimSummary>>,
}

impl ClaimWorker {
    /// Spawn the claim loop. `cancel` should be a child of the session token.
    pub fn spawn(claim: PartitionClaim, cancel: CancellationToken, ctx: ClaimContext) -> Self {
        let (sender, receiver) = mpsc::channel(ctx.config.channel_buffer_size.max(1));
        let partition = claim.partition().clone();

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            generation = claim.generation(),
            "Starting claim loop"
        );

        let handle = tokio::spawn(consume_claim(claim, receiver, cancel.clone(), ctx));

        Self {
            partition,
            sender,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// A clone of the sender, so callers can await on it without holding
    /// any lock on the session.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.sender.clone()
    }

    /// Cancel the loop and wait until it has fully exited. Messages still
    /// buffered in the channel are dropped unmarked.
    pub async fn shutdown(mut self) -> ClaimSummary {
        self.cancel.cancel();
        drop(self.sender);

        let Some(handle) = self.handle.take() else {
            return ClaimSummary::default();
        };

        match handle.await {
            Ok(summary) => {
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    dispatched = summary.dispatched,
                    last_offset = ?summary.last_offset,
                    "Claim loop exited"
                );
                summary
            }
            Err(e) => {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = %e,
                    "Claim loop panicked"
                );
                ClaimSummary::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::OutcomeKind;
    use crate::test_utils::{claim_context as context, purchase_message, RecordingHandler, TestPurchase};
    use std::time::Duration;

    fn valid(offset: i64) -> Message {
        purchase_message(offset, &format!(r#"{{"id":"p{offset}","amount":10}}"#))
    }

    #[tokio::test]
    async fn test_dispatches_and_marks_in_offset_order() {
        let handler = Arc::new(RecordingHandler::new());
        let (ctx, marker, sink) = context(handler.clone());
        let (tx, rx) = mpsc::channel(16);

        for offset in 0..5 {
            tx.send(valid(offset)).await.unwrap();
        }
        drop(tx);

        let claim = PartitionClaim::new(Partition::new("purchases", 0), 1);
        let summary = consume_claim(claim, rx, CancellationToken::new(), ctx).await;

        assert_eq!(summary.dispatched, 5);
        assert_eq!(summary.last_offset, Some(4));
        assert!(!summary.cancelled);
        assert_eq!(marker.offsets(), vec![0, 1, 2, 3, 4]);
        assert_eq!(sink.offsets(), vec![0, 1, 2, 3, 4]);
        let ids: Vec<String> = handler.records().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p0", "p1", "p2", "p3", "p4"]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_marked_and_skipped() {
        let handler = Arc::new(RecordingHandler::new());
        let (ctx, marker, sink) = context(handler.clone());
        let (tx, rx) = mpsc::channel(16);

        tx.send(purchase_message(0, "not-json")).await.unwrap();
        tx.send(valid(1)).await.unwrap();
        drop(tx);

        let claim = PartitionClaim::new(Partition::new("purchases", 0), 1);
        consume_claim(claim, rx, CancellationToken::new(), ctx).await;

        assert_eq!(
            sink.kinds(),
            vec![OutcomeKind::DecodeFailed, OutcomeKind::Handled]
        );
        assert_eq!(marker.offsets(), vec![0, 1]);
        assert_eq!(handler.records().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_is_marked_and_next_offset_follows() {
        let handler = Arc::new(RecordingHandler::failing_at(|p: &TestPurchase| {
            p.id == "p5"
        }));
        let (ctx, marker, sink) = context(handler.clone());
        let (tx, rx) = mpsc::channel(16);

        tx.send(valid(5)).await.unwrap();
        tx.send(valid(6)).await.unwrap();
        drop(tx);

        let claim = PartitionClaim::new(Partition::new("purchases", 0), 1);
        consume_claim(claim, rx, CancellationToken::new(), ctx).await;

        assert_eq!(
            sink.kinds(),
            vec![OutcomeKind::HandlerFailed, OutcomeKind::Handled]
        );
        assert_eq!(marker.offsets(), vec![5, 6]);
        let ids: Vec<String> = handler.records().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p5", "p6"]);
    }

    #[tokio::test]
    async fn test_redelivered_offsets_are_dropped_within_a_claim() {
        let handler = Arc::new(RecordingHandler::new());
        let (ctx, marker, _sink) = context(handler.clone());
        let (tx, rx) = mpsc::channel(16);

        for offset in [0, 1, 1, 0, 2] {
            tx.send(valid(offset)).await.unwrap();
        }
        drop(tx);

        let claim = PartitionClaim::new(Partition::new("purchases", 0), 1);
        let summary = consume_claim(claim, rx, CancellationToken::new(), ctx).await;

        assert_eq!(summary.dispatched, 3);
        assert_eq!(summary.duplicates_dropped, 2);
        assert_eq!(marker.offsets(), vec![0, 1, 2]);
        assert_eq!(handler.records().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_claim_consumes_nothing() {
        let handler = Arc::new(RecordingHandler::new());
        let (ctx, marker, sink) = context(handler.clone());
        let (tx, rx) = mpsc::channel(16);
        tx.send(valid(0)).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let claim = PartitionClaim::new(Partition::new("purchases", 0), 1);
        let summary = consume_claim(claim, rx, cancel, ctx).await;

        assert!(summary.cancelled);
        assert_eq!(summary.dispatched, 0);
        assert!(marker.offsets().is_empty());
        assert!(sink.offsets().is_empty());
        assert!(handler.records().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_dispatch() {
        let handler = Arc::new(RecordingHandler::with_delay(Duration::from_millis(50)));
        let (ctx, marker, _sink) = context(handler.clone());

        let claim = PartitionClaim::new(Partition::new("purchases", 0), 1);
        let worker = ClaimWorker::spawn(claim, CancellationToken::new(), ctx);
        worker.sender().send(valid(0)).await.unwrap();

        // Let the loop pick up the message and enter the slow handler
        tokio::time::sleep(Duration::from_millis(10)).await;
        let summary = worker.shutdown().await;

        assert!(summary.cancelled);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(marker.offsets(), vec![0]);
    }

    #[test]
    fn test_claim_cursor_only_moves_forward() {
        let mut claim = PartitionClaim::new(Partition::new("purchases", 0), 7);
        assert_eq!(claim.cursor(), None);

        assert!(claim.advance(3));
        assert!(!claim.advance(3));
        assert!(!claim.advance(2));
        assert!(claim.advance(10));

        assert_eq!(claim.cursor(), Some(10));
        assert_eq!(claim.generation(), 7);
    }
}
