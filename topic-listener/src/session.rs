//! Group Session - one membership epoch of this process in the consumer group
//!
//! A session owns one claim worker per assigned partition. All claim tokens
//! are children of the session token, so cancelling the session stops every
//! claim loop at once. Closing a session waits for every loop to exit.

use std::collections::HashMap;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::claim::{ClaimContext, ClaimSummary, ClaimWorker, PartitionClaim};
use crate::types::{Message, Partition};

pub struct GroupSession {
    generation: u64,
    cancel: CancellationToken,
    claims: HashMap<Partition, ClaimWorker>,
}

impl GroupSession {
    /// Start a claim loop for each assigned partition. An empty assignment
    /// is a valid, idle session.
    pub fn start(generation: u64, partitions: &[Partition], ctx: &ClaimContext) -> Self {
        let cancel = CancellationToken::new();
        let claims = partitions
            .iter()
            .map(|partition| {
                let claim = PartitionClaim::new(partition.clone(), generation);
                let worker = ClaimWorker::spawn(claim, cancel.child_token(), ctx.clone());
                (partition.clone(), worker)
            })
            .collect();

        info!(
            generation = generation,
            partitions = partitions.len(),
            "Group session started"
        );

        Self {
            generation,
            cancel,
            claims,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Assigned partitions, sorted.
    pub fn partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.claims.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    pub fn owns(&self, partition: &Partition) -> bool {
        self.claims.contains_key(partition)
    }

    /// Sender feeding the claim loop of `partition`, if this session owns it.
    pub fn sender(&self, partition: &Partition) -> Option<mpsc::Sender<Message>> {
        self.claims.get(partition).map(ClaimWorker::sender)
    }

    /// Stop and drain the claim loops of `partitions`; the rest keep running.
    pub async fn revoke(&mut self, partitions: &[Partition]) -> Vec<(Partition, ClaimSummary)> {
        let workers: Vec<ClaimWorker> = partitions
            .iter()
            .filter_map(|p| self.claims.remove(p))
            .collect();

        drain(workers).await
    }

    /// Cancel the session and wait for every claim loop to exit.
    pub async fn close(mut self) -> Vec<(Partition, ClaimSummary)> {
        self.cancel.cancel();
        let workers: Vec<ClaimWorker> = self.claims.drain().map(|(_, w)| w).collect();
        let summaries = drain(workers).await;

        info!(
            generation = self.generation,
            partitions = summaries.len(),
            "Group session closed"
        );
        summaries
    }
}

impl Drop for GroupSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain(workers: Vec<ClaimWorker>) -> Vec<(Partition, ClaimSummary)> {
    join_all(workers.into_iter().map(|worker| async move {
        let partition = worker.partition().clone();
        let summary = worker.shutdown().await;
        (partition, summary)
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{claim_context, purchase_message_on, RecordingHandler};
    use std::sync::Arc;
    use std::time::Duration;

    fn partitions(numbers: &[i32]) -> Vec<Partition> {
        numbers
            .iter()
            .map(|n| Partition::new("purchases", *n))
            .collect()
    }

    #[tokio::test]
    async fn test_start_spawns_one_claim_per_partition() {
        let (ctx, _, _) = claim_context(Arc::new(RecordingHandler::new()));
        let session = GroupSession::start(4, &partitions(&[2, 0, 1]), &ctx);

        assert_eq!(session.generation(), 4);
        assert_eq!(session.partitions(), partitions(&[0, 1, 2]));
        assert!(session.owns(&Partition::new("purchases", 1)));
        assert!(!session.owns(&Partition::new("purchases", 3)));

        session.close().await;
    }

    #[tokio::test]
    async fn test_empty_assignment_is_an_idle_session() {
        let (ctx, _, _) = claim_context(Arc::new(RecordingHandler::new()));
        let session = GroupSession::start(1, &[], &ctx);

        assert!(session.partitions().is_empty());
        assert!(session.close().await.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_keeps_remaining_claims_running() {
        let handler = Arc::new(RecordingHandler::new());
        let (ctx, marker, _) = claim_context(handler.clone());
        let mut session = GroupSession::start(1, &partitions(&[0, 1]), &ctx);

        let summaries = session.revoke(&partitions(&[0])).await;
        assert_eq!(summaries.len(), 1);
        assert!(session.sender(&Partition::new("purchases", 0)).is_none());

        let sender = session.sender(&Partition::new("purchases", 1)).unwrap();
        sender
            .send(purchase_message_on(1, 0, r#"{"id":"p1","amount":10}"#))
            .await
            .unwrap();
        drop(sender);

        let summaries = session.close().await;
        assert_eq!(summaries.len(), 1);
        // The message was either dispatched before close, or dropped unmarked
        assert!(marker.offsets().len() <= 1);
        assert_eq!(handler.records().len(), marker.offsets().len());
    }

    #[tokio::test]
    async fn test_dropped_session_stops_its_claim_loops() {
        let (ctx, marker, _) = claim_context(Arc::new(RecordingHandler::new()));
        let session = GroupSession::start(1, &partitions(&[0]), &ctx);
        let sender = session.sender(&Partition::new("purchases", 0)).unwrap();

        drop(session);

        // The claim loop exits on cancellation and closes its channel
        tokio::time::timeout(Duration::from_secs(1), sender.closed())
            .await
            .unwrap();
        assert!(marker.offsets().is_empty());
    }
}
