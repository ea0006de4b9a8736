//! Offset Tracker - records the processed position of every claimed partition
//!
//! Claim loops mark each message once it has been dispatched. The tracker keeps
//! the next offset to consume (`offset + 1`) per partition, which is exactly
//! what gets committed to the broker. Marks never move a partition backwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use rdkafka::error::KafkaResult;
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics_consts::OFFSET_MARK_OUT_OF_ORDER;
use crate::types::{Message, Partition};

/// Errors that can occur when retrieving committable offsets
#[derive(Error, Debug)]
pub enum OffsetTrackerError {
    /// A rebalance is currently in progress - commits should be skipped
    #[error("Rebalance in progress - offset commits should be skipped")]
    RebalanceInProgress,
}

/// Records that a message has been handed to its handler.
///
/// Must be called exactly once per message, in offset order, before the claim
/// loop asks for the next message of that partition.
pub trait OffsetMarker: Send + Sync {
    fn mark_processed(&self, message: &Message);
}

/// Thread-safe tracker of processed offsets per partition
pub struct OffsetTracker {
    /// Next offset to consume per partition
    next_offsets: DashMap<Partition, i64>,
    /// When true, periodic commits are skipped
    rebalancing: AtomicBool,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetMarker for OffsetTracker {
    fn mark_processed(&self, message: &Message) {
        let partition = message.partition();
        let next_offset = message.offset() + 1;

        self.next_offsets
            .entry(partition.clone())
            .and_modify(|current| {
                if next_offset <= *current {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = message.offset(),
                        next_offset = *current,
                        "Offset marked out of order, ignoring"
                    );
                    metrics::counter!(
                        OFFSET_MARK_OUT_OF_ORDER,
                        "topic" => partition.topic().to_string(),
                        "partition" => partition.partition_number().to_string()
                    )
                    .increment(1);
                    return;
                }
                *current = next_offset;
            })
            .or_insert_with(|| {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = message.offset(),
                    "Initializing partition offset"
                );
                next_offset
            });
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            next_offsets: DashMap::new(),
            rebalancing: AtomicBool::new(false),
        }
    }

    pub fn set_rebalancing(&self, rebalancing: bool) {
        let was_rebalancing = self.rebalancing.swap(rebalancing, Ordering::SeqCst);
        if was_rebalancing != rebalancing {
            info!(
                rebalancing = rebalancing,
                "Offset tracker rebalancing state changed"
            );
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    /// Snapshot of every partition's next offset, for the periodic commit.
    pub fn committable_offsets(&self) -> Result<HashMap<Partition, i64>, OffsetTrackerError> {
        if self.is_rebalancing() {
            return Err(OffsetTrackerError::RebalanceInProgress);
        }

        Ok(self.snapshot())
    }

    /// Snapshot ignoring the rebalancing flag, used for the final commit of
    /// drained partitions.
    pub fn snapshot(&self) -> HashMap<Partition, i64> {
        self.next_offsets
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Remove and return the offsets of partitions that are no longer owned.
    pub fn take_partitions(&self, partitions: &[Partition]) -> HashMap<Partition, i64> {
        partitions
            .iter()
            .filter_map(|p| self.next_offsets.remove(p))
            .collect()
    }

    pub fn partition_offset(&self, partition: &Partition) -> Option<i64> {
        self.next_offsets.get(partition).map(|r| *r.value())
    }

    pub fn clear_all(&self) {
        self.next_offsets.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.next_offsets.len()
    }
}

/// Build the list handed to `Consumer::commit`.
pub fn to_topic_partition_list(offsets: &HashMap<Partition, i64>) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (partition, offset) in offsets {
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*offset),
        )?;
    }
    Ok(tpl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn message(partition: i32, offset: i64) -> Message {
        Message::new(Partition::new("purchases", partition), offset, None)
    }

    #[test]
    fn test_mark_processed_stores_next_offset() {
        let tracker = OffsetTracker::new();

        tracker.mark_processed(&message(0, 99));

        assert_eq!(
            tracker.partition_offset(&Partition::new("purchases", 0)),
            Some(100)
        );
    }

    #[test]
    fn test_mark_processed_advances_offset() {
        let tracker = OffsetTracker::new();

        tracker.mark_processed(&message(0, 5));
        tracker.mark_processed(&message(0, 6));

        assert_eq!(
            tracker.partition_offset(&Partition::new("purchases", 0)),
            Some(7)
        );
    }

    #[test]
    fn test_mark_processed_never_goes_backwards() {
        let tracker = OffsetTracker::new();

        tracker.mark_processed(&message(0, 100));
        tracker.mark_processed(&message(0, 50));
        tracker.mark_processed(&message(0, 100));

        assert_eq!(
            tracker.partition_offset(&Partition::new("purchases", 0)),
            Some(101)
        );
    }

    #[test]
    fn test_multiple_partitions() {
        let tracker = OffsetTracker::new();

        tracker.mark_processed(&message(0, 10));
        tracker.mark_processed(&message(1, 20));
        tracker.mark_processed(&message(2, 30));

        let offsets = tracker.committable_offsets().unwrap();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets.get(&Partition::new("purchases", 0)), Some(&11));
        assert_eq!(offsets.get(&Partition::new("purchases", 1)), Some(&21));
        assert_eq!(offsets.get(&Partition::new("purchases", 2)), Some(&31));
    }

    #[test]
    fn test_take_partitions_removes_only_requested() {
        let tracker = OffsetTracker::new();
        tracker.mark_processed(&message(0, 10));
        tracker.mark_processed(&message(1, 20));

        let taken = tracker.take_partitions(&[
            Partition::new("purchases", 0),
            Partition::new("purchases", 9),
        ]);

        assert_eq!(taken.len(), 1);
        assert_eq!(taken.get(&Partition::new("purchases", 0)), Some(&11));
        assert_eq!(tracker.partition_count(), 1);
        assert_eq!(
            tracker.partition_offset(&Partition::new("purchases", 1)),
            Some(21)
        );
    }

    #[test]
    fn test_rebalancing_blocks_committable_offsets() {
        let tracker = OffsetTracker::new();
        tracker.mark_processed(&message(0, 10));

        tracker.set_rebalancing(true);
        assert!(matches!(
            tracker.committable_offsets(),
            Err(OffsetTrackerError::RebalanceInProgress)
        ));
        assert_eq!(tracker.snapshot().len(), 1);

        tracker.set_rebalancing(false);
        assert_eq!(tracker.committable_offsets().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_different_partitions() {
        let tracker = Arc::new(OffsetTracker::new());

        let handles: Vec<_> = (0..8)
            .map(|p| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for offset in 0..100 {
                        tracker.mark_processed(&message(p, offset));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let offsets = tracker.committable_offsets().unwrap();
        assert_eq!(offsets.len(), 8);
        assert!(offsets.values().all(|offset| *offset == 100));
    }

    #[test]
    fn test_to_topic_partition_list() {
        let mut offsets = HashMap::new();
        offsets.insert(Partition::new("purchases", 0), 11);
        offsets.insert(Partition::new("purchases", 1), 21);

        let tpl = to_topic_partition_list(&offsets).unwrap();

        assert_eq!(tpl.count(), 2);
        assert_eq!(
            tpl.find_partition("purchases", 1).unwrap().offset(),
            Offset::Offset(21)
        );
    }
}
