use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::error::ListenerError;
use crate::kafka::commit::{commit_offsets, CommitReason};
use crate::metrics_consts::{OFFSET_COMMITS, REBALANCE_EVENTS};
use crate::types::Partition;

/// rdkafka context that drives the [`Coordinator`] from the group's
/// rebalance callbacks.
///
/// Callbacks run on the thread polling the consumer. Revocation blocks there
/// until every affected claim loop has exited and its offsets are committed,
/// so the group never hands a partition on while we still consume it.
/// Blocking a callback needs `block_in_place`, so only the multi-threaded
/// tokio runtime is accepted.
pub struct ListenerContext {
    coordinator: Arc<Coordinator>,
    /// Handle to the async runtime for executing async callbacks from sync context
    rt_handle: Handle,
}

impl ListenerContext {
    /// Must be called from within the tokio runtime that polls the consumer.
    pub fn new(coordinator: Arc<Coordinator>) -> Result<Self, ListenerError> {
        let rt_handle = Handle::try_current().map_err(|_| ListenerError::UnsupportedRuntime)?;
        if !matches!(rt_handle.runtime_flavor(), RuntimeFlavor::MultiThread) {
            return Err(ListenerError::UnsupportedRuntime);
        }

        Ok(Self {
            coordinator,
            rt_handle,
        })
    }

    /// Run `future` to completion from inside a callback.
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        tokio::task::block_in_place(|| self.rt_handle.block_on(future))
    }

    fn revoke(&self, base_consumer: &BaseConsumer<Self>, partitions: &TopicPartitionList) {
        if self.coordinator.state().is_closed() {
            // The consumer's own close revokes everything once more
            debug!("Skipping revoke, listener is closed");
            return;
        }

        let partitions = partition_vec(partitions);
        info!(partitions = partitions.len(), "Revoking partitions");

        let offsets: HashMap<Partition, i64> = self.block_on(self.coordinator.revoke(&partitions));

        if commit_offsets(base_consumer, &offsets, CommitReason::Revoke).is_err() {
            warn!(
                partitions = offsets.len(),
                "Revoked partitions were not committed and will be delivered again"
            );
        }
    }

    fn assign(&self, partitions: &TopicPartitionList) {
        let partitions = partition_vec(partitions);

        let generation = self.block_on(self.coordinator.assign(&partitions));

        match generation {
            Some(generation) => info!(
                generation = generation,
                partitions = partitions.len(),
                "Partitions assigned"
            ),
            None => debug!("Skipping assign, listener is closed"),
        }
    }
}

impl ClientContext for ListenerContext {}

impl ConsumerContext for ListenerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
                self.revoke(base_consumer, partitions);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    partitions = partitions.count(),
                    "Pre-rebalance assign event"
                );
            }
            Rebalance::Error(e) => {
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "error").increment(1);
                error!(error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
                self.assign(partitions);
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "Post-rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                metrics::counter!(OFFSET_COMMITS, "status" => "success").increment(1);
                debug!(
                    partitions = offsets.count(),
                    "Successfully committed offsets"
                );
            }
            Err(e) => {
                metrics::counter!(OFFSET_COMMITS, "status" => "error").increment(1);
                warn!(
                    partitions = offsets.count(),
                    error = %e,
                    "Failed to commit offsets"
                );
            }
        }
    }
}

fn partition_vec(partitions: &TopicPartitionList) -> Vec<Partition> {
    partitions
        .elements()
        .into_iter()
        .map(Partition::from)
        .collect()
}
