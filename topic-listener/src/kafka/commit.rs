use std::collections::HashMap;

use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext};
use tracing::{debug, warn};

use crate::error::GroupProtocolError;
use crate::offset_tracker::to_topic_partition_list;
use crate::types::Partition;

/// Why a commit is being issued, used as a log field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReason {
    Periodic,
    Revoke,
    Shutdown,
}

impl CommitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitReason::Periodic => "periodic",
            CommitReason::Revoke => "revoke",
            CommitReason::Shutdown => "shutdown",
        }
    }

    /// Periodic commits are fire-and-forget, the others must land before
    /// the partitions change hands.
    pub fn mode(&self) -> CommitMode {
        match self {
            CommitReason::Periodic => CommitMode::Async,
            CommitReason::Revoke | CommitReason::Shutdown => CommitMode::Sync,
        }
    }
}

/// Commit `offsets` (next offsets to consume) for the group.
pub fn commit_offsets<C, X>(
    consumer: &C,
    offsets: &HashMap<Partition, i64>,
    reason: CommitReason,
) -> Result<(), GroupProtocolError>
where
    C: Consumer<X>,
    X: ConsumerContext + 'static,
{
    if offsets.is_empty() {
        return Ok(());
    }

    let tpl = to_topic_partition_list(offsets).map_err(GroupProtocolError::Commit)?;

    match consumer.commit(&tpl, reason.mode()) {
        Ok(()) => {
            debug!(
                reason = reason.as_str(),
                partitions = offsets.len(),
                "Committed offsets"
            );
            Ok(())
        }
        Err(e) => {
            warn!(
                reason = reason.as_str(),
                partitions = offsets.len(),
                error = %e,
                "Failed to commit offsets"
            );
            Err(GroupProtocolError::Commit(e))
        }
    }
}
