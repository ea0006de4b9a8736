use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatcher::{Outcome, OutcomeKind};
use crate::metrics_consts::{MESSAGES_DISPATCHED, MESSAGE_DISPATCH_DURATION};
use crate::types::{Message, Partition};

/// One event per dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub partition: Partition,
    pub offset: i64,
    pub kind: OutcomeKind,
    /// Error detail for everything but `Handled`
    pub error: Option<String>,
    pub generation: u64,
}

impl OutcomeEvent {
    pub fn new(message: &Message, outcome: &Outcome, generation: u64) -> Self {
        let error = match outcome {
            Outcome::Handled => None,
            Outcome::DecodeFailed(e) => Some(format!("{e:#}")),
            Outcome::HandlerFailed(e) => Some(format!("{e:#}")),
            Outcome::UnknownTopic => Some(format!(
                "no handler registered for topic {}",
                message.topic()
            )),
        };

        Self {
            partition: message.partition().clone(),
            offset: message.offset(),
            kind: outcome.kind(),
            error,
            generation,
        }
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }
}

/// Receives the outcome of every message. Implementations must be cheap, they
/// run inline in the claim loop.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, event: &OutcomeEvent, elapsed: Duration);
}

/// Default sink: structured logs plus prometheus counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutcomeSink;

impl OutcomeSink for TracingOutcomeSink {
    fn record(&self, event: &OutcomeEvent, elapsed: Duration) {
        let topic = event.topic().to_string();

        metrics::counter!(
            MESSAGES_DISPATCHED,
            "topic" => topic.clone(),
            "outcome" => event.kind.as_str()
        )
        .increment(1);
        metrics::histogram!(MESSAGE_DISPATCH_DURATION, "topic" => topic)
            .record(elapsed.as_secs_f64());

        match event.kind {
            OutcomeKind::Handled => debug!(
                topic = event.topic(),
                partition = event.partition.partition_number(),
                offset = event.offset,
                generation = event.generation,
                "Message handled"
            ),
            OutcomeKind::DecodeFailed | OutcomeKind::HandlerFailed | OutcomeKind::UnknownTopic => {
                warn!(
                    topic = event.topic(),
                    partition = event.partition.partition_number(),
                    offset = event.offset,
                    generation = event.generation,
                    outcome = %event.kind,
                    error = event.error.as_deref().unwrap_or_default(),
                    "Message skipped"
                )
            }
        }
    }
}
