//! Test utilities shared by unit and integration tests

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::claim::{ClaimConfig, ClaimContext};
use crate::dispatcher::{json, Dispatcher, OutcomeKind, RecordHandler};
use crate::error::DecodeError;
use crate::observability::{OutcomeEvent, OutcomeSink};
use crate::offset_tracker::OffsetMarker;
use crate::types::{Message, Partition};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TestPurchase {
    pub id: String,
    pub amount: i64,
}

/// Message on partition 0 of the `purchases` topic.
pub fn purchase_message(offset: i64, payload: &str) -> Message {
    purchase_message_on(0, offset, payload)
}

pub fn purchase_message_on(partition: i32, offset: i64, payload: &str) -> Message {
    Message::new(
        Partition::new("purchases", partition),
        offset,
        Some(payload.as_bytes().to_vec()),
    )
}

// Handler that records every record it is given
pub struct RecordingHandler<R> {
    records: Mutex<Vec<R>>,
    fail_when: Option<fn(&R) -> bool>,
    delay: Option<Duration>,
}

impl<R> Default for RecordingHandler<R> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_when: None,
            delay: None,
        }
    }
}

impl<R: Clone> RecordingHandler<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records everything, but returns an error for records matching `predicate`.
    pub fn failing_at(predicate: fn(&R) -> bool) -> Self {
        Self {
            fail_when: Some(predicate),
            ..Self::default()
        }
    }

    /// Sleeps for `delay` before recording each record.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<R> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> RecordHandler<R> for RecordingHandler<R> {
    async fn handle(&self, record: R) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self.fail_when.is_some_and(|predicate| predicate(&record));
        self.records.lock().unwrap().push(record);

        if fail {
            anyhow::bail!("scripted handler failure");
        }
        Ok(())
    }
}

// Marker that remembers the order offsets were marked in
#[derive(Default)]
pub struct RecordingMarker {
    marked: Mutex<Vec<Message>>,
}

impl RecordingMarker {
    pub fn offsets(&self) -> Vec<i64> {
        self.marked.lock().unwrap().iter().map(Message::offset).collect()
    }
}

impl OffsetMarker for RecordingMarker {
    fn mark_processed(&self, message: &Message) {
        self.marked.lock().unwrap().push(message.clone());
    }
}

// Sink that keeps every outcome event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OutcomeEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<OutcomeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.events().iter().map(|e| e.offset).collect()
    }

    pub fn kinds(&self) -> Vec<OutcomeKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl OutcomeSink for RecordingSink {
    fn record(&self, event: &OutcomeEvent, _elapsed: Duration) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Claim context dispatching `purchases` to `handler`, with recording fakes
/// for the marker and sink.
pub fn claim_context(
    handler: Arc<RecordingHandler<TestPurchase>>,
) -> (ClaimContext, Arc<RecordingMarker>, Arc<RecordingSink>) {
    let dispatcher = Dispatcher::builder()
        .register("purchases", json::<TestPurchase>, handler)
        .build()
        .unwrap();
    let marker = Arc::new(RecordingMarker::default());
    let sink = Arc::new(RecordingSink::default());

    let ctx = ClaimContext {
        dispatcher: Arc::new(dispatcher),
        marker: marker.clone(),
        sink: sink.clone(),
        config: ClaimConfig::default(),
    };
    (ctx, marker, sink)
}

thread_local! {
    static DECODE_CALLS: Cell<usize> = const { Cell::new(0) };
}

/// Decoder that counts its invocations on the current thread.
pub fn counting_decoder(payload: &[u8]) -> Result<u64, DecodeError> {
    DECODE_CALLS.with(|calls| calls.set(calls.get() + 1));
    Ok(payload.len() as u64)
}

pub fn decode_calls() -> usize {
    DECODE_CALLS.with(Cell::get)
}
