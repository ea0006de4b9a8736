//! Consumer Group Coordinator - tracks group membership and owns the live
//! [`GroupSession`].
//!
//! The rdkafka rebalance callbacks drive the state machine:
//!
//! ```text
//! Disconnected ─begin_join─► Joining ─assign─► Stable(g)
//!                                                  │
//!                             Stable(g+1) ◄─assign─┴─revoke─► Rebalancing
//!
//! any state ─close─► Closed        any state ─leave─► Disconnected
//! ```
//!
//! A new session is never started while the previous one still has a claim
//! loop running: `revoke` and `assign` both drain the loops they tear down
//! before returning.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::claim::{ClaimConfig, ClaimContext};
use crate::dispatcher::Dispatcher;
use crate::error::ListenerError;
use crate::metrics_consts::{CLAIMED_PARTITIONS, SESSION_GENERATION, UNCLAIMED_MESSAGES};
use crate::observability::OutcomeSink;
use crate::offset_tracker::OffsetTracker;
use crate::session::GroupSession;
use crate::types::{Message, Partition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Disconnected,
    Joining,
    Stable { generation: u64 },
    Rebalancing,
    Closed,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Disconnected => "disconnected",
            CoordinatorState::Joining => "joining",
            CoordinatorState::Stable { .. } => "stable",
            CoordinatorState::Rebalancing => "rebalancing",
            CoordinatorState::Closed => "closed",
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, CoordinatorState::Stable { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CoordinatorState::Closed)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Stable { generation } => write!(f, "stable({generation})"),
            other => f.write_str(other.as_str()),
        }
    }
}

pub struct Coordinator {
    claim_ctx: ClaimContext,
    tracker: Arc<OffsetTracker>,
    state: watch::Sender<CoordinatorState>,
    /// Only ever locked briefly, never across an await
    session: Mutex<Option<GroupSession>>,
    generation: AtomicU64,
}

impl Coordinator {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        tracker: Arc<OffsetTracker>,
        sink: Arc<dyn OutcomeSink>,
        config: ClaimConfig,
    ) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Disconnected);
        let claim_ctx = ClaimContext {
            dispatcher,
            marker: tracker.clone(),
            sink,
            config,
        };

        Self {
            claim_ctx,
            tracker,
            state,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Watch channel following every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    /// Partitions claimed by the live session, sorted.
    pub fn assigned_partitions(&self) -> Vec<Partition> {
        self.lock_session()
            .as_ref()
            .map(GroupSession::partitions)
            .unwrap_or_default()
    }

    /// Enter `Joining`. Fails once the coordinator is closed.
    pub fn begin_join(&self) -> Result<(), ListenerError> {
        let _guard = self.lock_session();
        if self.state().is_closed() {
            return Err(ListenerError::Closed);
        }
        self.tracker.set_rebalancing(false);
        self.transition(CoordinatorState::Joining);
        Ok(())
    }

    /// Start a new session for `partitions`, draining any session still
    /// alive first. Returns the new generation, or `None` once closed.
    pub async fn assign(&self, partitions: &[Partition]) -> Option<u64> {
        if let Some(stale) = self.take_session() {
            warn!(
                generation = stale.generation(),
                "Assignment received while a session is still live, draining it first"
            );
            let stale_partitions = stale.partitions();
            stale.close().await;
            self.forget_unassigned(&stale_partitions, partitions);
        }

        self.start_session(partitions)
    }

    /// Stop the claim loops of `partitions` and wait for them to exit.
    /// Returns the processed offsets of the revoked partitions so they can
    /// be committed before the group moves them elsewhere.
    pub async fn revoke(&self, partitions: &[Partition]) -> HashMap<Partition, i64> {
        if !self.enter_rebalancing(partitions) {
            return HashMap::new();
        }

        if let Some(mut session) = self.take_session() {
            session.revoke(partitions).await;
            self.keep_if_claiming(session);
        }

        self.release(partitions)
    }

    /// Hand a polled message to the claim loop of its partition. Messages for
    /// partitions without a live claim are dropped unmarked.
    pub async fn route(&self, message: Message) -> bool {
        let sender = self
            .lock_session()
            .as_ref()
            .and_then(|session| session.sender(message.partition()));

        let Some(sender) = sender else {
            self.unclaimed(&message, "no live claim");
            return false;
        };

        match sender.send(message).await {
            Ok(()) => true,
            Err(e) => {
                self.unclaimed(&e.0, "claim loop exited");
                false
            }
        }
    }

    /// Tear the session down after a failed `join()` and return the
    /// offsets processed so far. The coordinator goes back to
    /// `Disconnected`, ready for the next join.
    pub async fn leave(&self) -> HashMap<Partition, i64> {
        let offsets = self.teardown().await;

        let _guard = self.lock_session();
        if !self.state().is_closed() {
            self.transition(CoordinatorState::Disconnected);
        }
        offsets
    }

    /// Final shutdown. After this no session is ever started again.
    /// Returns the offsets to commit before leaving the group.
    pub async fn close(&self) -> HashMap<Partition, i64> {
        {
            let _guard = self.lock_session();
            self.transition(CoordinatorState::Closed);
        }
        self.teardown().await
    }

    fn start_session(&self, partitions: &[Partition]) -> Option<u64> {
        let mut slot = self.lock_session();
        if self.state().is_closed() {
            warn!(
                partitions = partitions.len(),
                "Ignoring assignment, coordinator is closed"
            );
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(GroupSession::start(generation, partitions, &self.claim_ctx));

        self.tracker.set_rebalancing(false);
        self.transition(CoordinatorState::Stable { generation });
        metrics::gauge!(CLAIMED_PARTITIONS).set(partitions.len() as f64);
        metrics::gauge!(SESSION_GENERATION).set(generation as f64);

        Some(generation)
    }

    /// Returns false if the coordinator is closed and nothing should happen.
    fn enter_rebalancing(&self, partitions: &[Partition]) -> bool {
        let _guard = self.lock_session();
        let state = self.state();
        if state.is_closed() {
            return false;
        }

        info!(
            partitions = partitions.len(),
            state = %state,
            "Revoking partitions"
        );
        self.tracker.set_rebalancing(true);
        if state.is_stable() {
            self.transition(CoordinatorState::Rebalancing);
        }
        true
    }

    fn keep_if_claiming(&self, session: GroupSession) {
        if session.partitions().is_empty() {
            return;
        }
        let mut slot = self.lock_session();
        if slot.is_none() && !self.state().is_closed() {
            *slot = Some(session);
        }
    }

    fn release(&self, partitions: &[Partition]) -> HashMap<Partition, i64> {
        metrics::gauge!(CLAIMED_PARTITIONS).set(self.assigned_partitions().len() as f64);
        self.tracker.take_partitions(partitions)
    }

    async fn teardown(&self) -> HashMap<Partition, i64> {
        if let Some(session) = self.take_session() {
            session.close().await;
        }
        metrics::gauge!(CLAIMED_PARTITIONS).set(0.0);

        let offsets = self.tracker.snapshot();
        self.tracker.clear_all();
        self.tracker.set_rebalancing(false);
        offsets
    }

    /// Drop tracked offsets of partitions the group did not give back to us.
    fn forget_unassigned(&self, previous: &[Partition], assigned: &[Partition]) {
        let gone: Vec<Partition> = previous
            .iter()
            .filter(|p| !assigned.contains(p))
            .cloned()
            .collect();
        let dropped = self.tracker.take_partitions(&gone);
        if !dropped.is_empty() {
            warn!(
                partitions = dropped.len(),
                "Dropping uncommitted offsets of partitions no longer assigned"
            );
        }
    }

    fn unclaimed(&self, message: &Message, reason: &'static str) {
        warn!(
            topic = message.topic(),
            partition = message.partition_number(),
            offset = message.offset(),
            reason = reason,
            "Dropping message for unclaimed partition"
        );
        metrics::counter!(UNCLAIMED_MESSAGES, "topic" => message.topic().to_string())
            .increment(1);
    }

    fn take_session(&self) -> Option<GroupSession> {
        self.lock_session().take()
    }

    fn transition(&self, next: CoordinatorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Coordinator state changed");
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<GroupSession>> {
        // A poisoned slot still holds a consistent Option
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
