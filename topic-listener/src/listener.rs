//! Topic Listener - one `join()` is one membership of the consumer group.
//!
//! `join` connects, subscribes and then polls until shutdown or an error.
//! Polled messages are routed to the claim loop of their partition; offsets
//! marked by the claim loops are committed on a fixed interval. On every
//! exit path the live session is drained, the remaining offsets committed
//! and the subscription dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{is_fatal_kafka_error, requires_rejoin, GroupProtocolError, ListenerError};
use crate::kafka::{commit_offsets, connect, CommitReason, ListenerContext};
use crate::metrics_consts::CONSUMER_ERRORS;
use crate::offset_tracker::OffsetTrackerError;
use crate::rejoin::GroupMember;
use crate::types::Message;

/// Back-off after a transient consumer error
const CONSUMER_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub topics: Vec<String>,
    pub commit_interval: Duration,
    pub connect_timeout: Duration,
}

impl ListenerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topics: config.topics(),
            commit_interval: config.commit_interval(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

pub struct TopicListener {
    coordinator: Arc<Coordinator>,
    client_config: ClientConfig,
    settings: ListenerSettings,
}

impl TopicListener {
    pub fn new(
        coordinator: Arc<Coordinator>,
        client_config: ClientConfig,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            coordinator,
            client_config,
            settings,
        }
    }

    pub fn from_config(config: &Config, coordinator: Arc<Coordinator>) -> Self {
        Self::new(
            coordinator,
            config.to_client_config(),
            ListenerSettings::from_config(config),
        )
    }

    /// Participate in the group until `shutdown` fires (`Ok`, coordinator
    /// closed) or the membership fails (`Err`, coordinator disconnected).
    pub async fn join(&self, shutdown: &CancellationToken) -> Result<(), ListenerError> {
        let context = ListenerContext::new(self.coordinator.clone())?;
        self.coordinator.begin_join()?;

        let connection =
            match connect(&self.client_config, context, self.settings.connect_timeout) {
                Ok(connection) => connection,
                Err(e) => {
                    self.coordinator.leave().await;
                    return Err(e.into());
                }
            };
        let consumer = connection.consumer();

        let topics: Vec<&str> = self.settings.topics.iter().map(String::as_str).collect();
        if let Err(e) = consumer.subscribe(&topics) {
            self.coordinator.leave().await;
            return Err(GroupProtocolError::Subscribe {
                topics: self.settings.topics.clone(),
                source: e,
            }
            .into());
        }
        info!(topics = ?self.settings.topics, "Subscribed, waiting for assignment");

        let result = self.poll(consumer, shutdown).await;

        // Closing first makes the revoke fired by unsubscribe a no-op
        let offsets = match &result {
            Ok(()) => self.coordinator.close().await,
            Err(_) => self.coordinator.leave().await,
        };
        if let Err(e) = commit_offsets(consumer, &offsets, CommitReason::Shutdown) {
            error!(error = ?e, "Final offset commit failed");
        }
        consumer.unsubscribe();

        match &result {
            Ok(()) => info!("Left consumer group"),
            Err(e) => warn!(error = ?e, "Consumer group membership ended with an error"),
        }
        result
    }

    async fn poll(
        &self,
        consumer: &StreamConsumer<ListenerContext>,
        shutdown: &CancellationToken,
    ) -> Result<(), ListenerError> {
        let mut commit_interval = tokio::time::interval(self.settings.commit_interval);
        commit_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, leaving consumer group");
                    return Ok(());
                }

                _ = commit_interval.tick() => {
                    self.commit_processed(consumer);
                }

                received = consumer.recv() => {
                    let message = match received {
                        Ok(borrowed) => Message::from(&borrowed),
                        Err(e) => {
                            classify_consumer_error(e)?;
                            tokio::time::sleep(CONSUMER_ERROR_BACKOFF).await;
                            continue;
                        }
                    };

                    // A full claim channel blocks here; shutdown must still get through
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = self.coordinator.route(message) => {}
                    }
                }
            }
        }
    }

    fn commit_processed(&self, consumer: &StreamConsumer<ListenerContext>) {
        match self.coordinator.tracker().committable_offsets() {
            Ok(offsets) => {
                if commit_offsets(consumer, &offsets, CommitReason::Periodic).is_err() {
                    debug!("Periodic commit failed, retrying on the next tick");
                }
            }
            Err(OffsetTrackerError::RebalanceInProgress) => {
                debug!("Skipping periodic commit, rebalance in progress");
            }
        }
    }
}

#[async_trait]
impl GroupMember for TopicListener {
    async fn join(&self, shutdown: &CancellationToken) -> Result<(), ListenerError> {
        TopicListener::join(self, shutdown).await
    }
}

/// `Ok` for errors the poll loop can ride out, `Err` for errors that end
/// this membership.
fn classify_consumer_error(error: KafkaError) -> Result<(), ListenerError> {
    if is_fatal_kafka_error(&error) {
        metrics::counter!(CONSUMER_ERRORS, "kind" => "fatal").increment(1);
        error!(error = %error, "Fatal consumer error");
        return Err(GroupProtocolError::Consumption(error).into());
    }

    if requires_rejoin(&error) {
        metrics::counter!(CONSUMER_ERRORS, "kind" => "rejoin").increment(1);
        warn!(error = %error, "Group membership lost, rejoining");
        return Err(GroupProtocolError::Consumption(error).into());
    }

    metrics::counter!(CONSUMER_ERRORS, "kind" => "transient").increment(1);
    warn!(error = %error, "Error receiving message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimConfig;
    use crate::coordinator::CoordinatorState;
    use crate::dispatcher::{json, Dispatcher};
    use crate::offset_tracker::OffsetTracker;
    use crate::test_utils::{RecordingHandler, RecordingSink, TestPurchase};
    use rdkafka::error::RDKafkaErrorCode;
    use test_case::test_case;

    #[test_case(RDKafkaErrorCode::BrokerTransportFailure, None ; "transport failure is ridden out")]
    #[test_case(RDKafkaErrorCode::UnknownMemberId, Some(true) ; "unknown member rejoins")]
    #[test_case(RDKafkaErrorCode::PollExceeded, Some(true) ; "max poll exceeded rejoins")]
    #[test_case(RDKafkaErrorCode::GroupAuthorizationFailed, Some(false) ; "authorization is fatal")]
    fn test_classify_consumer_error(code: RDKafkaErrorCode, retryable: Option<bool>) {
        let result = classify_consumer_error(KafkaError::MessageConsumption(code));

        assert_eq!(result.as_ref().err().map(ListenerError::is_retryable), retryable);
    }

    #[test]
    fn test_consumption_fatal_is_not_retryable() {
        let result = classify_consumer_error(KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal,
        ));

        assert!(matches!(result, Err(ref e) if !e.is_retryable()));
    }

    #[tokio::test]
    async fn test_join_refuses_current_thread_runtime() {
        let dispatcher = Dispatcher::builder()
            .register(
                "purchases",
                json::<TestPurchase>,
                Arc::new(RecordingHandler::<TestPurchase>::new()),
            )
            .build()
            .unwrap();
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(dispatcher),
            Arc::new(OffsetTracker::new()),
            Arc::new(RecordingSink::default()),
            ClaimConfig::default(),
        ));
        let listener = TopicListener::new(
            coordinator.clone(),
            ClientConfig::new(),
            ListenerSettings {
                topics: vec!["purchases".to_string()],
                commit_interval: Duration::from_secs(5),
                connect_timeout: Duration::from_millis(100),
            },
        );

        let result = listener.join(&CancellationToken::new()).await;

        assert!(matches!(result, Err(ListenerError::UnsupportedRuntime)));
        assert_eq!(coordinator.state(), CoordinatorState::Disconnected);
    }
}
