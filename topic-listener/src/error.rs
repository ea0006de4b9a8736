use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Failures establishing transport to the broker cluster.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("no broker addresses were provided")]
    NoBrokers,
    #[error("failed to create kafka client")]
    ClientCreation(#[source] KafkaError),
    #[error("no broker in [{brokers}] is reachable")]
    Unreachable {
        brokers: String,
        #[source]
        source: KafkaError,
    },
}

/// Failures of the join/rebalance protocol or of offset commits.
#[derive(Error, Debug)]
pub enum GroupProtocolError {
    #[error("failed to subscribe to topics {topics:?}")]
    Subscribe {
        topics: Vec<String>,
        #[source]
        source: KafkaError,
    },
    #[error("consumer group failure")]
    Consumption(#[source] KafkaError),
    #[error("failed to commit offsets")]
    Commit(#[source] KafkaError),
}

impl GroupProtocolError {
    /// Retryable errors are recovered by leaving and rejoining the group.
    pub fn is_retryable(&self) -> bool {
        match self {
            GroupProtocolError::Subscribe { source, .. }
            | GroupProtocolError::Consumption(source)
            | GroupProtocolError::Commit(source) => !is_fatal_kafka_error(source),
        }
    }
}

/// Returns true for errors no amount of rejoining will fix.
pub fn is_fatal_kafka_error(error: &KafkaError) -> bool {
    if let KafkaError::MessageConsumptionFatal(_) = error {
        return true;
    }

    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
                | RDKafkaErrorCode::InvalidGroupId
                | RDKafkaErrorCode::GroupIdNotFound
                | RDKafkaErrorCode::FencedInstanceId
        )
    )
}

/// Returns true for errors that mean our group membership is gone and the
/// group has to be joined again.
pub fn requires_rejoin(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::UnknownMemberId
                | RDKafkaErrorCode::IllegalGeneration
                | RDKafkaErrorCode::PollExceeded
                | RDKafkaErrorCode::CoordinatorNotAvailable
                | RDKafkaErrorCode::NotCoordinator
        )
    )
}

/// A message payload that cannot be decoded for its topic.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("received empty payload")]
    EmptyPayload,
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// A topic handler reported failure for a decoded record.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct HandlerError(#[from] anyhow::Error);

/// Invalid topic to handler table.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("a handler is already registered for topic {0}")]
    DuplicateTopic(String),
    #[error("topic names must not be empty")]
    EmptyTopic,
    #[error("no topic handlers were registered")]
    NoHandlers,
}

/// Errors that end a `join()` call.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    GroupProtocol(#[from] GroupProtocolError),
    #[error("listener is closed")]
    Closed,
    #[error("the listener requires a multi-threaded tokio runtime")]
    UnsupportedRuntime,
    #[error("gave up rejoining the consumer group after {attempts} attempts")]
    RejoinBudgetExhausted {
        attempts: u32,
        #[source]
        source: Box<ListenerError>,
    },
}

impl ListenerError {
    /// Whether `rejoin::run` should try another `join()` after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ListenerError::GroupProtocol(e) => e.is_retryable(),
            ListenerError::Connection(_)
            | ListenerError::Closed
            | ListenerError::UnsupportedRuntime
            | ListenerError::RejoinBudgetExhausted { .. } => false,
        }
    }
}
