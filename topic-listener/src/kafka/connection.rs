use std::time::Duration;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::ClientConfig;
use tracing::{error, info};

use crate::error::ConnectionError;
use crate::kafka::context::ListenerContext;

/// An open, reachable group consumer. Dropping it closes the connection.
pub struct KafkaConnection {
    consumer: StreamConsumer<ListenerContext>,
}

impl KafkaConnection {
    pub fn consumer(&self) -> &StreamConsumer<ListenerContext> {
        &self.consumer
    }
}

/// Create the consumer and verify at least one broker answers a metadata
/// request within `timeout`. Transport retries are left to librdkafka.
pub fn connect(
    client_config: &ClientConfig,
    context: ListenerContext,
    timeout: Duration,
) -> Result<KafkaConnection, ConnectionError> {
    let brokers = client_config
        .get("bootstrap.servers")
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if brokers.split(',').all(|b| b.trim().is_empty()) {
        return Err(ConnectionError::NoBrokers);
    }

    let consumer: StreamConsumer<ListenerContext> = client_config
        .create_with_context(context)
        .map_err(ConnectionError::ClientCreation)?;

    // "Ping" the Kafka brokers by requesting metadata
    match consumer.fetch_metadata(None, timeout) {
        Ok(metadata) => {
            info!(
                brokers = %brokers,
                topics = metadata.topics().len(),
                "Successfully connected to Kafka brokers"
            );
        }
        Err(e) => {
            error!(brokers = %brokers, error = %e, "Failed to fetch metadata from Kafka brokers");
            return Err(ConnectionError::Unreachable { brokers, source: e });
        }
    }

    Ok(KafkaConnection { consumer })
}
