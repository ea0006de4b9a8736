use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::claim::ClaimConfig;
use crate::kafka::ConsumerConfigBuilder;
use crate::rejoin::RejoinPolicy;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("CLAIM_CHANNEL_SIZE must be greater than zero")]
    ZeroChannelSize,
    #[error("KAFKA_HEARTBEAT_INTERVAL_MS ({heartbeat_ms}) must be below KAFKA_SESSION_TIMEOUT_MS ({session_ms})")]
    HeartbeatNotBelowSession { heartbeat_ms: u32, session_ms: u32 },
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "topic-listener")]
    pub kafka_consumer_group: String,

    /// Comma separated list of topics to subscribe to
    #[envconfig(default = "purchases")]
    pub kafka_consumer_topics: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// Also used as the static group membership id. With static membership a
    /// shutdown does not leave the group, so its partitions are only handed
    /// to other members after KAFKA_SESSION_TIMEOUT_MS.
    pub kafka_client_id: Option<String>,

    #[envconfig(default = "45000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "3000")]
    pub kafka_heartbeat_interval_ms: u32,

    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    #[envconfig(default = "10000")]
    pub kafka_connect_timeout_ms: u64,

    // Topic handlers
    #[envconfig(default = "purchases")]
    pub purchases_topic: String,

    // Consumption
    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "100")]
    pub claim_channel_size: usize,

    // Rejoin backoff
    #[envconfig(default = "2")]
    pub rejoin_backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub rejoin_initial_interval_ms: u64,

    #[envconfig(default = "60000")]
    pub rejoin_maximum_interval_ms: u64,

    pub rejoin_max_attempts: Option<u32>,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_addresses().is_empty() {
            return Err(ConfigError::Empty("KAFKA_HOSTS"));
        }
        if self.kafka_consumer_group.trim().is_empty() {
            return Err(ConfigError::Empty("KAFKA_CONSUMER_GROUP"));
        }
        if self.topics().is_empty() {
            return Err(ConfigError::Empty("KAFKA_CONSUMER_TOPICS"));
        }
        if self.purchases_topic.trim().is_empty() {
            return Err(ConfigError::Empty("PURCHASES_TOPIC"));
        }
        if self.claim_channel_size == 0 {
            return Err(ConfigError::ZeroChannelSize);
        }
        if self.kafka_heartbeat_interval_ms >= self.kafka_session_timeout_ms {
            return Err(ConfigError::HeartbeatNotBelowSession {
                heartbeat_ms: self.kafka_heartbeat_interval_ms,
                session_ms: self.kafka_session_timeout_ms,
            });
        }
        Ok(())
    }

    /// Broker addresses with blanks removed
    pub fn broker_addresses(&self) -> Vec<String> {
        split_list(&self.kafka_hosts)
    }

    /// Topics to subscribe to, with blanks removed
    pub fn topics(&self) -> Vec<String> {
        split_list(&self.kafka_consumer_topics)
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn to_claim_config(&self) -> ClaimConfig {
        ClaimConfig {
            channel_buffer_size: self.claim_channel_size,
        }
    }

    pub fn to_rejoin_policy(&self) -> RejoinPolicy {
        RejoinPolicy::new(
            self.rejoin_backoff_coefficient,
            Duration::from_millis(self.rejoin_initial_interval_ms),
            Duration::from_millis(self.rejoin_maximum_interval_ms),
            self.rejoin_max_attempts,
        )
    }

    /// librdkafka settings for the group consumer
    pub fn to_client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::for_group_consumer(
            &self.broker_addresses().join(","),
            &self.kafka_consumer_group,
        )
        .with_tls(self.kafka_tls)
        .with_offset_reset(&self.kafka_consumer_offset_reset)
        .with_session_timeout_ms(self.kafka_session_timeout_ms)
        .with_heartbeat_interval_ms(self.kafka_heartbeat_interval_ms)
        .with_max_poll_interval_ms(self.kafka_max_poll_interval_ms)
        .with_eager_partition_assignment(self.kafka_client_id.as_deref())
        .build()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
