use rdkafka::ClientConfig;

/// Kafka consumer configuration builder for the listener's group consumer.
///
/// Offsets are never auto-committed or auto-stored: the offset tracker
/// decides what is committed and when.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for a **group-based consumer**.
    ///
    /// Sets: auto.offset.store=false, auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        // Group-consumer defaults
        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Where to start when the group has no committed offset
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Set maximum time between poll() calls before consumer leaves group
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Set session timeout: how long broker waits for heartbeats before declaring consumer dead.
    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// Set heartbeat interval: how often consumer sends heartbeats to broker.
    pub fn with_heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    /// Use an eager assignment strategy, so every rebalance revokes the whole
    /// assignment before handing out the next one. When a client id is
    /// given it also becomes the static membership id. A static member does
    /// not leave the group when it closes: its partitions stay unassigned
    /// until `session.timeout.ms` expires or the same id joins again.
    pub fn with_eager_partition_assignment(mut self, client_id: Option<&str>) -> Self {
        self.config
            .set("partition.assignment.strategy", "range,roundrobin");

        if let Some(found_client_id) = client_id {
            self.config.set("client.id", found_client_id);
            self.config.set("group.instance.id", found_client_id);
        }
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_consumer_never_auto_commits() {
        let config = ConsumerConfigBuilder::for_group_consumer("localhost:9092", "group").build();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("group.id"), Some("group"));
    }

    #[test]
    fn test_eager_assignment_without_client_id() {
        let config = ConsumerConfigBuilder::for_group_consumer("localhost:9092", "group")
            .with_eager_partition_assignment(None)
            .build();

        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("range,roundrobin")
        );
        assert_eq!(config.get("group.instance.id"), None);
        assert_eq!(config.get("client.id"), None);
    }

    #[test]
    fn test_tls_disabled_leaves_protocol_unset() {
        let config = ConsumerConfigBuilder::for_group_consumer("localhost:9092", "group")
            .with_tls(false)
            .set("statistics.interval.ms", "10000")
            .build();

        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("statistics.interval.ms"), Some("10000"));
    }
}
