//! rdkafka client configuration

use crate::config::KafkaConfig;

impl KafkaConfig {
    /// Build rdkafka consumer configuration.
    ///
    /// Auto-commit is always off: offsets are committed by the consumption
    /// loop once a record has been handled or routed.
    pub fn build_consumer_config(&self) -> rdkafka::ClientConfig {
        self.build_consumer_config_for_group(&self.group_id)
    }

    /// Consumer configuration with an explicit group id
    pub fn build_consumer_config_for_group(&self, group_id: &str) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set(
                "max.poll.interval.ms",
                self.max_poll_interval_ms.to_string(),
            )
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("isolation.level", "read_committed");

        config
    }

    /// Build rdkafka producer configuration for retry and dead-letter publishes
    pub fn build_producer_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "30000")
            .set("compression.type", &self.compression_type);

        if self.idempotent_producer {
            config
                .set("enable.idempotence", "true")
                .set("acks", "all")
                .set("retries", "10")
                .set("max.in.flight.requests.per.connection", "5");
        } else {
            config.set("acks", "1");
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use crate::config::tests::test_config;

    #[test]
    fn test_consumer_config_build() {
        let config = test_config().kafka;
        let client = config.build_consumer_config();

        assert_eq!(
            client.get("bootstrap.servers"),
            Some("broker1:9092, broker2:9092, broker3:9092")
        );
        assert_eq!(client.get("group.id"), Some("group-1"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_producer_config_build() {
        let mut config = test_config().kafka;
        let client = config.build_producer_config();
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("enable.idempotence"), Some("true"));

        config.idempotent_producer = false;
        let client = config.build_producer_config();
        assert_eq!(client.get("acks"), Some("1"));
        assert_eq!(client.get("enable.idempotence"), None);
    }
}
