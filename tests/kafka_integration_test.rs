//! Integration tests for the Kafka broker client

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

use retryforge::config::{Config, KafkaConfig, ProcessingConfig, RetryConfig, ServerConfig};
use retryforge::consumer::{ConsumptionLoop, LoopSettings, NoopObserver, ParseFailurePolicy};
use retryforge::retry::{
    InMemoryAttemptTracker, RetryPolicy, RetryRouter, RetryTopicStrategy, RetryTopology,
};
use retryforge::test_utils::ScriptedHandler;
use retryforge::{BrokerDeadLetterSink, DeadLetterListener, KafkaBroker};
use uuid::Uuid;

/// Test Kafka broker address
const TEST_KAFKA_BROKER: &str = "localhost:9092";

/// Create test topics for integration testing
async fn create_test_topics(topics: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let admin: AdminClient<DefaultClientContext> =
        ClientConfig::new().set("bootstrap.servers", TEST_KAFKA_BROKER).create()?;

    let new_topics: Vec<NewTopic<'_>> = topics
        .iter()
        .map(|t| NewTopic::new(t, 1, TopicReplication::Fixed(1)))
        .collect();

    let results = admin.create_topics(&new_topics, &AdminOptions::new()).await?;

    for result in results {
        match result {
            Ok(topic) => println!("Created topic: {}", topic),
            Err((topic, err)) => {
                // Ignore if topic already exists
                if !err.to_string().contains("already exists") {
                    return Err(format!("Failed to create topic {}: {}", topic, err).into());
                }
            },
        }
    }

    Ok(())
}

/// Send a raw message to Kafka
async fn send_test_message(topic: &str, payload: &str) -> Result<(), Box<dyn std::error::Error>> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", TEST_KAFKA_BROKER)
        .set("message.timeout.ms", "5000")
        .create()?;

    let record = FutureRecord::to(topic).payload(payload).key("test-key");

    producer
        .send(record, Timeout::After(Duration::from_secs(5)))
        .await
        .map_err(|(err, _)| err)?;

    Ok(())
}

/// Configuration for one test, built in place so parallel tests never share
/// process environment
fn test_config(topic: &str) -> Config {
    Config {
        server: ServerConfig {
            log_level: "debug".to_string(),
            environment: "test".to_string(),
            shutdown_timeout_secs: 5,
        },
        kafka: KafkaConfig {
            brokers: TEST_KAFKA_BROKER.to_string(),
            group_id: format!("retryforge-test-{}", Uuid::new_v4()),
            topic: topic.to_string(),
            dlt_topic: None,
            retry_topic_suffix: "-retry".to_string(),
            retry_topic_strategy: RetryTopicStrategy::PerAttempt,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 10000,
            max_poll_interval_ms: 300000,
            poll_batch_size: 100,
            poll_timeout_ms: 200,
            idempotent_producer: true,
            compression_type: "none".to_string(),
        },
        retry: RetryConfig {
            max_attempts: 4,
            backoff_base_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 1000,
            parse_failure_policy: ParseFailurePolicy::Downgrade,
            publish_timeout_ms: 10000,
            attempt_store_path: None,
        },
        processing: ProcessingConfig {
            worker_concurrency: 4,
        },
    }
}

#[tokio::test]
async fn test_kafka_broker_creation() {
    // Creating clients does not contact the cluster
    let config = test_config("retryforge-creation");
    let topics = vec!["retryforge-creation".to_string()];

    let broker = KafkaBroker::new(&config.kafka, &topics).expect("Failed to create broker");

    broker
        .subscribe(
            &config.kafka,
            &config.kafka.dead_letter_group_id(),
            &["retryforge-creation-dlt".to_string()],
        )
        .expect("Failed to create second consumer");
    assert!(config.validate().is_ok());
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_failing_message_reaches_dead_letter_topic() {
    let topic = format!("retryforge-it-{}", Uuid::new_v4());
    let config = test_config(&topic);

    let policy = RetryPolicy::new(
        4,
        Duration::from_millis(100),
        2.0,
        Duration::from_secs(1),
    )
    .unwrap();
    let topology = RetryTopology::with_defaults(topic.clone());
    let mut all_topics = topology.consumed_topics(&policy);
    all_topics.push(topology.dead_letter_topic().to_string());
    create_test_topics(&all_topics).await.expect("Failed to create topics");

    send_test_message(&topic, "not-a-customer").await.expect("Failed to send message");

    let broker = KafkaBroker::new(&config.kafka, &topology.consumed_topics(&policy))
        .expect("Failed to create broker");
    let dlt_topic = topology.dead_letter_topic().to_string();
    let dlt_broker = broker
        .subscribe(
            &config.kafka,
            &config.kafka.dead_letter_group_id(),
            &[dlt_topic.clone()],
        )
        .expect("Failed to create dead letter consumer");

    let handler = ScriptedHandler::always_failing();
    let router = Arc::new(RetryRouter::new(
        policy,
        topology,
        Arc::new(InMemoryAttemptTracker::new()),
    ));
    let sink = Arc::new(BrokerDeadLetterSink::new(Arc::new(broker.clone()), dlt_topic.clone()));
    let consumer = ConsumptionLoop::new(
        Arc::new(broker),
        Arc::new(handler.clone()),
        router,
        sink,
        LoopSettings::default(),
    )
    .with_observer(Arc::new(NoopObserver));

    // Main topic plus three retry hops
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while consumer.stats().dead_lettered == 0 && tokio::time::Instant::now() < deadline {
        consumer.poll_once().await.expect("poll failed");
    }
    assert_eq!(consumer.stats().dead_lettered, 1);
    assert_eq!(handler.calls(), 4);

    let listener = DeadLetterListener::new(Arc::new(dlt_broker), dlt_topic);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let mut reports = Vec::new();
    while reports.is_empty() && tokio::time::Instant::now() < deadline {
        reports = listener.poll_once().await.expect("dead letter poll failed");
    }

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].original_topic, topic);
    assert_eq!(reports[0].attempts, 4);
    assert!(reports[0].has_exception);
    assert!(reports[0].customer.is_none());
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_handled_message_is_committed() {
    let topic = format!("retryforge-ok-{}", Uuid::new_v4());
    let config = test_config(&topic);
    let policy = config.retry.policy().unwrap();
    let topology = config.topology();
    create_test_topics(&topology.consumed_topics(&policy))
        .await
        .expect("Failed to create topics");

    send_test_message(&topic, r#"{"id":"1","name":"Alice","email":"alice@example.com"}"#)
        .await
        .expect("Failed to send message");

    let broker = KafkaBroker::new(&config.kafka, &topology.consumed_topics(&policy))
        .expect("Failed to create broker");
    let handler = ScriptedHandler::succeeding();
    let router = Arc::new(RetryRouter::new(
        policy,
        topology,
        Arc::new(InMemoryAttemptTracker::new()),
    ));
    let sink = Arc::new(BrokerDeadLetterSink::new(
        Arc::new(broker.clone()),
        config.kafka.dead_letter_topic(),
    ));
    let consumer = ConsumptionLoop::new(
        Arc::new(broker),
        Arc::new(handler.clone()),
        router,
        sink,
        LoopSettings::from_config(&config),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while consumer.stats().committed == 0 && tokio::time::Instant::now() < deadline {
        consumer.poll_once().await.expect("poll failed");
    }

    assert_eq!(consumer.stats().committed, 1);
    assert_eq!(handler.calls(), 1);
    assert!(handler.seen()[0].payload_lossy().contains("Alice"));
}
