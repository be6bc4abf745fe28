//! RetryForge - retrying Kafka consumer with a dead letter topic
//!
//! Consumes the passthrough topic and its retry topics, logs every message,
//! and reports records that exhausted their attempts from the dead letter
//! topic.

use std::sync::Arc;

use retryforge::consumer::{shutdown_signal, LoopSettings, Shutdown};
use retryforge::retry::{AttemptTracker, FileAttemptTracker, InMemoryAttemptTracker};
use retryforge::{
    logging, BrokerDeadLetterSink, Config, ConsumptionLoop, CustomerListener, DeadLetterListener,
    KafkaBroker, Result, RetryRouter, TracingObserver,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;

    // Validate configuration
    config.validate()?;

    // Initialize logging/tracing
    logging::init_tracing(&config.server)?;

    // Log configuration
    config.log_config();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting RetryForge");

    let policy = config.retry.policy()?;
    let topology = config.topology();

    let tracker: Arc<dyn AttemptTracker> = match &config.retry.attempt_store_path {
        Some(path) => Arc::new(FileAttemptTracker::open(path).await?),
        None => Arc::new(InMemoryAttemptTracker::new()),
    };

    let router = Arc::new(RetryRouter::new(policy, topology, tracker));
    let main_broker = KafkaBroker::new(&config.kafka, &router.consumed_topics())?;
    let dlt_topic = router.topology().dead_letter_topic().to_string();
    let dlt_broker = main_broker.subscribe(
        &config.kafka,
        &config.kafka.dead_letter_group_id(),
        &[dlt_topic.clone()],
    )?;

    let shutdown = Shutdown::new();

    let sink = Arc::new(BrokerDeadLetterSink::new(
        Arc::new(main_broker.clone()),
        dlt_topic.clone(),
    ));
    let consumer = ConsumptionLoop::new(
        Arc::new(main_broker),
        Arc::new(CustomerListener),
        router,
        sink,
        LoopSettings::from_config(&config),
    )
    .with_observer(Arc::new(TracingObserver))
    .with_shutdown(shutdown.clone());

    let dead_letters =
        DeadLetterListener::new(Arc::new(dlt_broker), dlt_topic).with_shutdown(shutdown.clone());

    tokio::spawn(shutdown_signal(shutdown));

    let (consumed, reported) = tokio::join!(consumer.run(), dead_letters.run());
    let stats = consumed?;
    let reported = reported?;

    tracing::info!(
        committed = stats.committed,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        dead_letters_reported = reported,
        "RetryForge shutdown complete"
    );

    if stats.failed > 0 {
        tracing::warn!(
            failed = stats.failed,
            "Some records were left uncommitted and will be redelivered"
        );
    }

    Ok(())
}
