//! End-to-end retry-topic flows over the in-memory broker:
//! configuration, chain registration, backoff gating, dead-lettering.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use redrive::{
    broker::{MemoryBroker, RecordProducer},
    common::{
        headers::{ATTEMPTS, BACKOFF_TIMESTAMP, decode_header_value, encode_header_value},
        record::{OutboundRecord, Record, TopicPartition},
    },
    listener::{
        Acknowledgment, AckingRecordListener, ConsumerBackoffManager, ContainerProperties,
        ListenerContainer, ListenerContainerFactory, ListenerError, ListenerKind,
        RetryTopicConfigurer,
    },
    topics::{DestinationTopicResolver, RetryConfig},
};

#[derive(Debug, thiserror::Error)]
#[error("invalid order payload")]
struct InvalidOrder;

/// Fails every record it sees.
struct AlwaysFailing;

#[async_trait]
impl AckingRecordListener for AlwaysFailing {
    async fn on_record(
        &self,
        _record: &Record,
        _ack: Option<Acknowledgment>,
    ) -> Result<(), ListenerError> {
        Err(ListenerError::new(InvalidOrder))
    }
}

/// Records everything; the backoff adapter handles acknowledgment.
#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<Record>>,
}

#[async_trait]
impl AckingRecordListener for Recording {
    async fn on_record(
        &self,
        record: &Record,
        _ack: Option<Acknowledgment>,
    ) -> Result<(), ListenerError> {
        self.seen.lock().push(record.clone());
        Ok(())
    }
}

struct Pipeline {
    broker: MemoryBroker,
    configurer: RetryTopicConfigurer,
    factory: ListenerContainerFactory,
    containers: Vec<ListenerContainer>,
}

impl Pipeline {
    /// Register `config`'s chain for `topic` and prepare a decorated
    /// container factory against `broker`.
    fn new(broker: MemoryBroker, config: &RetryConfig, topic: &str) -> Self {
        let configurer = RetryTopicConfigurer::new(
            Arc::new(DestinationTopicResolver::default()),
            Arc::new(ConsumerBackoffManager::default()),
        );
        let specs = configurer
            .process_configuration(config, &[topic.to_string()])
            .unwrap();
        for spec in &specs {
            broker.create_topic(&spec.name, spec.partitions);
        }

        let mut template = ContainerProperties::new("group", Vec::new());
        template.poll_timeout_ms = 50;
        let mut factory = ListenerContainerFactory::new(template);
        configurer.decorate_factory(&mut factory);

        Self {
            broker,
            configurer,
            factory,
            containers: Vec::new(),
        }
    }

    fn listen(&mut self, topic: &str, listener: Arc<dyn AckingRecordListener>) {
        let wrapped = self
            .configurer
            .wrap_listener(listener, &format!("{topic}-listener"));
        let mut container = self
            .factory
            .create_container(vec![topic.to_string()], ListenerKind::AckingRecord(wrapped));
        container
            .start(Box::new(self.broker.consumer("group")))
            .unwrap();
        self.containers.push(container);
    }

    async fn shutdown(mut self) {
        for container in &mut self.containers {
            container.stop().await;
        }
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn attempts_on(broker: &MemoryBroker, topic: &str) -> Option<i64> {
    broker
        .records_on(topic, 0)
        .first()
        .and_then(|record| record.headers.last(ATTEMPTS).and_then(decode_header_value))
}

#[tokio::test]
async fn test_failing_record_walks_the_whole_chain_to_dlt() {
    let broker = MemoryBroker::new();
    let producer: Arc<dyn RecordProducer> = Arc::new(broker.producer());
    let config = RetryConfig::builder()
        .max_attempts(3)
        .unwrap()
        .exponential_backoff(100, 2.0, 10_000)
        .unwrap()
        .build(producer);

    let mut pipeline = Pipeline::new(broker, &config, "orders");
    let dlt_listener = Arc::new(Recording::default());
    pipeline.listen("orders", Arc::new(AlwaysFailing));
    pipeline.listen("orders-retry-0", Arc::new(AlwaysFailing));
    pipeline.listen("orders-retry-1", Arc::new(AlwaysFailing));
    pipeline.listen(
        "orders-dlt",
        Arc::clone(&dlt_listener) as Arc<dyn AckingRecordListener>,
    );

    pipeline
        .broker
        .producer()
        .send(OutboundRecord::new("orders", b"boom".as_slice()))
        .await
        .unwrap();

    let broker = pipeline.broker.clone();
    assert!(
        wait_until(
            || !broker.records_on("orders-dlt", 0).is_empty(),
            Duration::from_secs(10)
        )
        .await,
        "record never reached the dead-letter topic"
    );

    // Attempt counts stamped at each hop's arrival: the header read at each
    // failure is 1 (orders), 2 (retry-0), 3 (retry-1)
    assert_eq!(attempts_on(&broker, "orders-retry-0"), Some(2));
    assert_eq!(attempts_on(&broker, "orders-retry-1"), Some(3));
    assert_eq!(attempts_on(&broker, "orders-dlt"), Some(4));

    // Backoff timestamps ride along on every retry hop
    let retry_record = &broker.records_on("orders-retry-0", 0)[0];
    assert!(retry_record.headers.last(BACKOFF_TIMESTAMP).is_some());

    // The DLT listener saw the original payload
    assert!(
        wait_until(|| !dlt_listener.seen.lock().is_empty(), Duration::from_secs(5)).await
    );
    assert_eq!(dlt_listener.seen.lock()[0].value, b"boom");

    // The source offset was committed once its record was routed onward
    assert!(
        wait_until(
            || broker.committed("group", &TopicPartition::new("orders", 0)) == Some(1),
            Duration::from_secs(5)
        )
        .await
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_non_retryable_failure_skips_retries_entirely() {
    let broker = MemoryBroker::new();
    let producer: Arc<dyn RecordProducer> = Arc::new(broker.producer());
    let config = RetryConfig::builder()
        .max_attempts(3)
        .unwrap()
        .fixed_backoff(100)
        .unwrap()
        .not_retry_on::<InvalidOrder>()
        .build(producer);

    let mut pipeline = Pipeline::new(broker, &config, "payments");
    let dlt_listener = Arc::new(Recording::default());
    pipeline.listen("payments", Arc::new(AlwaysFailing));
    pipeline.listen(
        "payments-dlt",
        Arc::clone(&dlt_listener) as Arc<dyn AckingRecordListener>,
    );

    pipeline
        .broker
        .producer()
        .send(OutboundRecord::new("payments", b"poison".as_slice()))
        .await
        .unwrap();

    let broker = pipeline.broker.clone();
    assert!(
        wait_until(
            || !broker.records_on("payments-dlt", 0).is_empty(),
            Duration::from_secs(10)
        )
        .await,
        "non-retryable record never reached the dead-letter topic"
    );
    assert!(broker.records_on("payments-retry-0", 0).is_empty());
    assert!(broker.records_on("payments-retry-1", 0).is_empty());
    assert_eq!(attempts_on(&broker, "payments-dlt"), Some(2));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_record_before_its_backoff_time_is_neither_processed_nor_committed() {
    let broker = MemoryBroker::new();
    let producer: Arc<dyn RecordProducer> = Arc::new(broker.producer());
    let config = RetryConfig::builder()
        .max_attempts(3)
        .unwrap()
        .fixed_backoff(100)
        .unwrap()
        .build(producer);

    let mut pipeline = Pipeline::new(broker, &config, "orders");
    let retry_listener = Arc::new(Recording::default());
    pipeline.listen(
        "orders-retry-0",
        Arc::clone(&retry_listener) as Arc<dyn AckingRecordListener>,
    );

    // A record redelivered an hour before it is due
    let far_future = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
        + 3_600_000;
    let mut record = OutboundRecord::new("orders-retry-0", b"early".as_slice());
    record.headers.push(ATTEMPTS, encode_header_value(2));
    record
        .headers
        .push(BACKOFF_TIMESTAMP, encode_header_value(far_future));
    pipeline.broker.producer().send(record).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let broker = pipeline.broker.clone();
    // Never dispatched to the listener, never routed onward
    assert!(retry_listener.seen.lock().is_empty());
    assert!(broker.records_on("orders-retry-1", 0).is_empty());
    assert!(broker.records_on("orders-dlt", 0).is_empty());
    // And the offset was not advanced past the record
    let committed = broker.committed("group", &TopicPartition::new("orders-retry-0", 0));
    assert_ne!(committed, Some(1), "backed-off record must not be committed");

    pipeline.shutdown().await;
}
