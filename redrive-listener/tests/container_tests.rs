//! Integration tests for the listener container against the in-memory broker

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use redrive_broker::{MemoryBroker, OffsetReset, RecordProducer};
use redrive_common::record::{OutboundRecord, Record, TopicPartition};
use redrive_listener::{
    AckMode, Acknowledgment, AckingRecordListener, ContainerEvent, ContainerProperties,
    ContainerState, ListenerContainer, ListenerError, ListenerKind, RecordListener,
};

#[derive(Default)]
struct RecordingListener {
    seen: Mutex<Vec<Record>>,
}

impl RecordingListener {
    fn values(&self) -> Vec<Vec<u8>> {
        self.seen.lock().iter().map(|record| record.value.clone()).collect()
    }
}

#[async_trait]
impl RecordListener for RecordingListener {
    async fn on_record(&self, record: &Record) -> Result<(), ListenerError> {
        self.seen.lock().push(record.clone());
        Ok(())
    }
}

struct AckingRecordingListener {
    seen: Mutex<Vec<Record>>,
}

#[async_trait]
impl AckingRecordListener for AckingRecordingListener {
    async fn on_record(
        &self,
        record: &Record,
        ack: Option<Acknowledgment>,
    ) -> Result<(), ListenerError> {
        self.seen.lock().push(record.clone());
        if let Some(ack) = ack {
            ack.acknowledge().map_err(ListenerError::new)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("processing failed")]
struct ProcessingFailed;

struct FailingListener;

#[async_trait]
impl RecordListener for FailingListener {
    async fn on_record(&self, _record: &Record) -> Result<(), ListenerError> {
        Err(ListenerError::new(ProcessingFailed))
    }
}

fn properties(group: &str, topics: &[&str]) -> ContainerProperties {
    let mut properties = ContainerProperties::new(
        group,
        topics.iter().map(ToString::to_string).collect(),
    );
    properties.poll_timeout_ms = 50;
    properties
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

#[tokio::test]
async fn test_batch_ack_commits_highest_plus_one_per_partition() {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 2);
    let producer = broker.producer();
    for (partition, value) in [(0, "a"), (0, "b"), (1, "c")] {
        let mut record = OutboundRecord::new("orders", value.as_bytes());
        record.partition = Some(partition);
        producer.send(record).await.unwrap();
    }

    let listener = Arc::new(RecordingListener::default());
    let mut container = ListenerContainer::new(
        properties("group", &["orders"]),
        ListenerKind::Record(Arc::clone(&listener) as Arc<dyn RecordListener>),
    );
    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();

    let p0 = TopicPartition::new("orders", 0);
    let p1 = TopicPartition::new("orders", 1);
    assert!(
        wait_until(
            || {
                broker.committed("group", &p0) == Some(2)
                    && broker.committed("group", &p1) == Some(1)
            },
            Duration::from_secs(5)
        )
        .await,
        "expected committed offsets 2 and 1, got {:?} and {:?}",
        broker.committed("group", &p0),
        broker.committed("group", &p1),
    );
    assert_eq!(listener.seen.lock().len(), 3);

    container.stop().await;
    assert_eq!(container.state(), ContainerState::Stopped);
}

#[tokio::test]
async fn test_record_ack_mode_commits_after_every_record() {
    let broker = MemoryBroker::new();
    let producer = broker.producer();
    producer
        .send(OutboundRecord::new("orders", b"one".as_slice()))
        .await
        .unwrap();

    let listener = Arc::new(RecordingListener::default());
    let mut props = properties("group", &["orders"]);
    props.ack_mode = AckMode::Record;
    let mut container = ListenerContainer::new(
        props,
        ListenerKind::Record(Arc::clone(&listener) as Arc<dyn RecordListener>),
    );
    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();

    let partition = TopicPartition::new("orders", 0);
    assert!(
        wait_until(
            || broker.committed("group", &partition) == Some(1),
            Duration::from_secs(5)
        )
        .await
    );
    container.stop().await;
}

#[tokio::test]
async fn test_manual_immediate_commits_on_listener_ack() {
    let broker = MemoryBroker::new();
    let producer = broker.producer();
    producer
        .send(OutboundRecord::new("orders", b"one".as_slice()))
        .await
        .unwrap();

    let listener = Arc::new(AckingRecordingListener {
        seen: Mutex::new(Vec::new()),
    });
    let mut props = properties("group", &["orders"]);
    props.ack_mode = AckMode::ManualImmediate;
    let mut container = ListenerContainer::new(
        props,
        ListenerKind::AckingRecord(Arc::clone(&listener) as Arc<dyn AckingRecordListener>),
    );
    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();

    let partition = TopicPartition::new("orders", 0);
    assert!(
        wait_until(
            || broker.committed("group", &partition) == Some(1),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(listener.seen.lock().len(), 1);
    container.stop().await;
}

#[tokio::test]
async fn test_missing_offset_with_no_reset_policy_is_fatal() {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 1);

    let listener = Arc::new(RecordingListener::default());
    let mut container = ListenerContainer::new(
        properties("group", &["orders"]),
        ListenerKind::Record(Arc::clone(&listener) as Arc<dyn RecordListener>),
    );
    let mut events = container.events();
    container
        .start(Box::new(
            broker.consumer_with_reset("group", OffsetReset::None),
        ))
        .unwrap();

    assert!(wait_until(|| !container.is_running(), Duration::from_secs(5)).await);
    assert_eq!(container.state(), ContainerState::Stopped);
    assert!(listener.seen.lock().is_empty());

    // The stop is announced
    let mut saw_stop = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ContainerEvent::Stopped { .. }) {
            saw_stop = true;
        }
    }
    assert!(saw_stop);
}

#[tokio::test]
async fn test_idle_event_is_published() {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 1);

    let listener = Arc::new(RecordingListener::default());
    let mut props = properties("group", &["orders"]);
    props.idle_event_interval_ms = Some(100);
    let mut container = ListenerContainer::new(
        props,
        ListenerKind::Record(Arc::clone(&listener) as Arc<dyn RecordListener>),
    );
    let mut events = container.events();
    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();

    let idle = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ContainerEvent::Idle { .. }) = events.recv().await.map_err(|_| ()) {
                return true;
            }
        }
    })
    .await;
    assert!(matches!(idle, Ok(true)), "expected an idle event");
    container.stop().await;
}

#[tokio::test]
async fn test_handled_error_with_ack_on_error_still_advances() {
    let broker = MemoryBroker::new();
    let producer = broker.producer();
    producer
        .send(OutboundRecord::new("orders", b"bad".as_slice()))
        .await
        .unwrap();
    producer
        .send(OutboundRecord::new("orders", b"good".as_slice()))
        .await
        .unwrap();

    let mut props = properties("group", &["orders"]);
    props.ack_on_error = true;
    let mut container = ListenerContainer::new(
        props,
        ListenerKind::Record(Arc::new(FailingListener) as Arc<dyn RecordListener>),
    );
    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();

    // Both records fail, the logging handler consumes the failures, and
    // ack-on-error commits their offsets anyway.
    let partition = TopicPartition::new("orders", 0);
    assert!(
        wait_until(
            || broker.committed("group", &partition) == Some(2),
            Duration::from_secs(5)
        )
        .await
    );
    container.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_wakes_poll() {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 1);

    let listener = Arc::new(RecordingListener::default());
    let mut props = properties("group", &["orders"]);
    // A long poll proves stop interrupts it instead of waiting it out
    props.poll_timeout_ms = 30_000;
    let mut container = ListenerContainer::new(
        props,
        ListenerKind::Record(Arc::clone(&listener) as Arc<dyn RecordListener>),
    );
    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();
    assert!(container.is_running());

    let stopped = tokio::time::timeout(Duration::from_secs(5), container.stop()).await;
    assert!(stopped.is_ok(), "stop should interrupt the blocked poll");
    assert!(!container.is_running());

    // Second stop is a no-op
    container.stop().await;
    assert_eq!(container.state(), ContainerState::Stopped);

    let _ = listener.values();
}

#[tokio::test]
async fn test_restart_after_stop() {
    let broker = MemoryBroker::new();
    let producer = broker.producer();

    let listener = Arc::new(RecordingListener::default());
    let mut container = ListenerContainer::new(
        properties("group", &["orders"]),
        ListenerKind::Record(Arc::clone(&listener) as Arc<dyn RecordListener>),
    );

    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();
    producer
        .send(OutboundRecord::new("orders", b"first".as_slice()))
        .await
        .unwrap();
    assert!(wait_until(|| listener.seen.lock().len() == 1, Duration::from_secs(5)).await);
    container.stop().await;

    // A fresh consumer resumes from the committed offset
    container
        .start(Box::new(broker.consumer("group")))
        .unwrap();
    producer
        .send(OutboundRecord::new("orders", b"second".as_slice()))
        .await
        .unwrap();
    assert!(wait_until(|| listener.seen.lock().len() == 2, Duration::from_secs(5)).await);
    assert_eq!(listener.values(), vec![b"first".to_vec(), b"second".to_vec()]);
    container.stop().await;
}
