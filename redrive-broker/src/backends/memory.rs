//! In-memory broker backend.
//!
//! A partitioned append-only log with per-group committed offsets, primarily
//! intended for tests, but usable for transient in-process pipelines. Topics
//! are auto-created on first send unless created explicitly with a partition
//! count.
//!
//! # Concurrency
//! Shared state sits behind a single `RwLock`; producers notify waiting
//! consumers through a `Notify` so polls block without spinning. Each
//! consumer tracks its own fetch positions and is single-task by contract,
//! with the wake handle as the only cross-thread entry point.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redrive_common::{
    clock::{Clock, SystemClock},
    record::{Headers, OutboundRecord, Record, RecordMetadata, TopicPartition},
};
use tokio::sync::Notify;

use crate::{
    error::BrokerError,
    r#trait::{ConsumerWaker, RecordConsumer, RecordProducer, TransactionalProducer},
    types::{CommitMode, OffsetMap, OffsetReset, PollOutcome},
};

const DEFAULT_MAX_POLL_RECORDS: usize = 500;

#[derive(Debug, Clone)]
struct StoredRecord {
    timestamp: i64,
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    headers: Headers,
}

#[derive(Debug, Default)]
struct State {
    /// topic -> partition index -> append log
    topics: AHashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, partition) -> next offset to consume
    committed: AHashMap<(String, TopicPartition), i64>,
}

impl State {
    fn log_end(&self, partition: &TopicPartition) -> i64 {
        self.topics
            .get(&partition.topic)
            .and_then(|partitions| partitions.get(usize::try_from(partition.partition).ok()?))
            .map_or(0, |log| i64::try_from(log.len()).unwrap_or(i64::MAX))
    }
}

#[derive(Debug)]
struct Inner {
    state: RwLock<State>,
    appended: Notify,
    auto_create_partitions: i32,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn append(&self, record: OutboundRecord) -> Result<RecordMetadata, BrokerError> {
        let metadata = {
            let mut state = self.state.write();
            let partition_count = {
                let partitions = state.topics.entry(record.topic.clone()).or_insert_with(|| {
                    let count = usize::try_from(self.auto_create_partitions).unwrap_or(1).max(1);
                    vec![Vec::new(); count]
                });
                partitions.len()
            };

            let index = match record.partition {
                Some(partition) => {
                    let index = usize::try_from(partition).map_err(|_| {
                        BrokerError::UnknownPartition(TopicPartition::new(
                            record.topic.clone(),
                            partition,
                        ))
                    })?;
                    if index >= partition_count {
                        return Err(BrokerError::UnknownPartition(TopicPartition::new(
                            record.topic.clone(),
                            partition,
                        )));
                    }
                    index
                }
                None => partition_for(record.key.as_deref(), partition_count),
            };

            let timestamp = self.clock.now_millis();
            let log = state
                .topics
                .get_mut(&record.topic)
                .and_then(|partitions| partitions.get_mut(index))
                .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;
            log.push(StoredRecord {
                timestamp,
                key: record.key,
                value: record.value,
                headers: record.headers,
            });

            RecordMetadata {
                topic: record.topic,
                partition: i32::try_from(index).unwrap_or(i32::MAX),
                offset: i64::try_from(log.len() - 1).unwrap_or(i64::MAX),
            }
        };
        self.appended.notify_waiters();
        Ok(metadata)
    }
}

/// Pick a partition by key hash, falling back to partition 0 for keyless
/// records.
fn partition_for(key: Option<&[u8]>, partition_count: usize) -> usize {
    key.map_or(0, |key| {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let count = u64::try_from(partition_count.max(1)).unwrap_or(1);
        usize::try_from(hasher.finish() % count).unwrap_or(0)
    })
}

/// Handle to an in-memory broker cluster. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker using the system clock, auto-creating single-partition topics.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A broker stamping record timestamps from the supplied clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                appended: Notify::new(),
                auto_create_partitions: 1,
                clock,
            }),
        }
    }

    /// Create `name` with an explicit partition count. Idempotent; an
    /// existing topic keeps its current partitions.
    pub fn create_topic(&self, name: &str, partitions: i32) {
        let count = usize::try_from(partitions).unwrap_or(1).max(1);
        let mut state = self.inner.state.write();
        state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); count]);
    }

    #[must_use]
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            inner: Arc::clone(&self.inner),
            transaction: Mutex::new(None),
        }
    }

    /// A consumer in `group` resetting to the earliest offset when no commit
    /// exists.
    #[must_use]
    pub fn consumer(&self, group: &str) -> MemoryConsumer {
        self.consumer_with_reset(group, OffsetReset::Earliest)
    }

    #[must_use]
    pub fn consumer_with_reset(&self, group: &str, reset: OffsetReset) -> MemoryConsumer {
        MemoryConsumer {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            reset,
            subscriptions: Vec::new(),
            positions: AHashMap::new(),
            injected_revocations: Vec::new(),
            injected_assignments: Vec::new(),
            wake: Arc::new(WakeHandle::default()),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
        }
    }

    #[must_use]
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.inner.state.read().topics.get(topic).map(Vec::len)
    }

    /// Snapshot of every record on a partition, positioned as a consumer
    /// would see it. Test/inspection surface.
    #[must_use]
    pub fn records_on(&self, topic: &str, partition: i32) -> Vec<Record> {
        let state = self.inner.state.read();
        let Ok(index) = usize::try_from(partition) else {
            return Vec::new();
        };
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(index))
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, stored)| Record {
                        topic: topic.to_string(),
                        partition,
                        offset: i64::try_from(offset).unwrap_or(i64::MAX),
                        timestamp: stored.timestamp,
                        key: stored.key.clone(),
                        value: stored.value.clone(),
                        headers: stored.headers.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The committed next-to-consume offset for a group, if any.
    #[must_use]
    pub fn committed(&self, group: &str, partition: &TopicPartition) -> Option<i64> {
        self.inner
            .state
            .read()
            .committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }

    /// The offset one past the last record on a partition.
    #[must_use]
    pub fn end_offset(&self, partition: &TopicPartition) -> i64 {
        self.inner.state.read().log_end(partition)
    }
}

#[derive(Debug, Default)]
struct TransactionBuffer {
    records: Vec<OutboundRecord>,
    offsets: Vec<(String, OffsetMap)>,
}

/// Producer handle for a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryProducer {
    inner: Arc<Inner>,
    transaction: Mutex<Option<TransactionBuffer>>,
}

#[async_trait]
impl RecordProducer for MemoryProducer {
    async fn send(&self, record: OutboundRecord) -> Result<RecordMetadata, BrokerError> {
        let mut transaction = self.transaction.lock();
        if let Some(buffer) = transaction.as_mut() {
            // Buffered until commit; the final offset is unknown until then.
            let topic = record.topic.clone();
            let partition = record.partition.unwrap_or(0);
            buffer.records.push(record);
            return Ok(RecordMetadata {
                topic,
                partition,
                offset: -1,
            });
        }
        drop(transaction);
        self.inner.append(record)
    }
}

#[async_trait]
impl TransactionalProducer for MemoryProducer {
    async fn begin_transaction(&self) -> Result<(), BrokerError> {
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(BrokerError::Transaction(
                "transaction already in progress".to_string(),
            ));
        }
        *transaction = Some(TransactionBuffer::default());
        Ok(())
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        group: &str,
    ) -> Result<(), BrokerError> {
        let mut transaction = self.transaction.lock();
        let buffer = transaction.as_mut().ok_or_else(|| {
            BrokerError::Transaction("no transaction in progress".to_string())
        })?;
        buffer.offsets.push((group.to_string(), offsets.clone()));
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), BrokerError> {
        let buffer = self
            .transaction
            .lock()
            .take()
            .ok_or_else(|| BrokerError::Transaction("no transaction in progress".to_string()))?;

        for record in buffer.records {
            self.inner.append(record)?;
        }
        {
            let mut state = self.inner.state.write();
            for (group, offsets) in buffer.offsets {
                for (partition, offset) in offsets {
                    state.committed.insert((group.clone(), partition), offset);
                }
            }
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<(), BrokerError> {
        self.transaction
            .lock()
            .take()
            .map(|_| ())
            .ok_or_else(|| BrokerError::Transaction("no transaction in progress".to_string()))
    }
}

#[derive(Debug, Default)]
struct WakeHandle {
    woken: AtomicBool,
    notify: Notify,
}

impl ConsumerWaker for WakeHandle {
    fn wake(&self) {
        self.woken.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Consumer handle for a [`MemoryBroker`].
///
/// Assignment is the full partition set of every subscribed topic; the
/// `queue_rebalance` hook lets tests simulate broker-initiated rebalances.
#[derive(Debug)]
pub struct MemoryConsumer {
    inner: Arc<Inner>,
    group: String,
    reset: OffsetReset,
    subscriptions: Vec<String>,
    positions: AHashMap<TopicPartition, i64>,
    injected_revocations: Vec<TopicPartition>,
    injected_assignments: Vec<TopicPartition>,
    wake: Arc<WakeHandle>,
    max_poll_records: usize,
}

impl MemoryConsumer {
    /// Simulate a rebalance: the next poll surfaces these notices, and
    /// revoked partitions stop being fetched.
    pub fn queue_rebalance(
        &mut self,
        revoked: Vec<TopicPartition>,
        assigned: Vec<TopicPartition>,
    ) {
        for partition in &revoked {
            self.positions.remove(partition);
        }
        self.injected_revocations.extend(revoked);
        self.injected_assignments.extend(assigned);
    }

    pub fn set_max_poll_records(&mut self, max: usize) {
        self.max_poll_records = max.max(1);
    }

    fn initial_offset(&self, partition: &TopicPartition) -> Result<i64, BrokerError> {
        let state = self.inner.state.read();
        if let Some(committed) = state
            .committed
            .get(&(self.group.clone(), partition.clone()))
        {
            return Ok(*committed);
        }
        match self.reset {
            OffsetReset::Earliest => Ok(0),
            OffsetReset::Latest => Ok(state.log_end(partition)),
            OffsetReset::None => Err(BrokerError::NoOffsetForPartition(partition.clone())),
        }
    }

    fn refresh_assignment(&mut self, outcome: &mut PollOutcome) -> Result<(), BrokerError> {
        let counts: Vec<(String, usize)> = {
            let state = self.inner.state.read();
            self.subscriptions
                .iter()
                .map(|topic| {
                    (
                        topic.clone(),
                        state.topics.get(topic).map_or(0, Vec::len),
                    )
                })
                .collect()
        };

        for (topic, count) in counts {
            for index in 0..count {
                let partition =
                    TopicPartition::new(topic.clone(), i32::try_from(index).unwrap_or(i32::MAX));
                if !self.positions.contains_key(&partition) {
                    let start = self.initial_offset(&partition)?;
                    self.positions.insert(partition.clone(), start);
                    outcome.assigned.push(partition);
                }
            }
        }
        Ok(())
    }

    fn fetch(&mut self, outcome: &mut PollOutcome) {
        let inner = Arc::clone(&self.inner);
        let state = inner.state.read();
        let mut partitions: Vec<TopicPartition> = self.positions.keys().cloned().collect();
        partitions.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.partition.cmp(&b.partition)));

        for partition in partitions {
            if outcome.records.len() >= self.max_poll_records {
                break;
            }
            let Ok(index) = usize::try_from(partition.partition) else {
                continue;
            };
            let Some(log) = state
                .topics
                .get(&partition.topic)
                .and_then(|logs| logs.get(index))
            else {
                continue;
            };

            let mut position = self.positions.get(&partition).copied().unwrap_or(0);
            loop {
                let Ok(record_index) = usize::try_from(position) else {
                    break;
                };
                if record_index >= log.len() || outcome.records.len() >= self.max_poll_records {
                    break;
                }
                let stored = &log[record_index];
                outcome.records.push(Record {
                    topic: partition.topic.clone(),
                    partition: partition.partition,
                    offset: position,
                    timestamp: stored.timestamp,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    headers: stored.headers.clone(),
                });
                position += 1;
            }
            self.positions.insert(partition, position);
        }
    }
}

#[async_trait]
impl RecordConsumer for MemoryConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        self.subscriptions = topics.to_vec();
        self.positions
            .retain(|partition, _| topics.contains(&partition.topic));
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.wake.woken.swap(false, Ordering::SeqCst) {
                return Err(BrokerError::Wakeup);
            }

            // Futures are created before reading state so an append or wake
            // racing the emptiness check is never lost. They borrow cloned
            // handles, leaving `self` free for position bookkeeping.
            let inner = Arc::clone(&self.inner);
            let wake = Arc::clone(&self.wake);
            let appended = inner.appended.notified();
            let woken = wake.notify.notified();

            let mut outcome = PollOutcome {
                revoked: std::mem::take(&mut self.injected_revocations),
                assigned: std::mem::take(&mut self.injected_assignments),
                ..PollOutcome::default()
            };
            self.refresh_assignment(&mut outcome)?;
            self.fetch(&mut outcome);

            if !outcome.is_empty() {
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(outcome);
            }
            let remaining = deadline - now;
            tokio::select! {
                () = appended => {},
                () = woken => {},
                () = tokio::time::sleep(remaining) => return Ok(PollOutcome::default()),
            }
        }
    }

    async fn commit(&mut self, offsets: &OffsetMap, mode: CommitMode) -> Result<(), BrokerError> {
        let mut state = self.inner.state.write();
        for (partition, offset) in offsets {
            state
                .committed
                .insert((self.group.clone(), partition.clone()), *offset);
        }
        drop(state);
        tracing::trace!(group = %self.group, ?mode, count = offsets.len(), "Committed offsets");
        Ok(())
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<(), BrokerError> {
        if offset < 0 {
            return Err(BrokerError::InvalidSeek {
                partition: partition.clone(),
                offset,
            });
        }
        self.positions.insert(partition.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&mut self, partition: &TopicPartition) -> Result<(), BrokerError> {
        self.positions.insert(partition.clone(), 0);
        Ok(())
    }

    fn seek_to_end(&mut self, partition: &TopicPartition) -> Result<(), BrokerError> {
        let end = self.inner.state.read().log_end(partition);
        self.positions.insert(partition.clone(), end);
        Ok(())
    }

    fn position(&mut self, partition: &TopicPartition) -> Result<i64, BrokerError> {
        if let Some(position) = self.positions.get(partition) {
            return Ok(*position);
        }
        let start = self.initial_offset(partition)?;
        self.positions.insert(partition.clone(), start);
        Ok(start)
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.positions.keys().cloned().collect()
    }

    fn waker(&self) -> Arc<dyn ConsumerWaker> {
        Arc::clone(&self.wake) as Arc<dyn ConsumerWaker>
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn outbound(topic: &str, value: &[u8]) -> OutboundRecord {
        OutboundRecord::new(topic, value)
    }

    #[tokio::test]
    async fn test_produce_consume_round_trip() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let mut consumer = broker.consumer("group");
        consumer.subscribe(&["orders".to_string()]).unwrap();

        let metadata = producer.send(outbound("orders", b"one")).await.unwrap();
        assert_eq!(metadata.offset, 0);

        let outcome = consumer.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].value, b"one");
        assert_eq!(outcome.assigned, vec![TopicPartition::new("orders", 0)]);
    }

    #[tokio::test]
    async fn test_commit_and_resume() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        producer.send(outbound("orders", b"one")).await.unwrap();
        producer.send(outbound("orders", b"two")).await.unwrap();

        let partition = TopicPartition::new("orders", 0);
        {
            let mut consumer = broker.consumer("group");
            consumer.subscribe(&["orders".to_string()]).unwrap();
            let outcome = consumer.poll(Duration::from_millis(100)).await.unwrap();
            assert_eq!(outcome.records.len(), 2);
            let offsets = OffsetMap::from([(partition.clone(), 1)]);
            consumer.commit(&offsets, CommitMode::Sync).await.unwrap();
        }
        assert_eq!(broker.committed("group", &partition), Some(1));

        // A fresh consumer in the same group resumes at the commit
        let mut consumer = broker.consumer("group");
        consumer.subscribe(&["orders".to_string()]).unwrap();
        let outcome = consumer.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].offset, 1);
        assert_eq!(outcome.records[0].value, b"two");
    }

    #[tokio::test]
    async fn test_wakeup_interrupts_poll() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("group");
        consumer.subscribe(&["orders".to_string()]).unwrap();
        let waker = consumer.waker();

        let poller = tokio::spawn(async move { consumer.poll(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waker.wake();

        let result = poller.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Wakeup)));
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        producer.send(outbound("orders", b"old")).await.unwrap();

        let mut consumer = broker.consumer_with_reset("group", OffsetReset::Latest);
        consumer.subscribe(&["orders".to_string()]).unwrap();
        let outcome = consumer.poll(Duration::from_millis(50)).await.unwrap();
        assert!(outcome.records.is_empty());

        producer.send(outbound("orders", b"new")).await.unwrap();
        let outcome = consumer.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].value, b"new");
    }

    #[tokio::test]
    async fn test_reset_none_without_commit_is_fatal() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 1);
        let mut consumer = broker.consumer_with_reset("group", OffsetReset::None);
        consumer.subscribe(&["orders".to_string()]).unwrap();

        let result = consumer.poll(Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(BrokerError::NoOffsetForPartition(partition))
                if partition == TopicPartition::new("orders", 0)
        ));
    }

    #[tokio::test]
    async fn test_seek_causes_redelivery() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        producer.send(outbound("orders", b"one")).await.unwrap();

        let mut consumer = broker.consumer("group");
        consumer.subscribe(&["orders".to_string()]).unwrap();
        let first = consumer.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.records.len(), 1);

        consumer
            .seek(&TopicPartition::new("orders", 0), 0)
            .unwrap();
        let again = consumer.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(again.records.len(), 1);
        assert_eq!(again.records[0].offset, 0);
    }

    #[tokio::test]
    async fn test_transaction_commit_publishes_records_and_offsets() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let partition = TopicPartition::new("orders", 0);

        producer.begin_transaction().await.unwrap();
        producer.send(outbound("orders", b"txn")).await.unwrap();
        let offsets = OffsetMap::from([(partition.clone(), 5)]);
        producer
            .send_offsets_to_transaction(&offsets, "group")
            .await
            .unwrap();

        // Nothing visible before commit
        assert!(broker.records_on("orders", 0).is_empty());
        assert_eq!(broker.committed("group", &partition), None);

        producer.commit_transaction().await.unwrap();
        assert_eq!(broker.records_on("orders", 0).len(), 1);
        assert_eq!(broker.committed("group", &partition), Some(5));
    }

    #[tokio::test]
    async fn test_transaction_abort_discards_everything() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();

        producer.begin_transaction().await.unwrap();
        producer.send(outbound("orders", b"txn")).await.unwrap();
        producer.abort_transaction().await.unwrap();

        assert!(broker.records_on("orders", 0).is_empty());
        // And the transaction is gone
        assert!(producer.abort_transaction().await.is_err());
    }

    #[tokio::test]
    async fn test_keyed_records_land_on_stable_partitions() {
        let broker = MemoryBroker::new();
        broker.create_topic("orders", 4);
        let producer = broker.producer();

        let mut record = outbound("orders", b"payload");
        record.key = Some(b"customer-1".to_vec());
        let first = producer.send(record.clone()).await.unwrap();
        let second = producer.send(record).await.unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }
}
