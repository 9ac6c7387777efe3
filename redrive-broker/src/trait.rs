//! Consumer and producer traits the retry layer is written against

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use redrive_common::record::{OutboundRecord, RecordMetadata, TopicPartition};

use crate::{
    error::BrokerError,
    types::{CommitMode, OffsetMap, PollOutcome},
};

/// A handle that can interrupt a blocked poll from any thread.
///
/// This is the only broker operation foreign threads may touch; everything
/// else belongs to the single task that owns the consumer.
pub trait ConsumerWaker: Send + Sync {
    fn wake(&self);
}

/// The consumer side of the broker seam.
///
/// Implementations are not thread-safe by contract: one task owns the handle
/// and drives every call, with [`ConsumerWaker`] as the sole cross-thread
/// escape hatch.
#[async_trait]
pub trait RecordConsumer: Send {
    /// Subscribe to `topics`; partition assignment is surfaced by later polls.
    fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Block up to `timeout` for records and rebalance notices.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Wakeup`] when interrupted,
    /// [`BrokerError::NoOffsetForPartition`] when positioning fails with no
    /// reset policy.
    async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, BrokerError>;

    /// Commit the given next-to-consume offsets.
    async fn commit(&mut self, offsets: &OffsetMap, mode: CommitMode) -> Result<(), BrokerError>;

    /// Reposition a partition so the next poll starts at `offset`.
    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<(), BrokerError>;

    fn seek_to_beginning(&mut self, partition: &TopicPartition) -> Result<(), BrokerError>;

    fn seek_to_end(&mut self, partition: &TopicPartition) -> Result<(), BrokerError>;

    /// The offset of the next record that will be fetched for `partition`.
    fn position(&mut self, partition: &TopicPartition) -> Result<i64, BrokerError>;

    /// Partitions currently assigned to this consumer.
    fn assignment(&self) -> Vec<TopicPartition>;

    /// A thread-safe handle that unblocks a pending poll.
    fn waker(&self) -> Arc<dyn ConsumerWaker>;
}

/// The producer side of the broker seam.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Produce a record, resolving once the broker assigned it a position.
    async fn send(&self, record: OutboundRecord) -> Result<RecordMetadata, BrokerError>;
}

/// A producer that supports read-process-write transactions.
///
/// Records sent between `begin_transaction` and `commit_transaction` become
/// visible atomically together with the offsets handed to
/// `send_offsets_to_transaction`; `abort_transaction` discards both.
#[async_trait]
pub trait TransactionalProducer: RecordProducer {
    async fn begin_transaction(&self) -> Result<(), BrokerError>;

    /// Attach consumer offsets to the open transaction on behalf of `group`.
    async fn send_offsets_to_transaction(
        &self,
        offsets: &OffsetMap,
        group: &str,
    ) -> Result<(), BrokerError>;

    async fn commit_transaction(&self) -> Result<(), BrokerError>;

    async fn abort_transaction(&self) -> Result<(), BrokerError>;
}
