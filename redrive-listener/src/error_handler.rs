//! Failure handling between the listener and the poll loop.
//!
//! A handler either consumes the failure so the loop moves on, or arranges
//! redelivery by seeking the failed record (and everything after it) back to
//! its own offset. The dead-letter handler does the former via the
//! recoverer, falling back to the latter for backoff signals and publish
//! failures.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use redrive_common::record::{Record, TopicPartition};

use crate::{
    listener::ListenerError,
    offsets::OffsetLedger,
    recoverer::{DeadLetterPublishingRecoverer, RecoveryError},
    seeks::{SeekRequest, SeekTarget},
};

/// What the container should do after the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Failure consumed; continue with the next record.
    Handled,
    /// Redelivery arranged; skip the rest of this poll's records.
    Retried,
}

/// Offset and seek capabilities the container lends to a handler for the
/// duration of one call.
pub struct ContainerOps<'a> {
    ledger: &'a mut OffsetLedger,
    seeks: &'a mut Vec<SeekRequest>,
}

impl<'a> ContainerOps<'a> {
    pub(crate) fn new(ledger: &'a mut OffsetLedger, seeks: &'a mut Vec<SeekRequest>) -> Self {
        Self { ledger, seeks }
    }

    /// Mark `record` as processed so its offset is committed.
    pub fn ack(&mut self, record: &Record) {
        self.ledger.add_record(record);
    }

    /// Queue a seek applied before the next poll.
    pub fn seek(&mut self, partition: TopicPartition, offset: i64) {
        self.seeks.push(SeekRequest {
            partition,
            target: SeekTarget::Offset(offset),
        });
    }

    /// Seek the failed record and every unprocessed successor back to their
    /// own offsets, so the next poll redelivers them in order.
    pub fn seek_to_current(&mut self, failed: &Record, remaining: &[Record]) {
        let mut targets: HashMap<TopicPartition, i64> = HashMap::new();
        targets.insert(failed.topic_partition(), failed.offset);
        for record in remaining {
            let entry = targets
                .entry(record.topic_partition())
                .or_insert(record.offset);
            if record.offset < *entry {
                *entry = record.offset;
            }
        }
        for (partition, offset) in targets {
            self.seek(partition, offset);
        }
    }
}

#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(
        &self,
        error: &ListenerError,
        record: &Record,
        remaining: &[Record],
        ops: &mut ContainerOps<'_>,
    ) -> HandleOutcome;

    /// Batch-level failure. The default consumes the failure; the container
    /// then commits the batch's highest offsets.
    async fn handle_batch(
        &self,
        error: &ListenerError,
        records: &[Record],
        ops: &mut ContainerOps<'_>,
    ) -> HandleOutcome {
        let _ = (records, ops);
        tracing::error!(error = %error, "Batch listener failed");
        HandleOutcome::Handled
    }
}

/// Default handler: log with full record context and move on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle(
        &self,
        error: &ListenerError,
        record: &Record,
        _remaining: &[Record],
        _ops: &mut ContainerOps<'_>,
    ) -> HandleOutcome {
        tracing::error!(record = %record, error = %error, "Listener failed");
        HandleOutcome::Handled
    }
}

/// Retry-topic handler: route the failure through the dead-letter
/// publishing recoverer and commit the original offset once routing
/// succeeded.
pub struct DeadLetterErrorHandler {
    recoverer: Arc<DeadLetterPublishingRecoverer>,
    commit_recovered: bool,
}

impl DeadLetterErrorHandler {
    #[must_use]
    pub fn new(recoverer: Arc<DeadLetterPublishingRecoverer>) -> Self {
        Self {
            recoverer,
            commit_recovered: true,
        }
    }

    #[must_use]
    pub fn commit_recovered(mut self, commit: bool) -> Self {
        self.commit_recovered = commit;
        self
    }
}

#[async_trait]
impl ErrorHandler for DeadLetterErrorHandler {
    async fn handle(
        &self,
        error: &ListenerError,
        record: &Record,
        remaining: &[Record],
        ops: &mut ContainerOps<'_>,
    ) -> HandleOutcome {
        match self.recoverer.recover(record, error).await {
            Ok(_) => {
                // The retry is a new message; the original offset is done.
                if self.commit_recovered {
                    ops.ack(record);
                }
                HandleOutcome::Handled
            }
            Err(RecoveryError::Backoff(signal)) => {
                tracing::trace!(
                    record = %record,
                    due_timestamp = signal.due_timestamp,
                    "Not yet due, seeking back for redelivery"
                );
                ops.seek_to_current(record, remaining);
                HandleOutcome::Retried
            }
            Err(recovery_error) => {
                tracing::error!(
                    record = %record,
                    error = %recovery_error,
                    "Recovery failed, seeking back for redelivery"
                );
                ops.seek_to_current(record, remaining);
                HandleOutcome::Retried
            }
        }
    }

    async fn handle_batch(
        &self,
        error: &ListenerError,
        records: &[Record],
        ops: &mut ContainerOps<'_>,
    ) -> HandleOutcome {
        // Batch listeners are not routed through retry topics; redeliver the
        // whole batch.
        tracing::error!(error = %error, "Batch listener failed, seeking batch back");
        if let [first, rest @ ..] = records {
            ops.seek_to_current(first, rest);
        }
        HandleOutcome::Retried
    }
}
