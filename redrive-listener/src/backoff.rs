//! Consumer backoff: the redeliver-later gate.
//!
//! The manager never sleeps. When a record arrives before its scheduled
//! time it raises [`BackoffSignal`], and the caller must neither acknowledge
//! nor advance the offset; seeking the partition back makes the broker
//! redeliver the record on a later poll, each cycle bounded by the poll
//! timeout.

use std::sync::Arc;

use redrive_common::{
    clock::{Clock, SystemClock},
    record::TopicPartition,
};
use thiserror::Error;

/// The backoff-not-due control signal.
///
/// Not a true error: layers between the listener and the container must pass
/// it through unmodified so the record is redelivered instead of
/// dead-lettered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("record on {partition} for listener {listener_id} not due until {due_timestamp}")]
pub struct BackoffSignal {
    pub due_timestamp: i64,
    pub listener_id: String,
    pub partition: TopicPartition,
}

/// Scope of one backoff decision.
#[derive(Debug, Clone)]
pub struct BackoffContext {
    pub due_timestamp: i64,
    pub listener_id: String,
    pub partition: TopicPartition,
}

#[derive(Debug)]
pub struct ConsumerBackoffManager {
    clock: Arc<dyn Clock>,
}

impl Default for ConsumerBackoffManager {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ConsumerBackoffManager {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    #[must_use]
    pub fn create_context(
        &self,
        due_timestamp: i64,
        listener_id: &str,
        partition: TopicPartition,
    ) -> BackoffContext {
        BackoffContext {
            due_timestamp,
            listener_id: listener_id.to_string(),
            partition,
        }
    }

    /// Let the record through if due, raise the signal otherwise.
    ///
    /// # Errors
    /// [`BackoffSignal`] when the current time is before the context's due
    /// timestamp.
    pub fn maybe_backoff(&self, context: &BackoffContext) -> Result<(), BackoffSignal> {
        let now = self.clock.now_millis();
        if now < context.due_timestamp {
            tracing::trace!(
                partition = %context.partition,
                due_in_ms = context.due_timestamp - now,
                "Record not yet due, backing off"
            );
            return Err(BackoffSignal {
                due_timestamp: context.due_timestamp,
                listener_id: context.listener_id.clone(),
                partition: context.partition.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use redrive_common::clock::TestClock;

    use super::*;

    #[test]
    fn test_due_record_passes() {
        let clock = Arc::new(TestClock::starting_at(10_000));
        let manager = ConsumerBackoffManager::new(clock);
        let context =
            manager.create_context(9_000, "listener-1", TopicPartition::new("orders", 0));

        assert_eq!(manager.maybe_backoff(&context), Ok(()));
    }

    #[test]
    fn test_exactly_due_record_passes() {
        let clock = Arc::new(TestClock::starting_at(10_000));
        let manager = ConsumerBackoffManager::new(clock);
        let context =
            manager.create_context(10_000, "listener-1", TopicPartition::new("orders", 0));

        assert_eq!(manager.maybe_backoff(&context), Ok(()));
    }

    #[test]
    fn test_early_record_raises_signal() {
        let clock = Arc::new(TestClock::starting_at(10_000));
        let manager = ConsumerBackoffManager::new(Arc::clone(&clock) as Arc<dyn Clock>);
        let context =
            manager.create_context(12_000, "listener-1", TopicPartition::new("orders", 0));

        let signal = manager.maybe_backoff(&context).unwrap_err();
        assert_eq!(signal.due_timestamp, 12_000);
        assert_eq!(signal.partition, TopicPartition::new("orders", 0));

        // Becomes due once the clock catches up
        clock.advance(2_000);
        assert_eq!(manager.maybe_backoff(&context), Ok(()));
    }
}
