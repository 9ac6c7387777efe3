//! What happens to the unconsumed remainder of a batch after a transaction
//! rolls back.

use async_trait::async_trait;

use crate::error_handler::ContainerOps;
use redrive_common::record::Record;

/// Receives the rolled-back record and everything after it in the poll.
/// Offsets for these records were never committed outside the transaction.
#[async_trait]
pub trait AfterRollbackProcessor: Send + Sync {
    async fn process(&self, remaining: &[Record], ops: &mut ContainerOps<'_>);
}

/// Default processor: seek every remaining record back so the next poll
/// redelivers the whole tail in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeekAfterRollbackProcessor;

#[async_trait]
impl AfterRollbackProcessor for SeekAfterRollbackProcessor {
    async fn process(&self, remaining: &[Record], ops: &mut ContainerOps<'_>) {
        if let [first, rest @ ..] = remaining {
            tracing::debug!(
                count = remaining.len(),
                first = %first,
                "Seeking rolled-back records for redelivery"
            );
            ops.seek_to_current(first, rest);
        }
    }
}
