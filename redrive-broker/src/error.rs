//! Broker error taxonomy.
//!
//! The listener container treats these unevenly: a wakeup is a routine
//! unblocking signal, a missing offset with no reset policy is fatal to the
//! container, and everything else is surfaced to the caller.

use redrive_common::record::TopicPartition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The blocked poll was interrupted by `ConsumerWaker::wake`.
    #[error("consumer woken up")]
    Wakeup,

    /// No committed offset exists and the consumer has no reset policy.
    #[error("no offset for {0} and no reset policy configured")]
    NoOffsetForPartition(TopicPartition),

    /// The topic does not exist and auto-creation is disabled.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// The partition index is outside the topic's partition count.
    #[error("unknown partition: {0}")]
    UnknownPartition(TopicPartition),

    /// Seeking to a position the partition cannot satisfy.
    #[error("invalid seek on {partition} to offset {offset}")]
    InvalidSeek {
        partition: TopicPartition,
        offset: i64,
    },

    /// A transactional operation was used outside a transaction, or the
    /// transaction state machine was violated.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Producing a record failed.
    #[error("send to {topic} failed: {reason}")]
    Send { topic: String, reason: String },

    /// Transport-level failure talking to the broker.
    #[error("broker transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// `true` when this is the poll-unblocking wakeup signal.
    #[must_use]
    pub const fn is_wakeup(&self) -> bool {
        matches!(self, Self::Wakeup)
    }

    /// `true` when the error must stop the owning container.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::NoOffsetForPartition(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_is_not_fatal() {
        assert!(BrokerError::Wakeup.is_wakeup());
        assert!(!BrokerError::Wakeup.is_fatal());
    }

    #[test]
    fn test_missing_offset_is_fatal() {
        let error = BrokerError::NoOffsetForPartition(TopicPartition::new("orders", 0));
        assert!(error.is_fatal());
        assert!(!error.is_wakeup());
        assert_eq!(
            error.to_string(),
            "no offset for orders-0 and no reset policy configured"
        );
    }
}
