//! Listener shapes and the error type they return.
//!
//! The four listener traits cover the record/batch and plain/acknowledging
//! combinations; a container resolves which one it hosts exactly once at
//! start, as a tagged variant, never per record.

use std::{
    collections::HashMap,
    error::Error as StdError,
    fmt::{Debug, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use redrive_common::record::{Record, TopicPartition};
use thiserror::Error;

use crate::{acks::Acknowledgment, seeks::SeekHandle};

pub type DynError = Box<dyn StdError + Send + Sync + 'static>;

/// A processing failure raised by a listener.
///
/// Wraps the underlying error so routing layers can classify it and walk its
/// cause chain.
#[derive(Debug, Error)]
#[error("listener execution failed: {source}")]
pub struct ListenerError {
    #[source]
    source: DynError,
}

impl ListenerError {
    pub fn new(source: impl Into<DynError>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// The wrapped error, usable with a classifier.
    #[must_use]
    pub fn inner(&self) -> &(dyn StdError + 'static) {
        let inner: &(dyn StdError + 'static) = self.source.as_ref();
        inner
    }

    /// Search the wrapped error and its cause chain for a `T`.
    #[must_use]
    pub fn find_in_chain<T: StdError + 'static>(&self) -> Option<&T> {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self.inner());
        while let Some(error) = current {
            if let Some(found) = error.downcast_ref::<T>() {
                return Some(found);
            }
            current = error.source();
        }
        None
    }
}

#[async_trait]
pub trait RecordListener: Send + Sync {
    async fn on_record(&self, record: &Record) -> Result<(), ListenerError>;
}

/// A record listener that receives an acknowledgment handle under the manual
/// ack modes (`None` otherwise).
#[async_trait]
pub trait AckingRecordListener: Send + Sync {
    async fn on_record(
        &self,
        record: &Record,
        ack: Option<Acknowledgment>,
    ) -> Result<(), ListenerError>;
}

#[async_trait]
pub trait BatchListener: Send + Sync {
    async fn on_batch(&self, records: &[Record]) -> Result<(), ListenerError>;
}

#[async_trait]
pub trait AckingBatchListener: Send + Sync {
    async fn on_batch(
        &self,
        records: &[Record],
        ack: Option<Acknowledgment>,
    ) -> Result<(), ListenerError>;
}

/// The listener variant a container hosts, resolved once at start.
#[derive(Clone)]
pub enum ListenerKind {
    Record(Arc<dyn RecordListener>),
    AckingRecord(Arc<dyn AckingRecordListener>),
    Batch(Arc<dyn BatchListener>),
    AckingBatch(Arc<dyn AckingBatchListener>),
}

impl ListenerKind {
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_) | Self::AckingBatch(_))
    }
}

impl Debug for ListenerKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        fmt.write_str(match self {
            Self::Record(_) => "ListenerKind::Record",
            Self::AckingRecord(_) => "ListenerKind::AckingRecord",
            Self::Batch(_) => "ListenerKind::Batch",
            Self::AckingBatch(_) => "ListenerKind::AckingBatch",
        })
    }
}

/// Optional hook for listeners that reposition partitions themselves, on
/// assignment or when the container idles.
pub trait SeekAwareListener: Send + Sync {
    fn on_partitions_assigned(&self, positions: &HashMap<TopicPartition, i64>, seeker: &SeekHandle);

    fn on_idle_container(&self, positions: &HashMap<TopicPartition, i64>, seeker: &SeekHandle) {
        let _ = (positions, seeker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("inner failure")]
    struct InnerFailure;

    #[derive(Debug, Error)]
    #[error("outer: {source}")]
    struct OuterFailure {
        #[source]
        source: InnerFailure,
    }

    #[test]
    fn test_find_in_chain_direct() {
        let error = ListenerError::new(InnerFailure);
        assert!(error.find_in_chain::<InnerFailure>().is_some());
        assert!(error.find_in_chain::<OuterFailure>().is_none());
    }

    #[test]
    fn test_find_in_chain_nested() {
        let error = ListenerError::new(OuterFailure {
            source: InnerFailure,
        });
        assert!(error.find_in_chain::<OuterFailure>().is_some());
        assert!(error.find_in_chain::<InnerFailure>().is_some());
    }

    #[test]
    fn test_display_includes_source() {
        let error = ListenerError::new(InnerFailure);
        assert_eq!(error.to_string(), "listener execution failed: inner failure");
    }
}
