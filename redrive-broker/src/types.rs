//! Supporting types for the broker seam

use std::collections::HashMap;

use redrive_common::record::{Record, TopicPartition};
use serde::{Deserialize, Serialize};

/// Offsets to commit: per partition, the next offset to consume.
pub type OffsetMap = HashMap<TopicPartition, i64>;

/// Whether a commit blocks until acknowledged by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitMode {
    Sync,
    Async,
}

/// Where consumption starts when no committed offset exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
    /// Fail instead of resetting; surfaces as a fatal
    /// [`BrokerError::NoOffsetForPartition`](crate::BrokerError::NoOffsetForPartition).
    None,
}

/// One poll's worth of consumer activity.
///
/// Rebalance notices ride along with the records because brokers surface
/// them from inside the poll call.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub records: Vec<Record>,
    pub revoked: Vec<TopicPartition>,
    pub assigned: Vec<TopicPartition>,
}

impl PollOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.revoked.is_empty() && self.assigned.is_empty()
    }
}

/// A topic the hosting application should create ahead of use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
}

impl TopicSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i16) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}
