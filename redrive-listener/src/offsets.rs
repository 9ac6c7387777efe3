//! The pending-commit offset ledger.
//!
//! Owned exclusively by the polling task; foreign acknowledgments reach it
//! through the ack channel. Stores the highest processed offset per
//! partition and emits highest-plus-one on commit.

use redrive_broker::OffsetMap;
use redrive_common::record::{Record, TopicPartition};
use std::collections::HashMap;

use crate::acks::AckItem;

#[derive(Debug, Default)]
pub struct OffsetLedger {
    /// topic -> partition -> highest processed offset
    offsets: HashMap<String, HashMap<i32, i64>>,
}

impl OffsetLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, record: &Record) {
        self.track(&record.topic, record.partition, record.offset);
    }

    pub fn add(&mut self, item: &AckItem) {
        self.track(&item.topic, item.partition, item.offset);
    }

    fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        let highest = self
            .offsets
            .entry(topic.to_string())
            .or_default()
            .entry(partition)
            .or_insert(offset);
        if offset > *highest {
            *highest = offset;
        }
    }

    /// Emit highest-plus-one per tracked partition and clear the ledger.
    #[must_use]
    pub fn build_commits(&mut self) -> OffsetMap {
        let mut commits = OffsetMap::new();
        for (topic, partitions) in self.offsets.drain() {
            for (partition, offset) in partitions {
                commits.insert(TopicPartition::new(topic.clone(), partition), offset + 1);
            }
        }
        commits
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
