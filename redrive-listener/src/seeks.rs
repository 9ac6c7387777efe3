//! Queued repositioning requests.
//!
//! Seeks are never executed where they are requested: they queue up and the
//! polling task applies them right before the next poll, keeping the consumer
//! handle single-writer.

use redrive_common::record::TopicPartition;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Offset(i64),
    Beginning,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekRequest {
    pub partition: TopicPartition,
    pub target: SeekTarget,
}

/// Foreign-thread-safe handle feeding the container's seek queue.
#[derive(Debug, Clone)]
pub struct SeekHandle {
    tx: mpsc::UnboundedSender<SeekRequest>,
}

impl SeekHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SeekRequest>) -> Self {
        Self { tx }
    }

    pub fn seek(&self, topic: impl Into<String>, partition: i32, offset: i64) {
        let _ = self.tx.send(SeekRequest {
            partition: TopicPartition::new(topic, partition),
            target: SeekTarget::Offset(offset),
        });
    }

    pub fn seek_to_beginning(&self, topic: impl Into<String>, partition: i32) {
        let _ = self.tx.send(SeekRequest {
            partition: TopicPartition::new(topic, partition),
            target: SeekTarget::Beginning,
        });
    }

    pub fn seek_to_end(&self, topic: impl Into<String>, partition: i32) {
        let _ = self.tx.send(SeekRequest {
            partition: TopicPartition::new(topic, partition),
            target: SeekTarget::End,
        });
    }
}
