//! Acknowledgment hand-off from any thread to the polling task.
//!
//! Broker consumer handles are single-writer, so manual acknowledgments are
//! modeled as messages on a channel the polling task drains. Immediate
//! semantics are a rendezvous: send, then block on the completion signal the
//! polling task fires once the commit went through.

use redrive_common::record::{Record, TopicPartition};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("container is no longer running")]
    ContainerStopped,

    #[error("commit failed: {0}")]
    Commit(String),
}

/// One partition position to acknowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckItem {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl From<&Record> for AckItem {
    fn from(record: &Record) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        }
    }
}

impl AckItem {
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[derive(Debug)]
pub(crate) struct AckRequest {
    pub items: Vec<AckItem>,
    pub completion: Option<oneshot::Sender<Result<(), AckError>>>,
}

/// The highest-offset record per partition; acknowledging a batch reduces to
/// acknowledging these.
#[must_use]
pub fn highest_offsets(records: &[Record]) -> Vec<AckItem> {
    let mut highest: Vec<AckItem> = Vec::new();
    for record in records {
        match highest
            .iter_mut()
            .find(|item| item.topic == record.topic && item.partition == record.partition)
        {
            Some(item) => {
                if record.offset > item.offset {
                    item.offset = record.offset;
                }
            }
            None => highest.push(AckItem::from(record)),
        }
    }
    highest
}

/// Clonable handle a listener uses to acknowledge under the manual ack
/// modes. Safe to move to any thread.
#[derive(Debug, Clone)]
pub struct Acknowledgment {
    items: Vec<AckItem>,
    tx: mpsc::UnboundedSender<AckRequest>,
}

impl Acknowledgment {
    pub(crate) fn single(item: AckItem, tx: mpsc::UnboundedSender<AckRequest>) -> Self {
        Self {
            items: vec![item],
            tx,
        }
    }

    pub(crate) fn batch(records: &[Record], tx: mpsc::UnboundedSender<AckRequest>) -> Self {
        Self {
            items: highest_offsets(records),
            tx,
        }
    }

    /// Enqueue the acknowledgment and return immediately. Safe to call from
    /// inside the listener invocation; the polling task drains the queue
    /// right after dispatch.
    ///
    /// # Errors
    /// [`AckError::ContainerStopped`] when the container has shut down.
    pub fn acknowledge(&self) -> Result<(), AckError> {
        self.tx
            .send(AckRequest {
                items: self.items.clone(),
                completion: None,
            })
            .map_err(|_| AckError::ContainerStopped)
    }

    /// Enqueue the acknowledgment and wait until the polling task committed
    /// it. For foreign threads needing the synchronous contract; calling
    /// this from inside the listener invocation would deadlock, use
    /// [`Self::acknowledge`] there.
    ///
    /// # Errors
    /// [`AckError::ContainerStopped`] when the container has shut down,
    /// [`AckError::Commit`] when the commit itself failed.
    pub async fn acknowledge_and_wait(&self) -> Result<(), AckError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(AckRequest {
                items: self.items.clone(),
                completion: Some(done_tx),
            })
            .map_err(|_| AckError::ContainerStopped)?;
        done_rx.await.map_err(|_| AckError::ContainerStopped)?
    }
}
