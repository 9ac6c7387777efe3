//! Backoff-aware listener decoration.
//!
//! Wraps the user listener so the backoff-timestamp header is checked before
//! every delegation, and the record is acknowledged after a successful one.

use std::sync::Arc;

use async_trait::async_trait;
use redrive_common::{headers, record::Record};

use crate::{
    acks::Acknowledgment,
    backoff::ConsumerBackoffManager,
    listener::{AckingRecordListener, ListenerError},
};

pub struct BackoffAwareListener {
    delegate: Arc<dyn AckingRecordListener>,
    backoff_manager: Arc<ConsumerBackoffManager>,
    listener_id: String,
}

impl BackoffAwareListener {
    #[must_use]
    pub fn new(
        delegate: Arc<dyn AckingRecordListener>,
        backoff_manager: Arc<ConsumerBackoffManager>,
        listener_id: impl Into<String>,
    ) -> Self {
        Self {
            delegate,
            backoff_manager,
            listener_id: listener_id.into(),
        }
    }
}

#[async_trait]
impl AckingRecordListener for BackoffAwareListener {
    async fn on_record(
        &self,
        record: &Record,
        ack: Option<Acknowledgment>,
    ) -> Result<(), ListenerError> {
        if let Some(due_timestamp) = headers::backoff_timestamp_for(record) {
            let context = self.backoff_manager.create_context(
                due_timestamp,
                &self.listener_id,
                record.topic_partition(),
            );
            self.backoff_manager
                .maybe_backoff(&context)
                .map_err(ListenerError::new)?;
        }

        self.delegate.on_record(record, ack.clone()).await?;

        if let Some(ack) = ack {
            ack.acknowledge().map_err(ListenerError::new)?;
        }
        Ok(())
    }
}
