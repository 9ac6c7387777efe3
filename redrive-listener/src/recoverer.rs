//! Dead-letter publishing: republish a failed record to its next destination.
//!
//! The recoverer asks the resolver where the record goes, stamps the retry
//! metadata headers, and publishes through the destination's owning
//! producer. A backoff signal anywhere in the failure's cause chain is
//! passed back unchanged so the offset is never committed and the record is
//! redelivered instead of dead-lettered.

use std::sync::Arc;

use redrive_common::{
    clock::{Clock, SystemClock},
    headers,
    record::{Headers, OutboundRecord, Record, RecordMetadata},
};
use redrive_topics::{DestinationTopicResolver, ResolutionError};
use thiserror::Error;

use crate::{backoff::BackoffSignal, listener::ListenerError};

/// What recovery did with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Published(RecordMetadata),
    /// The chain resolved to the no-ops destination; nothing was published.
    Suppressed,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The failure was the backoff-not-due signal; it must reach the
    /// container unconverted.
    #[error(transparent)]
    Backoff(BackoffSignal),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Publishing the recovered record failed. Fatal to this recovery
    /// attempt: the original offset stays uncommitted and the whole step is
    /// redone on redelivery.
    #[error("failed to publish recovered record to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: redrive_broker::BrokerError,
    },
}

pub struct DeadLetterPublishingRecoverer {
    resolver: Arc<DestinationTopicResolver>,
    clock: Arc<dyn Clock>,
    fail_on_send_error: bool,
}

impl DeadLetterPublishingRecoverer {
    #[must_use]
    pub fn new(resolver: Arc<DestinationTopicResolver>) -> Self {
        Self::with_clock(resolver, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(resolver: Arc<DestinationTopicResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            resolver,
            clock,
            fail_on_send_error: true,
        }
    }

    /// Whether a publish failure fails the whole recovery attempt. On by
    /// default; turning it off logs and continues instead.
    #[must_use]
    pub fn fail_on_send_error(mut self, fail: bool) -> Self {
        self.fail_on_send_error = fail;
        self
    }

    /// Route `record` after it failed with `error`.
    ///
    /// # Errors
    /// [`RecoveryError::Backoff`] for the pass-through signal,
    /// [`RecoveryError::Resolution`] on misconfiguration,
    /// [`RecoveryError::Publish`] when the republish itself fails.
    pub async fn recover(
        &self,
        record: &Record,
        error: &ListenerError,
    ) -> Result<Recovery, RecoveryError> {
        if let Some(signal) = error.find_in_chain::<BackoffSignal>() {
            // Not a terminal failure: no publish, no offset commit.
            return Err(RecoveryError::Backoff(signal.clone()));
        }

        let attempts = headers::attempts_for(record);
        let original_timestamp_bytes = headers::original_timestamp_bytes_for(record);
        let original_timestamp = headers::original_timestamp_for(record);

        let destination = self.resolver.resolve_next_destination(
            &record.topic,
            attempts,
            error.inner(),
            original_timestamp,
        )?;

        if destination.is_no_ops() {
            tracing::debug!(record = %record, "Next destination is no-ops, suppressing publish");
            return Ok(Recovery::Suppressed);
        }

        let failure_timestamp = self.clock.now_millis();
        let backoff_timestamp = self.resolver.resolve_destination_next_execution_timestamp(
            &record.topic,
            attempts,
            error.inner(),
            failure_timestamp,
            original_timestamp,
        )?;

        let mut outbound_headers = Headers::new();
        outbound_headers.push(headers::ORIGINAL_TIMESTAMP, original_timestamp_bytes);
        outbound_headers.push(
            headers::ATTEMPTS,
            headers::encode_header_value(attempts + 1),
        );
        outbound_headers.push(
            headers::BACKOFF_TIMESTAMP,
            headers::encode_header_value(backoff_timestamp),
        );

        let partition = record.partition % destination.partitions().max(1);
        let outbound = OutboundRecord {
            topic: destination.name().to_string(),
            partition: Some(partition),
            key: record.key.clone(),
            value: record.value.clone(),
            headers: outbound_headers,
        };

        match destination.producer().send(outbound).await {
            Ok(metadata) => {
                tracing::debug!(
                    from = %record,
                    to = %destination,
                    attempts = attempts + 1,
                    "Republished failed record"
                );
                Ok(Recovery::Published(metadata))
            }
            Err(source) if self.fail_on_send_error => Err(RecoveryError::Publish {
                topic: destination.name().to_string(),
                source,
            }),
            Err(source) => {
                tracing::warn!(
                    topic = destination.name(),
                    error = %source,
                    "Publish of recovered record failed, configured to continue"
                );
                Ok(Recovery::Suppressed)
            }
        }
    }
}
