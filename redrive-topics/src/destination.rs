//! Destination-topic data entities

use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
    sync::Arc,
};

use redrive_broker::RecordProducer;
use redrive_common::classify::ErrorClassifier;
use serde::{Deserialize, Serialize};

/// Where a destination sits in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationType {
    /// The topic the listener originally subscribes to.
    Main,
    /// An intermediate delay-holding topic.
    Retry,
    /// Terminal destination for given-up-on records.
    Dlt,
    /// Terminal marker: do not republish anywhere.
    NoOps,
}

/// What happens when processing fails on the dead-letter topic itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DltFailureStrategy {
    /// The DLT resolves to itself; records keep being redelivered.
    #[default]
    AlwaysRetry,
    /// Give up: the DLT resolves to the no-ops destination.
    Abort,
}

/// Configuration shared by every instance of a destination, before it is
/// bound to a concrete topic name.
#[derive(Clone)]
pub struct DestinationProperties {
    pub suffix: String,
    pub destination_type: DestinationType,
    pub delay_ms: u64,
    pub partitions: i32,
    pub dlt_strategy: DltFailureStrategy,
    /// Chain expiration relative to a record's original timestamp.
    pub timeout_ms: Option<i64>,
    pub classifier: Arc<ErrorClassifier>,
    pub producer: Arc<dyn RecordProducer>,
}

impl Debug for DestinationProperties {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("DestinationProperties")
            .field("suffix", &self.suffix)
            .field("destination_type", &self.destination_type)
            .field("delay_ms", &self.delay_ms)
            .field("partitions", &self.partitions)
            .field("dlt_strategy", &self.dlt_strategy)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Immutable description of one topic in a retry chain.
///
/// Identity is by name within a resolver instance.
#[derive(Debug, Clone)]
pub struct DestinationTopic {
    name: String,
    properties: DestinationProperties,
}

impl DestinationTopic {
    #[must_use]
    pub fn new(name: impl Into<String>, properties: DestinationProperties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn destination_type(&self) -> DestinationType {
        self.properties.destination_type
    }

    #[must_use]
    pub const fn is_main(&self) -> bool {
        matches!(self.properties.destination_type, DestinationType::Main)
    }

    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self.properties.destination_type, DestinationType::Retry)
    }

    #[must_use]
    pub const fn is_dlt(&self) -> bool {
        matches!(self.properties.destination_type, DestinationType::Dlt)
    }

    #[must_use]
    pub const fn is_no_ops(&self) -> bool {
        matches!(self.properties.destination_type, DestinationType::NoOps)
    }

    /// Execution delay for records arriving here, in milliseconds.
    #[must_use]
    pub const fn delay_ms(&self) -> u64 {
        self.properties.delay_ms
    }

    #[must_use]
    pub const fn partitions(&self) -> i32 {
        self.properties.partitions
    }

    #[must_use]
    pub const fn dlt_strategy(&self) -> DltFailureStrategy {
        self.properties.dlt_strategy
    }

    #[must_use]
    pub const fn timeout_ms(&self) -> Option<i64> {
        self.properties.timeout_ms
    }

    /// Whether the chain classifier considers `error` retryable.
    #[must_use]
    pub fn should_retry_on(&self, error: &(dyn Error + 'static)) -> bool {
        self.properties.classifier.classify(error)
    }

    /// The producer that owns publishing for this destination's
    /// configuration.
    #[must_use]
    pub fn producer(&self) -> Arc<dyn RecordProducer> {
        Arc::clone(&self.properties.producer)
    }
}

impl Display for DestinationTopic {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.name)
    }
}

impl PartialEq for DestinationTopic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.properties.destination_type == other.properties.destination_type
    }
}

impl Eq for DestinationTopic {}

/// One edge of a chain: a source destination and the hop that follows it.
#[derive(Debug, Clone)]
pub struct DestinationsHolder {
    source: Arc<DestinationTopic>,
    next: Arc<DestinationTopic>,
}

impl DestinationsHolder {
    #[must_use]
    pub fn new(source: Arc<DestinationTopic>, next: Arc<DestinationTopic>) -> Self {
        Self { source, next }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<DestinationTopic> {
        &self.source
    }

    #[must_use]
    pub fn next(&self) -> &Arc<DestinationTopic> {
        &self.next
    }
}
