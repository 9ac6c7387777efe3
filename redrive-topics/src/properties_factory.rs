//! Expansion of a retry spec into the ordered destination chain

use std::sync::Arc;

use redrive_broker::RecordProducer;
use redrive_common::classify::ErrorClassifier;
use serde::{Deserialize, Serialize};

use crate::{
    backoff::BackoffPolicy,
    destination::{DestinationProperties, DestinationType, DltFailureStrategy},
};

pub const DEFAULT_RETRY_SUFFIX: &str = "-retry";
pub const DEFAULT_DLT_SUFFIX: &str = "-dlt";
const NO_OPS_SUFFIX: &str = "-noops";

/// How retry topics are laid out when consecutive delays are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FixedDelayTopicStrategy {
    /// One topic per retry level, indexed suffixes.
    #[default]
    MultipleTopics,
    /// A single shared retry topic when every level has the same delay.
    SingleTopic,
}

/// Expands suffixes, attempt budget and backoff policy into the ordered
/// properties list forming main → retry... → dlt → no-ops.
pub struct DestinationPropertiesFactory {
    retry_suffix: String,
    dlt_suffix: String,
    max_attempts: u32,
    policy: BackoffPolicy,
    classifier: Arc<ErrorClassifier>,
    partitions: i32,
    fixed_delay_strategy: FixedDelayTopicStrategy,
    dlt_strategy: DltFailureStrategy,
    timeout_ms: Option<i64>,
    producer: Arc<dyn RecordProducer>,
}

impl DestinationPropertiesFactory {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        retry_suffix: Option<String>,
        dlt_suffix: Option<String>,
        max_attempts: u32,
        policy: BackoffPolicy,
        classifier: Arc<ErrorClassifier>,
        partitions: i32,
        fixed_delay_strategy: FixedDelayTopicStrategy,
        dlt_strategy: DltFailureStrategy,
        timeout_ms: Option<i64>,
        producer: Arc<dyn RecordProducer>,
    ) -> Self {
        Self {
            retry_suffix: retry_suffix.unwrap_or_else(|| DEFAULT_RETRY_SUFFIX.to_string()),
            dlt_suffix: dlt_suffix.unwrap_or_else(|| DEFAULT_DLT_SUFFIX.to_string()),
            max_attempts: max_attempts.max(1),
            policy,
            classifier,
            partitions,
            fixed_delay_strategy,
            dlt_strategy,
            timeout_ms,
            producer,
        }
    }

    /// The ordered destination properties: one main, the retry levels (one
    /// per delay value, or a single shared topic when the strategy collapses
    /// equal delays), one dead-letter and one no-ops terminator.
    #[must_use]
    pub fn create_properties(&self) -> Vec<DestinationProperties> {
        let delays = self.policy.delay_values(self.max_attempts);

        let mut properties = Vec::with_capacity(delays.len() + 3);
        properties.push(self.properties_for(String::new(), DestinationType::Main, 0));

        if self.collapses_to_single_topic(&delays) {
            properties.push(self.properties_for(
                self.retry_suffix.clone(),
                DestinationType::Retry,
                delays.first().copied().unwrap_or(0),
            ));
        } else {
            for (level, delay) in delays.iter().enumerate() {
                properties.push(self.properties_for(
                    format!("{}-{level}", self.retry_suffix),
                    DestinationType::Retry,
                    *delay,
                ));
            }
        }

        properties.push(self.properties_for(
            self.dlt_suffix.clone(),
            DestinationType::Dlt,
            0,
        ));
        properties.push(self.properties_for(
            NO_OPS_SUFFIX.to_string(),
            DestinationType::NoOps,
            0,
        ));
        properties
    }

    fn collapses_to_single_topic(&self, delays: &[u64]) -> bool {
        self.fixed_delay_strategy == FixedDelayTopicStrategy::SingleTopic
            && delays.len() > 1
            && delays.windows(2).all(|pair| pair[0] == pair[1])
    }

    fn properties_for(
        &self,
        suffix: String,
        destination_type: DestinationType,
        delay_ms: u64,
    ) -> DestinationProperties {
        DestinationProperties {
            suffix,
            destination_type,
            delay_ms,
            partitions: self.partitions,
            dlt_strategy: self.dlt_strategy,
            timeout_ms: self.timeout_ms,
            classifier: Arc::clone(&self.classifier),
            producer: Arc::clone(&self.producer),
        }
    }
}
