//! User-facing retry configuration and its builder.
//!
//! A `RetryConfig` is the complete recipe for one retry topology: attempt
//! budget, backoff, classification rules, suffixes, topic auto-creation and
//! dead-letter failure behavior. The configurer expands it per endpoint
//! topic.

use std::sync::Arc;

use redrive_broker::RecordProducer;
use redrive_common::classify::{ClassifierBuilder, ErrorClassifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    backoff::{BackoffError, BackoffPolicy},
    destination::{DestinationProperties, DltFailureStrategy},
    properties_factory::{DestinationPropertiesFactory, FixedDelayTopicStrategy},
};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_FIXED_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("number of attempts should be positive")]
    NonPositiveMaxAttempts,

    #[error("you have already set the number of attempts")]
    MaxAttemptsAlreadySet,

    #[error("you have already selected a backoff policy")]
    PolicyAlreadySet,

    #[error(transparent)]
    Backoff(#[from] BackoffError),
}

/// Allow/deny gatekeeper deciding which topics a configuration applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicGatekeeper {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TopicGatekeeper {
    /// Admits everything not excluded; with a non-empty include list, only
    /// the listed topics.
    #[must_use]
    pub fn admits(&self, topic: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|candidate| candidate == topic);
        included && !self.exclude.iter().any(|candidate| candidate == topic)
    }
}

/// Whether and how the chain's topics should be created ahead of use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCreation {
    pub enabled: bool,
    pub partitions: i32,
    pub replication_factor: i16,
}

impl Default for TopicCreation {
    fn default() -> Self {
        Self {
            enabled: true,
            partitions: 1,
            replication_factor: 1,
        }
    }
}

/// A complete retry topology recipe, produced by [`RetryConfigBuilder`].
pub struct RetryConfig {
    properties: Vec<DestinationProperties>,
    gatekeeper: TopicGatekeeper,
    topic_creation: TopicCreation,
}

impl RetryConfig {
    #[must_use]
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// The ordered chain properties: main, retry levels, dlt, no-ops.
    #[must_use]
    pub fn destination_properties(&self) -> &[DestinationProperties] {
        &self.properties
    }

    #[must_use]
    pub fn admits_topic(&self, topic: &str) -> bool {
        self.gatekeeper.admits(topic)
    }

    #[must_use]
    pub const fn topic_creation(&self) -> &TopicCreation {
        &self.topic_creation
    }
}

/// Builder mirroring the knobs a hosting application configures.
pub struct RetryConfigBuilder {
    max_attempts: Option<u32>,
    policy: Option<BackoffPolicy>,
    retry_suffix: Option<String>,
    dlt_suffix: Option<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    classifier: Option<ClassifierBuilder>,
    topic_creation: TopicCreation,
    fixed_delay_strategy: FixedDelayTopicStrategy,
    dlt_strategy: DltFailureStrategy,
    timeout_ms: Option<i64>,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self {
            max_attempts: None,
            policy: None,
            retry_suffix: None,
            dlt_suffix: None,
            include: Vec::new(),
            exclude: Vec::new(),
            classifier: None,
            topic_creation: TopicCreation::default(),
            fixed_delay_strategy: FixedDelayTopicStrategy::default(),
            dlt_strategy: DltFailureStrategy::default(),
            timeout_ms: None,
        }
    }
}

impl RetryConfigBuilder {
    /// Total attempt budget, including the first delivery.
    ///
    /// # Errors
    /// When non-positive or already set.
    pub fn max_attempts(mut self, max_attempts: u32) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::NonPositiveMaxAttempts);
        }
        if self.max_attempts.is_some() {
            return Err(ConfigError::MaxAttemptsAlreadySet);
        }
        self.max_attempts = Some(max_attempts);
        Ok(self)
    }

    /// # Errors
    /// When a policy was already selected or the interval is invalid.
    pub fn fixed_backoff(mut self, interval_ms: u64) -> Result<Self, ConfigError> {
        self.ensure_no_policy()?;
        self.policy = Some(BackoffPolicy::fixed(interval_ms)?);
        Ok(self)
    }

    /// # Errors
    /// When a policy was already selected or the parameters are inconsistent.
    pub fn exponential_backoff(
        mut self,
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    ) -> Result<Self, ConfigError> {
        self.ensure_no_policy()?;
        self.policy = Some(BackoffPolicy::exponential(initial_ms, multiplier, max_ms)?);
        Ok(self)
    }

    /// # Errors
    /// When a policy was already selected or the parameters are inconsistent.
    pub fn exponential_random_backoff(
        mut self,
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    ) -> Result<Self, ConfigError> {
        self.ensure_no_policy()?;
        self.policy = Some(BackoffPolicy::exponential_random(
            initial_ms, multiplier, max_ms,
        )?);
        Ok(self)
    }

    /// # Errors
    /// When a policy was already selected or the parameters are inconsistent.
    pub fn uniform_random_backoff(mut self, min_ms: u64, max_ms: u64) -> Result<Self, ConfigError> {
        self.ensure_no_policy()?;
        self.policy = Some(BackoffPolicy::uniform_random(min_ms, max_ms)?);
        Ok(self)
    }

    /// # Errors
    /// When a policy was already selected.
    pub fn no_backoff(mut self) -> Result<Self, ConfigError> {
        self.ensure_no_policy()?;
        self.policy = Some(BackoffPolicy::none());
        Ok(self)
    }

    /// # Errors
    /// When a policy was already selected or `delays_ms` is empty.
    pub fn custom_backoff(mut self, delays_ms: Vec<u64>) -> Result<Self, ConfigError> {
        self.ensure_no_policy()?;
        self.policy = Some(BackoffPolicy::custom(delays_ms)?);
        Ok(self)
    }

    fn ensure_no_policy(&self) -> Result<(), ConfigError> {
        if self.policy.is_some() {
            return Err(ConfigError::PolicyAlreadySet);
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.retry_suffix = Some(suffix.into());
        self
    }

    #[must_use]
    pub fn dlt_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.dlt_suffix = Some(suffix.into());
        self
    }

    #[must_use]
    pub fn include_topic(mut self, topic: impl Into<String>) -> Self {
        self.include.push(topic.into());
        self
    }

    #[must_use]
    pub fn include_topics(mut self, topics: impl IntoIterator<Item = String>) -> Self {
        self.include.extend(topics);
        self
    }

    #[must_use]
    pub fn exclude_topic(mut self, topic: impl Into<String>) -> Self {
        self.exclude.push(topic.into());
        self
    }

    #[must_use]
    pub fn exclude_topics(mut self, topics: impl IntoIterator<Item = String>) -> Self {
        self.exclude.extend(topics);
        self
    }

    /// Errors of type `E` are retryable.
    #[must_use]
    pub fn retry_on<E: std::error::Error + 'static>(mut self) -> Self {
        self.classifier = Some(self.classifier.take().unwrap_or_default().retry_on::<E>());
        self
    }

    /// Errors of type `E` go straight to the dead-letter topic.
    #[must_use]
    pub fn not_retry_on<E: std::error::Error + 'static>(mut self) -> Self {
        self.classifier = Some(
            self.classifier
                .take()
                .unwrap_or_default()
                .not_retry_on::<E>(),
        );
        self
    }

    /// Classify wrapped errors by walking their cause chain.
    #[must_use]
    pub fn traversing_causes(mut self) -> Self {
        self.classifier = Some(self.classifier.take().unwrap_or_default().traversing_causes());
        self
    }

    #[must_use]
    pub fn auto_create_topics(mut self, partitions: i32, replication_factor: i16) -> Self {
        self.topic_creation = TopicCreation {
            enabled: true,
            partitions,
            replication_factor,
        };
        self
    }

    #[must_use]
    pub fn do_not_auto_create_topics(mut self) -> Self {
        self.topic_creation.enabled = false;
        self
    }

    /// Collapse equal fixed delays into one shared retry topic.
    #[must_use]
    pub fn use_single_topic_for_fixed_delays(mut self) -> Self {
        self.fixed_delay_strategy = FixedDelayTopicStrategy::SingleTopic;
        self
    }

    /// Give up instead of self-looping when processing fails on the DLT.
    #[must_use]
    pub fn abort_on_dlt_failure(mut self) -> Self {
        self.dlt_strategy = DltFailureStrategy::Abort;
        self
    }

    /// Route to the DLT once a record has been in the chain longer than
    /// `timeout_ms`, regardless of remaining attempts.
    #[must_use]
    pub fn timeout_after(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Finish the configuration, binding outbound publishing to `producer`.
    #[must_use]
    pub fn build(self, producer: Arc<dyn RecordProducer>) -> RetryConfig {
        let classifier = self
            .classifier
            .map_or_else(ErrorClassifier::retry_all, ClassifierBuilder::build);
        let factory = DestinationPropertiesFactory::new(
            self.retry_suffix,
            self.dlt_suffix,
            self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            self.policy
                .unwrap_or(BackoffPolicy::Fixed {
                    interval_ms: DEFAULT_FIXED_INTERVAL_MS,
                }),
            Arc::new(classifier),
            self.topic_creation.partitions,
            self.fixed_delay_strategy,
            self.dlt_strategy,
            self.timeout_ms,
            producer,
        );

        RetryConfig {
            properties: factory.create_properties(),
            gatekeeper: TopicGatekeeper {
                include: self.include,
                exclude: self.exclude,
            },
            topic_creation: self.topic_creation,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use redrive_broker::BrokerError;
    use redrive_common::record::{OutboundRecord, RecordMetadata};
    use thiserror::Error;

    use super::*;
    use crate::destination::DestinationType;

    #[derive(Debug, Error)]
    #[error("bad payload")]
    struct BadPayload;

    struct NullProducer;

    #[async_trait]
    impl RecordProducer for NullProducer {
        async fn send(&self, record: OutboundRecord) -> Result<RecordMetadata, BrokerError> {
            Ok(RecordMetadata {
                topic: record.topic,
                partition: 0,
                offset: 0,
            })
        }
    }

    #[test]
    fn test_default_configuration_shape() {
        let config = RetryConfig::builder().build(Arc::new(NullProducer));
        let properties = config.destination_properties();

        // 3 attempts: main + 2 retries + dlt + no-ops
        assert_eq!(properties.len(), 5);
        assert_eq!(properties[0].destination_type, DestinationType::Main);
        assert_eq!(properties[1].delay_ms, 1_000);
        assert_eq!(properties[2].delay_ms, 1_000);
        assert!(config.admits_topic("anything"));
        assert!(config.topic_creation().enabled);
    }

    #[test]
    fn test_exponential_configuration() {
        let config = RetryConfig::builder()
            .max_attempts(4)
            .unwrap()
            .exponential_backoff(100, 2.0, 10_000)
            .unwrap()
            .build(Arc::new(NullProducer));

        let delays: Vec<u64> = config
            .destination_properties()
            .iter()
            .filter(|props| props.destination_type == DestinationType::Retry)
            .map(|props| props.delay_ms)
            .collect();
        assert_eq!(delays, vec![100, 200, 400]);
    }

    #[test]
    fn test_policy_can_only_be_selected_once() {
        let result = RetryConfig::builder()
            .fixed_backoff(100)
            .unwrap()
            .exponential_backoff(100, 2.0, 1_000);
        assert!(matches!(result, Err(ConfigError::PolicyAlreadySet)));
    }

    #[test]
    fn test_max_attempts_can_only_be_set_once() {
        let result = RetryConfig::builder()
            .max_attempts(3)
            .unwrap()
            .max_attempts(4);
        assert!(matches!(result, Err(ConfigError::MaxAttemptsAlreadySet)));
    }

    #[test]
    fn test_max_attempts_must_be_positive() {
        let result = RetryConfig::builder().max_attempts(0);
        assert!(matches!(result, Err(ConfigError::NonPositiveMaxAttempts)));
    }

    #[test]
    fn test_gatekeeper_include_exclude() {
        let config = RetryConfig::builder()
            .include_topic("orders")
            .exclude_topic("audits")
            .build(Arc::new(NullProducer));

        assert!(config.admits_topic("orders"));
        assert!(!config.admits_topic("payments"));
        assert!(!config.admits_topic("audits"));
    }

    #[test]
    fn test_classifier_rules_flow_into_properties() {
        let config = RetryConfig::builder()
            .not_retry_on::<BadPayload>()
            .build(Arc::new(NullProducer));

        let main = &config.destination_properties()[0];
        assert!(!main.classifier.classify(&BadPayload));
    }

    #[test]
    fn test_custom_suffixes() {
        let config = RetryConfig::builder()
            .max_attempts(2)
            .unwrap()
            .retry_topic_suffix("-redo")
            .dlt_suffix("-dead")
            .build(Arc::new(NullProducer));

        let suffixes: Vec<&str> = config
            .destination_properties()
            .iter()
            .map(|props| props.suffix.as_str())
            .collect();
        assert_eq!(suffixes, vec!["", "-redo-0", "-dead", "-noops"]);
    }

    #[test]
    fn test_single_topic_for_fixed_delays() {
        let config = RetryConfig::builder()
            .max_attempts(5)
            .unwrap()
            .fixed_backoff(500)
            .unwrap()
            .use_single_topic_for_fixed_delays()
            .build(Arc::new(NullProducer));

        let retries = config
            .destination_properties()
            .iter()
            .filter(|props| props.destination_type == DestinationType::Retry)
            .count();
        assert_eq!(retries, 1);
    }
}
