//! Destination-topic chains: the routing graph behind retry topics.
//!
//! A retry configuration expands into an ordered chain of destinations
//! (main, retry levels, dead-letter, no-ops); the resolver answers, per
//! failure, where a record goes next and when it may run again.

pub mod backoff;
pub mod config;
pub mod destination;
pub mod properties_factory;
pub mod resolver;

pub use backoff::{BackoffError, BackoffPolicy};
pub use config::{ConfigError, RetryConfig, RetryConfigBuilder, TopicCreation, TopicGatekeeper};
pub use destination::{
    DestinationProperties, DestinationTopic, DestinationType, DestinationsHolder,
    DltFailureStrategy,
};
pub use properties_factory::{
    DEFAULT_DLT_SUFFIX, DEFAULT_RETRY_SUFFIX, DestinationPropertiesFactory,
    FixedDelayTopicStrategy,
};
pub use resolver::{DestinationTopicResolver, ResolutionError};
