//! Wiring a retry topology onto endpoints and container factories.
//!
//! The configurer expands a [`RetryConfig`] per endpoint topic into concrete
//! destination chains, registers them with the resolver, and decorates
//! container factories (exactly once each) with the manual-immediate ack
//! mode, the dead-letter error handler and the backoff-aware listener
//! wrapper.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashSet;
use redrive_broker::TopicSpec;
use redrive_common::internal;
use redrive_topics::{
    DestinationTopic, DestinationTopicResolver, DestinationsHolder, ResolutionError, RetryConfig,
};

use crate::{
    adapter::BackoffAwareListener,
    backoff::ConsumerBackoffManager,
    container::ListenerContainer,
    error_handler::{DeadLetterErrorHandler, ErrorHandler},
    listener::{AckingRecordListener, ListenerKind},
    properties::{AckMode, ContainerProperties},
    recoverer::DeadLetterPublishingRecoverer,
};

const DEFAULT_IDLE_EVENT_INTERVAL_MS: u64 = 1_000;

/// Tracks which factories have been decorated, so decoration is idempotent
/// even when configuration runs from multiple threads.
#[derive(Debug, Default)]
pub struct ConfiguredFactoriesRegistry {
    configured: DashSet<String>,
}

impl ConfiguredFactoriesRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when the factory was not configured before this call.
    pub fn mark_configured(&self, factory_id: &str) -> bool {
        self.configured.insert(factory_id.to_string())
    }

    #[must_use]
    pub fn is_configured(&self, factory_id: &str) -> bool {
        self.configured.contains(factory_id)
    }
}

/// Creates listener containers from a shared properties template.
pub struct ListenerContainerFactory {
    id: String,
    template: ContainerProperties,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ListenerContainerFactory {
    #[must_use]
    pub fn new(template: ContainerProperties) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            template,
            error_handler: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_ack_mode(&mut self, ack_mode: AckMode) {
        self.template.ack_mode = ack_mode;
    }

    pub fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    /// Set an idle event interval unless the template already has one.
    pub fn default_idle_event_interval(&mut self, interval_ms: u64) {
        if self.template.idle_event_interval_ms.is_none() {
            self.template.idle_event_interval_ms = Some(interval_ms);
        }
    }

    #[must_use]
    pub fn create_container(
        &self,
        topics: Vec<String>,
        listener: ListenerKind,
    ) -> ListenerContainer {
        let mut properties = self.template.clone();
        properties.topics = topics;
        let container = ListenerContainer::new(properties, listener);
        match &self.error_handler {
            Some(handler) => container.with_error_handler(Arc::clone(handler)),
            None => container,
        }
    }
}

/// Applies a [`RetryConfig`] to endpoints and factories.
pub struct RetryTopicConfigurer {
    resolver: Arc<DestinationTopicResolver>,
    backoff_manager: Arc<ConsumerBackoffManager>,
    registry: ConfiguredFactoriesRegistry,
}

impl RetryTopicConfigurer {
    #[must_use]
    pub fn new(
        resolver: Arc<DestinationTopicResolver>,
        backoff_manager: Arc<ConsumerBackoffManager>,
    ) -> Self {
        Self {
            resolver,
            backoff_manager,
            registry: ConfiguredFactoriesRegistry::new(),
        }
    }

    #[must_use]
    pub fn resolver(&self) -> Arc<DestinationTopicResolver> {
        Arc::clone(&self.resolver)
    }

    /// Expand `config` for every admitted endpoint topic, register the
    /// chains, and return the topics the hosting application should create.
    ///
    /// # Errors
    /// [`ResolutionError::Closed`] when called after containers started.
    pub fn process_configuration(
        &self,
        config: &RetryConfig,
        endpoint_topics: &[String],
    ) -> Result<Vec<TopicSpec>, ResolutionError> {
        let mut specs = Vec::new();
        for topic in endpoint_topics
            .iter()
            .filter(|topic| config.admits_topic(topic))
        {
            let destinations: Vec<Arc<DestinationTopic>> = config
                .destination_properties()
                .iter()
                .map(|properties| {
                    Arc::new(DestinationTopic::new(
                        format!("{topic}{}", properties.suffix),
                        properties.clone(),
                    ))
                })
                .collect();

            let mut holders = HashMap::new();
            for pair in destinations.windows(2) {
                holders.insert(
                    pair[0].name().to_string(),
                    DestinationsHolder::new(Arc::clone(&pair[0]), Arc::clone(&pair[1])),
                );
            }
            self.resolver.add_destinations(holders)?;
            internal!(level = DEBUG, "Registered retry chain for {topic}");

            if config.topic_creation().enabled {
                let creation = config.topic_creation();
                specs.extend(
                    destinations
                        .iter()
                        .filter(|destination| {
                            destination.is_retry() || destination.is_dlt()
                        })
                        .map(|destination| {
                            TopicSpec::new(
                                destination.name(),
                                creation.partitions,
                                creation.replication_factor,
                            )
                        }),
                );
            }
        }
        Ok(specs)
    }

    /// Decorate a factory for retry-topic semantics. Idempotent: the second
    /// and later calls for the same factory are no-ops.
    pub fn decorate_factory(&self, factory: &mut ListenerContainerFactory) {
        if !self.registry.mark_configured(factory.id()) {
            return;
        }
        factory.set_ack_mode(AckMode::ManualImmediate);
        factory.default_idle_event_interval(DEFAULT_IDLE_EVENT_INTERVAL_MS);
        factory.set_error_handler(Arc::new(DeadLetterErrorHandler::new(Arc::new(
            self.create_recoverer(),
        ))));
        internal!(level = DEBUG, "Decorated container factory {}", factory.id());
    }

    /// A recoverer bound to this configurer's resolver.
    #[must_use]
    pub fn create_recoverer(&self) -> DeadLetterPublishingRecoverer {
        DeadLetterPublishingRecoverer::new(Arc::clone(&self.resolver))
    }

    /// Wrap a listener so backoff headers gate every delivery.
    #[must_use]
    pub fn wrap_listener(
        &self,
        delegate: Arc<dyn AckingRecordListener>,
        listener_id: &str,
    ) -> Arc<dyn AckingRecordListener> {
        Arc::new(BackoffAwareListener::new(
            delegate,
            Arc::clone(&self.backoff_manager),
            listener_id,
        ))
    }

    /// Freeze the destination registry; called when the application's
    /// containers start.
    pub fn on_application_started(&self) {
        self.resolver.on_closing_event();
    }
}
