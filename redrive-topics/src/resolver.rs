//! Destination resolution: the routing decision behind every failure.
//!
//! The resolver owns the full chain graph. Registration happens during the
//! configuration phase; an application "started" signal freezes the registry,
//! after which it is read concurrently by every consumer task.

use std::{collections::HashMap, error::Error, sync::Arc};

use parking_lot::RwLock;
use redrive_common::clock::{Clock, SystemClock};
use thiserror::Error;

use crate::destination::{DestinationTopic, DestinationsHolder, DltFailureStrategy};

/// Bound on chain walks; a well-formed chain terminates far earlier.
const MAX_CHAIN_HOPS: usize = 64;

#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No chain was ever registered for this topic. Signals severe
    /// misconfiguration; never silently resolved to a default.
    #[error("no destination chain registered for topic {0}")]
    UnknownTopic(String),

    /// Registration attempted after the registry froze.
    #[error("destination registry is closed for registration")]
    Closed,

    /// The chain never reached a terminal destination.
    #[error("destination chain for topic {0} has no terminal destination")]
    BrokenChain(String),
}

#[derive(Debug, Default)]
struct Registry {
    destinations: HashMap<String, DestinationsHolder>,
    closed: bool,
}

/// Holds every registered chain and answers next-destination queries.
#[derive(Debug)]
pub struct DestinationTopicResolver {
    registry: RwLock<Registry>,
    clock: Arc<dyn Clock>,
}

impl Default for DestinationTopicResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl DestinationTopicResolver {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            clock,
        }
    }

    /// Merge chain edges into the registry.
    ///
    /// # Errors
    /// [`ResolutionError::Closed`] once the registry has frozen.
    pub fn add_destinations(
        &self,
        destinations: HashMap<String, DestinationsHolder>,
    ) -> Result<(), ResolutionError> {
        let mut registry = self.registry.write();
        if registry.closed {
            return Err(ResolutionError::Closed);
        }
        registry.destinations.extend(destinations);
        Ok(())
    }

    /// One-way transition to the frozen state. Idempotent.
    pub fn on_closing_event(&self) {
        let mut registry = self.registry.write();
        if !registry.closed {
            registry.closed = true;
            tracing::debug!(
                chains = registry.destinations.len(),
                "Destination registry closed for registration"
            );
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.registry.read().closed
    }

    /// The source-side descriptor for `topic`.
    ///
    /// # Errors
    /// [`ResolutionError::UnknownTopic`] when no chain covers `topic`.
    pub fn get_current_topic(&self, topic: &str) -> Result<Arc<DestinationTopic>, ResolutionError> {
        let registry = self.registry.read();
        registry
            .destinations
            .get(topic)
            .map(|holder| Arc::clone(holder.source()))
            .ok_or_else(|| ResolutionError::UnknownTopic(topic.to_string()))
    }

    /// Where a record on `topic` goes after failing with `error` on attempt
    /// `attempt`, given it first entered the chain at `original_timestamp`.
    ///
    /// # Errors
    /// [`ResolutionError::UnknownTopic`] for unregistered topics,
    /// [`ResolutionError::BrokenChain`] when no terminal destination exists.
    pub fn resolve_next_destination(
        &self,
        topic: &str,
        attempt: i64,
        error: &(dyn Error + 'static),
        original_timestamp: i64,
    ) -> Result<Arc<DestinationTopic>, ResolutionError> {
        let registry = self.registry.read();
        let holder = registry
            .destinations
            .get(topic)
            .ok_or_else(|| ResolutionError::UnknownTopic(topic.to_string()))?;

        let source = holder.source();
        if source.is_dlt() {
            // A failure on the dead-letter topic itself: the strategy decides
            // between the self-loop and giving up.
            let resolved = match source.dlt_strategy() {
                DltFailureStrategy::AlwaysRetry => Arc::clone(source),
                DltFailureStrategy::Abort => Arc::clone(holder.next()),
            };
            tracing::trace!(topic, attempt, destination = %resolved, "Resolved DLT failure");
            return Ok(resolved);
        }

        let next = holder.next();
        if !source.should_retry_on(error) || self.is_past_timeout(original_timestamp, next) {
            let terminal = Self::dlt_or_no_ops_for(&registry, topic)?;
            tracing::trace!(topic, attempt, destination = %terminal, "Resolved terminal destination");
            return Ok(terminal);
        }

        tracing::trace!(topic, attempt, destination = %next, "Resolved next destination");
        Ok(Arc::clone(next))
    }

    /// When the record may run again: `failure_timestamp` plus the next
    /// destination's delay.
    ///
    /// # Errors
    /// Same conditions as [`Self::resolve_next_destination`].
    pub fn resolve_destination_next_execution_timestamp(
        &self,
        topic: &str,
        attempt: i64,
        error: &(dyn Error + 'static),
        failure_timestamp: i64,
        original_timestamp: i64,
    ) -> Result<i64, ResolutionError> {
        let next = self.resolve_next_destination(topic, attempt, error, original_timestamp)?;
        Ok(failure_timestamp + i64::try_from(next.delay_ms()).unwrap_or(0))
    }

    fn is_past_timeout(&self, original_timestamp: i64, next: &DestinationTopic) -> bool {
        next.timeout_ms().is_some_and(|timeout| {
            let delay = i64::try_from(next.delay_ms()).unwrap_or(i64::MAX);
            self.clock.now_millis().saturating_add(delay) > original_timestamp + timeout
        })
    }

    /// Walk the chain forward to the first DLT, or the no-ops terminator for
    /// chains configured without one.
    fn dlt_or_no_ops_for(
        registry: &Registry,
        topic: &str,
    ) -> Result<Arc<DestinationTopic>, ResolutionError> {
        let mut current = topic.to_string();
        for _ in 0..MAX_CHAIN_HOPS {
            let holder = registry
                .destinations
                .get(&current)
                .ok_or_else(|| ResolutionError::UnknownTopic(current.clone()))?;
            let next = holder.next();
            if next.is_dlt() || next.is_no_ops() {
                return Ok(Arc::clone(next));
            }
            current = next.name().to_string();
        }
        Err(ResolutionError::BrokenChain(topic.to_string()))
    }
}
