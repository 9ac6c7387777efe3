//! Diagnostic events published by a running container

use std::time::Duration;

/// Lifecycle and liveness notifications, published on a broadcast channel.
/// Purely diagnostic; none of these stop the container.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    Started {
        listener_id: String,
    },
    /// No records arrived for at least the configured idle interval.
    Idle {
        listener_id: String,
        idle_for: Duration,
    },
    /// The poll loop has not reached the broker within
    /// `poll_timeout * no_poll_threshold`.
    NonResponsiveConsumer {
        listener_id: String,
        time_since_last_poll: Duration,
    },
    Stopped {
        listener_id: String,
    },
}
