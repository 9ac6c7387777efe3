//! Container configuration

use serde::{Deserialize, Serialize};

const fn default_poll_timeout_ms() -> u64 {
    1_000
}

const fn default_ack_count() -> u32 {
    1
}

const fn default_ack_time_ms() -> u64 {
    5_000
}

const fn default_monitor_interval_secs() -> u64 {
    30
}

const fn default_no_poll_threshold() -> f64 {
    3.0
}

const fn default_sync_commits() -> bool {
    true
}

const fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

/// When offsets are committed relative to listener invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Commit after every record.
    Record,
    /// Commit after every poll batch.
    #[default]
    Batch,
    /// Commit once the ack time has elapsed.
    Time,
    /// Commit once enough records accumulated.
    Count,
    /// Commit on whichever of time or count trips first.
    CountTime,
    /// The listener acknowledges; commits are buffered and flushed
    /// opportunistically.
    Manual,
    /// The listener acknowledges; the commit happens synchronously on the
    /// polling task, with foreign callers able to await completion.
    ManualImmediate,
}

impl AckMode {
    #[must_use]
    pub const fn is_manual(self) -> bool {
        matches!(self, Self::Manual | Self::ManualImmediate)
    }
}

/// An explicit starting position for one partition, applied before the first
/// poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialOffset {
    pub topic: String,
    pub partition: i32,
    /// Non-negative: absolute. Negative: that many records back from the
    /// end, unless `relative_to_current` makes it relative to the current
    /// position.
    pub offset: i64,
    #[serde(default)]
    pub relative_to_current: bool,
}

/// Everything a listener container needs to know besides the listener itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerProperties {
    /// Topics the container subscribes to.
    pub topics: Vec<String>,

    /// Consumer group id, also used for transactional offset hand-off.
    pub group_id: String,

    #[serde(default)]
    pub ack_mode: AckMode,

    /// Upper bound on how long one poll blocks (in milliseconds).
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Records per commit in `Count`/`CountTime` modes.
    #[serde(default = "default_ack_count")]
    pub ack_count: u32,

    /// Commit deadline in `Time`/`CountTime` modes (in milliseconds).
    #[serde(default = "default_ack_time_ms")]
    pub ack_time_ms: u64,

    /// Publish an idle event after this long without records. `None`
    /// disables idle events.
    #[serde(default)]
    pub idle_event_interval_ms: Option<u64>,

    /// How often the liveness monitor checks the time since the last poll.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Multiples of the poll timeout after which the consumer counts as
    /// non-responsive.
    #[serde(default = "default_no_poll_threshold")]
    pub no_poll_threshold: f64,

    /// Commit synchronously (`true`) or fire-and-forget with a logging
    /// callback.
    #[serde(default = "default_sync_commits")]
    pub sync_commits: bool,

    /// Commit a failed record's offset even when no handler recovered it.
    #[serde(default)]
    pub ack_on_error: bool,

    /// The broker client commits on its own; the container stays out of
    /// offset bookkeeping entirely.
    #[serde(default)]
    pub auto_commit: bool,

    /// Stable listener id; generated when absent.
    #[serde(default)]
    pub listener_id: Option<String>,

    /// Bounded wait for the polling task when stopping (in milliseconds).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Explicit starting positions applied before the first poll.
    #[serde(default)]
    pub initial_offsets: Vec<InitialOffset>,
}

impl ContainerProperties {
    #[must_use]
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            topics,
            group_id: group_id.into(),
            ack_mode: AckMode::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
            ack_count: default_ack_count(),
            ack_time_ms: default_ack_time_ms(),
            idle_event_interval_ms: None,
            monitor_interval_secs: default_monitor_interval_secs(),
            no_poll_threshold: default_no_poll_threshold(),
            sync_commits: default_sync_commits(),
            ack_on_error: false,
            auto_commit: false,
            listener_id: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            initial_offsets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let properties = ContainerProperties::new("group", vec!["orders".to_string()]);
        assert_eq!(properties.ack_mode, AckMode::Batch);
        assert_eq!(properties.poll_timeout_ms, 1_000);
        assert!(properties.sync_commits);
        assert!(!properties.auto_commit);
        assert!(properties.idle_event_interval_ms.is_none());
    }

    #[test]
    fn test_manual_modes() {
        assert!(AckMode::Manual.is_manual());
        assert!(AckMode::ManualImmediate.is_manual());
        assert!(!AckMode::Batch.is_manual());
        assert!(!AckMode::Record.is_manual());
    }
}
