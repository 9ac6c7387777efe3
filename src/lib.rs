//! Retry-topic orchestration for partitioned log brokers.
//!
//! Failed records are routed through a chain of delay topics with
//! increasing backoff, attempt counts and timestamps riding along in
//! headers, until they succeed or land on the dead-letter topic.

pub use redrive_broker as broker;
pub use redrive_common as common;
pub use redrive_listener as listener;
pub use redrive_topics as topics;

pub use redrive_common::tracing;
