//! The narrow seam to a partitioned log broker.
//!
//! Everything the retry layer needs from a broker client fits in two traits:
//! poll/commit/seek on the consumer side and send on the producer side. The
//! in-memory backend implements both for tests and transient pipelines.

pub mod backends;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{MemoryBroker, MemoryConsumer, MemoryProducer};
pub use error::BrokerError;
pub use r#trait::{ConsumerWaker, RecordConsumer, RecordProducer, TransactionalProducer};
pub use types::{CommitMode, OffsetMap, OffsetReset, PollOutcome, TopicSpec};
