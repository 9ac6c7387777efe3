//! Consumer-side listener containers with retry-topic awareness.
//!
//! The container owns a consumer handle on a dedicated task and drives the
//! poll/dispatch/commit loop; the surrounding modules supply the ack-mode
//! machinery, backoff gating, dead-letter publishing and the configurer that
//! wires a retry topology onto container factories.

pub mod acks;
pub mod adapter;
pub mod after_rollback;
pub mod backoff;
pub mod configurer;
pub mod container;
pub mod error_handler;
pub mod events;
pub mod listener;
pub mod offsets;
pub mod properties;
pub mod recoverer;
pub mod seeks;

pub use acks::{AckError, AckItem, Acknowledgment};
pub use adapter::BackoffAwareListener;
pub use after_rollback::{AfterRollbackProcessor, SeekAfterRollbackProcessor};
pub use backoff::{BackoffContext, BackoffSignal, ConsumerBackoffManager};
pub use configurer::{ConfiguredFactoriesRegistry, ListenerContainerFactory, RetryTopicConfigurer};
pub use container::{ContainerError, ContainerState, ListenerContainer};
pub use error_handler::{
    ContainerOps, DeadLetterErrorHandler, ErrorHandler, HandleOutcome, LoggingErrorHandler,
};
pub use events::ContainerEvent;
pub use listener::{
    AckingBatchListener, AckingRecordListener, BatchListener, ListenerError, ListenerKind,
    RecordListener, SeekAwareListener,
};
pub use offsets::OffsetLedger;
pub use properties::{AckMode, ContainerProperties, InitialOffset};
pub use recoverer::{DeadLetterPublishingRecoverer, Recovery, RecoveryError};
pub use seeks::{SeekHandle, SeekRequest, SeekTarget};
