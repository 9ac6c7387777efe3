pub mod memory;

pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
