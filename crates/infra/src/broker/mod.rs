//! Transports backing the receive path.

pub mod in_memory;

pub use in_memory::{InMemoryBroker, InMemoryBrokerConfig, RECORD_HEADER_BYTES};
