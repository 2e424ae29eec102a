//! Infrastructure layer: concrete transports for the receive path.

pub mod broker;

mod integration_tests;

pub use broker::{InMemoryBroker, InMemoryBrokerConfig};
