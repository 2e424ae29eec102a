//! `hubstream-client`: the receive path.
//!
//! Resolves a starting [`Position`](hubstream_core::Position) into a partition
//! link, keeps the cursor across fetches and returns bounded batches within a
//! bounded wait. Transports plug in through [`PartitionClient`].

pub mod buffer;
pub mod client;
pub mod config;
pub mod fetch;
pub mod receiver;
pub mod transport;

pub use buffer::{CreditListener, PrefetchBuffer, PushRejected};
pub use client::EventHubClient;
pub use config::{
    ClientConfig, ConfigError, DEFAULT_MAX_BATCH_SIZE, DEFAULT_OPEN_TIMEOUT, DEFAULT_PREFETCH,
    DEFAULT_RECEIVE_TIMEOUT, ReceiverOptions,
};
pub use fetch::FetchEngine;
pub use receiver::{Cursor, PartitionReceiver, ReceiverState};
pub use transport::{EventSender, LinkHandle, PartitionClient};
