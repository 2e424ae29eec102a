//! `hubstream-core`: value types for consuming a partitioned event stream.
//!
//! This crate is **pure** (no IO, no threads): positions, events, filters,
//! the cursor resolver and the receive error taxonomy.

pub mod error;
pub mod event;
pub mod filter;
pub mod id;
pub mod position;
pub mod resolver;

pub use error::{ReceiveError, ReceiveResult, TransportError};
pub use event::{Batch, EventPosition, ReceivedEvent};
pub use filter::{Comparison, FilterAttribute, FilterExpression, FilterValue};
pub use id::{ConsumerGroup, DEFAULT_CONSUMER_GROUP, Offset, PartitionId, SequenceNumber};
pub use position::{Position, PositionScheme, PositionConfig};
pub use resolver::{CursorResolver, resolve};
