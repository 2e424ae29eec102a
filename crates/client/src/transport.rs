//! Collaborator contracts: what a transport must provide to the receive path.
//!
//! ## Architecture Role
//!
//! ```text
//! Position → CursorResolver → FilterExpression
//!                                   │
//!                                   ▼
//!            PartitionClient::open_link(filter, buffer) ──► transport driver
//!                                                              │ push (credit)
//!                                                              ▼
//!            PartitionReceiver::receive ◄── FetchEngine ◄── PrefetchBuffer
//! ```
//!
//! The transport owns connections, authentication, framing and retries. The
//! receive path only asks it to open and close filtered partition reads and to
//! report the partition tail.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use hubstream_core::{
    ConsumerGroup, EventPosition, FilterExpression, PartitionId, SequenceNumber, TransportError,
};

use crate::buffer::PrefetchBuffer;

/// Identifies one open partition read on a transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LinkHandle(Uuid);

impl LinkHandle {
    /// Allocate a fresh handle (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LinkHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Transport-side partition reads.
///
/// ## Delivery contract
///
/// After `open_link` returns, the transport delivers every event selected by
/// `filter`, in partition order, into `buffer`, pushing only while
/// `buffer.credit() > 0` (the buffer's capacity is the prefetch depth). It
/// resumes after [`crate::CreditListener::credit_available`]. Faults go to
/// `buffer.fail`; a link the transport can no longer serve is `detach`ed.
///
/// ## Thread Safety
///
/// Implementations are shared between every receiver of a client and must be
/// `Send + Sync`. `open_link` may block (it runs off the caller's thread).
pub trait PartitionClient: Send + Sync {
    fn open_link(
        &self,
        group: &ConsumerGroup,
        partition: &PartitionId,
        filter: &FilterExpression,
        buffer: Arc<PrefetchBuffer>,
    ) -> Result<LinkHandle, TransportError>;

    /// Stop delivering on `link`. Closing an unknown or already-closed link is a no-op.
    fn close_link(&self, link: LinkHandle);

    /// Last sequence number enqueued in `partition`, `None` if it never held an event.
    fn last_sequence_number(
        &self,
        partition: &PartitionId,
    ) -> Result<Option<SequenceNumber>, TransportError>;
}

impl<C> PartitionClient for Arc<C>
where
    C: PartitionClient + ?Sized,
{
    fn open_link(
        &self,
        group: &ConsumerGroup,
        partition: &PartitionId,
        filter: &FilterExpression,
        buffer: Arc<PrefetchBuffer>,
    ) -> Result<LinkHandle, TransportError> {
        (**self).open_link(group, partition, filter, buffer)
    }

    fn close_link(&self, link: LinkHandle) {
        (**self).close_link(link)
    }

    fn last_sequence_number(
        &self,
        partition: &PartitionId,
    ) -> Result<Option<SequenceNumber>, TransportError> {
        (**self).last_sequence_number(partition)
    }
}

/// Producer side: append one opaque payload to a partition.
///
/// The receive path only observes the effect (new events in the stream); the
/// returned position is for diagnostics.
pub trait EventSender: Send + Sync {
    fn append_with_properties(
        &self,
        partition: &PartitionId,
        payload: Vec<u8>,
        properties: BTreeMap<String, String>,
    ) -> Result<EventPosition, TransportError>;

    fn append(
        &self,
        partition: &PartitionId,
        payload: impl Into<Vec<u8>>,
    ) -> Result<EventPosition, TransportError>
    where
        Self: Sized,
    {
        self.append_with_properties(partition, payload.into(), BTreeMap::new())
    }
}

impl<S> EventSender for Arc<S>
where
    S: EventSender + ?Sized,
{
    fn append_with_properties(
        &self,
        partition: &PartitionId,
        payload: Vec<u8>,
        properties: BTreeMap<String, String>,
    ) -> Result<EventPosition, TransportError> {
        (**self).append_with_properties(partition, payload, properties)
    }
}
