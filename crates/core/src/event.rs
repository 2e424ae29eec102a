use std::collections::BTreeMap;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{Offset, PartitionId, SequenceNumber};

/// Broker-assigned coordinates of one event.
///
/// All three attributes are total orders within a partition and agree with each
/// other; `enqueued_time` may repeat between neighbouring events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    pub offset: Offset,
    pub sequence_number: SequenceNumber,
    pub enqueued_time: DateTime<Utc>,
}

/// An event as delivered to a receiver.
///
/// Events are facts: once received nothing about them changes, so they are
/// handed out by value and only expose read accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedEvent {
    partition: PartitionId,
    position: EventPosition,
    payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<String, String>,
}

impl ReceivedEvent {
    pub fn new(partition: PartitionId, position: EventPosition, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            position,
            payload: payload.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn position(&self) -> EventPosition {
        self.position
    }

    pub fn offset(&self) -> Offset {
        self.position.offset
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.position.sequence_number
    }

    pub fn enqueued_time(&self) -> DateTime<Utc> {
        self.position.enqueued_time
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Ordered events returned by one receive call (ascending sequence number).
///
/// An empty batch means the wait elapsed with nothing new.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    events: Vec<ReceivedEvent>,
}

impl Batch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[ReceivedEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<ReceivedEvent> {
        self.events
    }

    /// Position of the last event in the batch.
    pub fn last_position(&self) -> Option<EventPosition> {
        self.events.last().map(ReceivedEvent::position)
    }
}

impl From<Vec<ReceivedEvent>> for Batch {
    fn from(events: Vec<ReceivedEvent>) -> Self {
        Self { events }
    }
}

impl Deref for Batch {
    type Target = [ReceivedEvent];

    fn deref(&self) -> &Self::Target {
        &self.events
    }
}

impl IntoIterator for Batch {
    type Item = ReceivedEvent;
    type IntoIter = std::vec::IntoIter<ReceivedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a ReceivedEvent;
    type IntoIter = std::slice::Iter<'a, ReceivedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
