//! Fetch engine: bounded-wait batch pulls against one open partition link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use hubstream_core::{Batch, EventPosition, PartitionId, ReceiveError, ReceiveResult};

use crate::buffer::{Drained, PrefetchBuffer};

/// Pulls batches out of a link's prefetch buffer.
///
/// - waits at most `timeout` for the *first* event,
/// - once anything is available, returns immediately with up to
///   `max_batch_size` events,
/// - an elapsed wait is an empty batch, never an error.
#[derive(Debug)]
pub struct FetchEngine {
    partition: PartitionId,
    buffer: Arc<PrefetchBuffer>,
    last_delivered: Option<EventPosition>,
}

impl FetchEngine {
    pub fn new(buffer: Arc<PrefetchBuffer>) -> Self {
        Self {
            partition: buffer.partition().clone(),
            buffer,
            last_delivered: None,
        }
    }

    pub fn buffer(&self) -> &Arc<PrefetchBuffer> {
        &self.buffer
    }

    /// Position of the last event this engine handed out.
    pub fn last_delivered(&self) -> Option<EventPosition> {
        self.last_delivered
    }

    pub fn fetch(&mut self, max_batch_size: usize, timeout: Duration) -> ReceiveResult<Batch> {
        if max_batch_size == 0 {
            return Err(ReceiveError::invalid_argument(
                "max_batch_size must be at least 1",
            ));
        }

        let deadline = Instant::now().checked_add(timeout);

        match self.buffer.drain(max_batch_size, deadline)? {
            Drained::Events(events) => {
                let batch = Batch::from(events);
                self.observe(&batch);
                Ok(batch)
            }
            Drained::Fault(error) => Err(ReceiveError::Transport(error)),
            Drained::Detached => Err(ReceiveError::LinkClosed {
                partition: self.partition.clone(),
            }),
            Drained::Closed => Err(ReceiveError::Closed),
        }
    }

    fn observe(&mut self, batch: &Batch) {
        for event in batch {
            if let Some(last) = self.last_delivered {
                if event.sequence_number() <= last.sequence_number {
                    warn!(
                        partition = %self.partition,
                        last = %last.sequence_number,
                        found = %event.sequence_number(),
                        "transport delivered a non-increasing sequence number"
                    );
                }
            }
            self.last_delivered = Some(event.position());
        }
    }
}
