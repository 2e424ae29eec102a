//! Prefetch buffer: the bounded queue between a transport and a receiver.
//!
//! The transport pushes events while the buffer has credit; the receiver
//! drains them. Capacity is the prefetch depth, so it bounds memory only and
//! never changes what is delivered or in which order.
//!
//! Besides events the buffer carries three out-of-band signals:
//! - a transport fault (raised once, after everything buffered before it),
//! - detach (the transport closed the link; raised after the buffer empties),
//! - close (the receiver shut down; raised immediately, wakes waiters).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use tracing::trace;

use hubstream_core::{PartitionId, ReceivedEvent, ReceiveError, ReceiveResult, TransportError};

/// Notified whenever a drain frees buffer space.
///
/// Transports register one to learn when they may resume pushing.
pub trait CreditListener: Send + Sync {
    fn credit_available(&self, partition: &PartitionId);
}

/// Why a push was not accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PushRejected {
    /// No credit left; retry after the next credit notification.
    Full,
    /// The link is gone (detached or the receiver closed); stop delivering.
    Gone,
}

/// Outcome of one drain.
#[derive(Debug)]
pub(crate) enum Drained {
    /// Zero or more events. Zero means the deadline passed.
    Events(Vec<ReceivedEvent>),
    Fault(TransportError),
    Detached,
    Closed,
}

#[derive(Debug, Default)]
struct BufferState {
    events: VecDeque<ReceivedEvent>,
    fault: Option<TransportError>,
    detached: bool,
    closed: bool,
}

pub struct PrefetchBuffer {
    partition: PartitionId,
    capacity: usize,
    state: Mutex<BufferState>,
    ready: Condvar,
    listener: Mutex<Option<Arc<dyn CreditListener>>>,
}

impl core::fmt::Debug for PrefetchBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrefetchBuffer")
            .field("partition", &self.partition)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl PrefetchBuffer {
    /// Create a buffer holding at most `capacity` undelivered events.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(partition: PartitionId, capacity: usize) -> Self {
        Self {
            partition,
            capacity: capacity.max(1),
            state: Mutex::new(BufferState::default()),
            ready: Condvar::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_credit_listener(&self, listener: Arc<dyn CreditListener>) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
    }

    /// Number of further events the transport may push right now.
    pub fn credit(&self) -> usize {
        match self.state.lock() {
            Ok(state) if !state.detached && !state.closed => {
                self.capacity.saturating_sub(state.events.len())
            }
            _ => 0,
        }
    }

    /// Number of events buffered but not yet drained.
    pub fn buffered(&self) -> usize {
        self.state.lock().map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn push(&self, event: ReceivedEvent) -> Result<(), PushRejected> {
        let mut state = self.state.lock().map_err(|_| PushRejected::Gone)?;
        if state.detached || state.closed {
            return Err(PushRejected::Gone);
        }
        if state.events.len() >= self.capacity {
            return Err(PushRejected::Full);
        }
        state.events.push_back(event);
        drop(state);

        self.ready.notify_all();
        Ok(())
    }

    /// Record a transport fault for the receiver to raise.
    pub fn fail(&self, error: TransportError) {
        if let Ok(mut state) = self.state.lock() {
            state.fault = Some(error);
        }
        self.ready.notify_all();
    }

    /// Mark the link as closed by the transport.
    pub fn detach(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.detached = true;
        }
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Close from the receiver side: drop buffered events and wake any waiter.
    pub(crate) fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.events.clear();
        }
        self.ready.notify_all();
    }

    /// Wait until something is available (or `deadline` passes), then take up
    /// to `max` events without waiting further.
    ///
    /// `deadline == None` waits without bound.
    pub(crate) fn drain(&self, max: usize, deadline: Option<Instant>) -> ReceiveResult<Drained> {
        let mut state = self.lock_state()?;

        loop {
            if state.closed {
                return Ok(Drained::Closed);
            }

            if !state.events.is_empty() {
                let take = max.min(state.events.len());
                let events: Vec<_> = state.events.drain(..take).collect();
                drop(state);

                self.return_credit();
                return Ok(Drained::Events(events));
            }

            if let Some(fault) = state.fault.take() {
                return Ok(Drained::Fault(fault));
            }

            if state.detached {
                return Ok(Drained::Detached);
            }

            state = match deadline {
                None => self.ready.wait(state).map_err(|_| poisoned())?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Drained::Events(Vec::new()));
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| poisoned())?
                        .0
                }
            };
        }
    }

    fn return_credit(&self) {
        let listener = self.listener.lock().ok().and_then(|l| l.clone());
        if let Some(listener) = listener {
            trace!(partition = %self.partition, "returning prefetch credit");
            listener.credit_available(&self.partition);
        }
    }

    fn lock_state(&self) -> ReceiveResult<MutexGuard<'_, BufferState>> {
        self.state.lock().map_err(|_| poisoned())
    }
}

fn poisoned() -> ReceiveError {
    ReceiveError::transport("prefetch buffer lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use chrono::Utc;
    use hubstream_core::{EventPosition, Offset, SequenceNumber};

    fn partition() -> PartitionId {
        PartitionId::new("0").unwrap()
    }

    fn event(seq: i64) -> ReceivedEvent {
        ReceivedEvent::new(
            partition(),
            EventPosition {
                offset: Offset::new(seq * 10),
                sequence_number: SequenceNumber::new(seq),
                enqueued_time: Utc::now(),
            },
            format!("e{seq}").into_bytes(),
        )
    }

    fn soon() -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(50))
    }

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl CreditListener for CountingListener {
        fn credit_available(&self, _partition: &PartitionId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn push_respects_capacity() {
        let buffer = PrefetchBuffer::new(partition(), 2);
        assert_eq!(buffer.credit(), 2);
        buffer.push(event(0)).unwrap();
        buffer.push(event(1)).unwrap();
        assert_eq!(buffer.credit(), 0);
        assert_eq!(buffer.push(event(2)), Err(PushRejected::Full));
    }

    #[test]
    fn drain_takes_at_most_max_and_returns_credit() {
        let buffer = PrefetchBuffer::new(partition(), 8);
        let listener = Arc::new(CountingListener::default());
        buffer.set_credit_listener(listener.clone());

        for seq in 0..5 {
            buffer.push(event(seq)).unwrap();
        }

        match buffer.drain(3, soon()).unwrap() {
            Drained::Events(events) => {
                let seqs: Vec<_> = events.iter().map(|e| e.sequence_number().value()).collect();
                assert_eq!(seqs, vec![0, 1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(buffer.buffered(), 2);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_drain_waits_until_deadline() {
        let buffer = PrefetchBuffer::new(partition(), 4);
        let started = Instant::now();
        match buffer.drain(10, Some(started + Duration::from_millis(30))).unwrap() {
            Drained::Events(events) => assert!(events.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn fault_is_raised_after_buffered_events() {
        let buffer = PrefetchBuffer::new(partition(), 4);
        buffer.push(event(0)).unwrap();
        buffer.fail(TransportError::new("reset"));

        assert!(matches!(buffer.drain(10, soon()).unwrap(), Drained::Events(e) if e.len() == 1));
        assert!(matches!(buffer.drain(10, soon()).unwrap(), Drained::Fault(_)));
        // One-shot: the next drain simply times out.
        assert!(matches!(buffer.drain(10, soon()).unwrap(), Drained::Events(e) if e.is_empty()));
    }

    #[test]
    fn detach_rejects_pushes_and_surfaces_after_drain() {
        let buffer = PrefetchBuffer::new(partition(), 4);
        buffer.push(event(0)).unwrap();
        buffer.detach();

        assert_eq!(buffer.push(event(1)), Err(PushRejected::Gone));
        assert!(matches!(buffer.drain(10, soon()).unwrap(), Drained::Events(e) if e.len() == 1));
        assert!(matches!(buffer.drain(10, soon()).unwrap(), Drained::Detached));
    }

    #[test]
    fn close_wakes_a_blocked_drain() {
        let buffer = Arc::new(PrefetchBuffer::new(partition(), 4));
        let waiter = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.drain(10, None))
        };

        thread::sleep(Duration::from_millis(20));
        buffer.close();

        let drained = waiter.join().unwrap().unwrap();
        assert!(matches!(drained, Drained::Closed));
        assert_eq!(buffer.credit(), 0);
    }

    #[test]
    fn push_wakes_a_blocked_drain() {
        let buffer = Arc::new(PrefetchBuffer::new(partition(), 4));
        let waiter = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.drain(10, Some(Instant::now() + Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        buffer.push(event(7)).unwrap();

        match waiter.join().unwrap().unwrap() {
            Drained::Events(events) => assert_eq!(events[0].sequence_number().value(), 7),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
