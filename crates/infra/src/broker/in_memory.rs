//! In-memory broker for tests/dev.
//!
//! - Partitions are append-only logs created on first use (or a fixed set,
//!   see [`InMemoryBrokerConfig::with_partition_count`]).
//! - Offsets are byte positions: each record advances the offset by its
//!   payload length plus a fixed header.
//! - Sequence numbers start at 0 and are gapless.
//! - Enqueue times have millisecond resolution and never go backwards.
//!
//! ## Delivery
//!
//! Appends and link opens deliver inline into the affected links' prefetch
//! buffers, as far as their credit allows. A single driver thread per broker
//! resumes delivery when a receiver drains its buffer and credit comes back.
//! The driver never blocks on a full buffer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use tracing::{debug, error, trace, warn};

use hubstream_client::{
    CreditListener, EventSender, LinkHandle, PartitionClient, PrefetchBuffer, PushRejected,
};
use hubstream_core::{
    ConsumerGroup, EventPosition, FilterExpression, Offset, PartitionId, ReceivedEvent,
    SequenceNumber, TransportError,
};

/// Framing overhead counted into every record's offset span.
pub const RECORD_HEADER_BYTES: i64 = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryBrokerConfig {
    /// Keep at most this many events per partition (oldest evicted first).
    pub retention: Option<usize>,
    /// Artificial latency of every link open.
    pub open_delay: Duration,
    /// Restrict the broker to partitions `"0"..="n-1"`.
    pub partition_count: Option<usize>,
}

impl InMemoryBrokerConfig {
    pub fn with_retention(mut self, max_events: usize) -> Self {
        self.retention = Some(max_events);
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_partition_count(mut self, count: usize) -> Self {
        self.partition_count = Some(count);
        self
    }
}

#[derive(Debug, Default)]
struct PartitionLog {
    events: VecDeque<ReceivedEvent>,
    next_offset: i64,
    next_sequence: i64,
    last_enqueued: Option<DateTime<Utc>>,
}

impl PartitionLog {
    fn tail(&self) -> Option<SequenceNumber> {
        (self.next_sequence > 0).then(|| SequenceNumber::new(self.next_sequence - 1))
    }

    fn first_retained(&self) -> i64 {
        self.events
            .front()
            .map(|e| e.sequence_number().value())
            .unwrap_or(self.next_sequence)
    }

    /// Enqueue time for the next record: `requested` (or now) clamped so the
    /// log stays non-decreasing. Without an explicit time, records get
    /// strictly increasing milliseconds.
    fn next_enqueued_time(&self, requested: Option<DateTime<Utc>>) -> DateTime<Utc> {
        match (requested, self.last_enqueued) {
            (Some(at), Some(last)) => at.max(last),
            (Some(at), None) => at,
            (None, last) => {
                let now = Utc::now().trunc_subsecs(3);
                match last {
                    Some(last) if now <= last => last + TimeDelta::milliseconds(1),
                    _ => now,
                }
            }
        }
    }
}

#[derive(Debug)]
struct LinkState {
    partition: PartitionId,
    filter: FilterExpression,
    buffer: Arc<PrefetchBuffer>,
    /// Next sequence number to deliver; `None` until the filter first matches.
    next: Option<i64>,
}

impl LinkState {
    /// Push as much as credit allows. Returns `false` once the receiver side is gone.
    fn pump(&mut self, log: &PartitionLog) -> bool {
        let first = log.first_retained();

        let mut idx = match self.next {
            Some(next) => {
                if next < first {
                    warn!(
                        partition = %self.partition,
                        expected = next,
                        oldest = first,
                        "events expired before delivery; skipping ahead"
                    );
                }
                (next - first).max(0) as usize
            }
            None => {
                let idx = log.events.partition_point(|e| !self.filter.matches(e));
                match log.events.get(idx) {
                    Some(event) => {
                        self.next = Some(event.sequence_number().value());
                        idx
                    }
                    None => return true,
                }
            }
        };

        while let Some(event) = log.events.get(idx) {
            match self.buffer.push(event.clone()) {
                Ok(()) => {
                    self.next = Some(event.sequence_number().value() + 1);
                    idx += 1;
                }
                Err(PushRejected::Full) => {
                    trace!(partition = %self.partition, "prefetch buffer full; waiting for credit");
                    break;
                }
                Err(PushRejected::Gone) => return false,
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    partitions: HashMap<PartitionId, PartitionLog>,
    links: HashMap<LinkHandle, LinkState>,
    pending: bool,
    shutdown: bool,
}

impl BrokerState {
    /// Deliver to every link; drop links whose receiver went away.
    fn deliver_all(&mut self) {
        let Self {
            partitions, links, ..
        } = self;
        links.retain(|handle, link| match partitions.get(&link.partition) {
            Some(log) => {
                let alive = link.pump(log);
                if !alive {
                    debug!(link = %handle, "dropping link of a closed receiver");
                }
                alive
            }
            None => true,
        });
    }

    fn deliver_partition(&mut self, partition: &PartitionId) {
        let Self {
            partitions, links, ..
        } = self;
        let Some(log) = partitions.get(partition) else {
            return;
        };
        links.retain(|_, link| link.partition != *partition || link.pump(log));
    }
}

#[derive(Debug)]
struct BrokerShared {
    config: InMemoryBrokerConfig,
    state: Mutex<BrokerState>,
    wake: Condvar,
}

impl BrokerShared {
    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::new("broker state lock poisoned"))
    }

    fn nudge(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.pending = true;
        }
        self.wake.notify_all();
    }

    fn check_partition(&self, partition: &PartitionId) -> Result<(), TransportError> {
        let Some(count) = self.config.partition_count else {
            return Ok(());
        };
        let known = partition
            .as_str()
            .parse::<usize>()
            .is_ok_and(|idx| idx < count);
        if known {
            Ok(())
        } else {
            Err(TransportError::new(format!("unknown partition '{partition}'"))
                .with_partition(partition.clone()))
        }
    }
}

/// Wakes the driver when a receiver hands back credit.
struct DriverWaker {
    shared: Weak<BrokerShared>,
}

impl CreditListener for DriverWaker {
    fn credit_available(&self, _partition: &PartitionId) {
        if let Some(shared) = self.shared.upgrade() {
            shared.nudge();
        }
    }
}

/// In-memory stream broker (transport and sender).
#[derive(Debug)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryBroker {
    pub fn new() -> Result<Self, TransportError> {
        Self::start(InMemoryBrokerConfig::default())
    }

    /// Create the broker and start its driver thread.
    pub fn start(config: InMemoryBrokerConfig) -> Result<Self, TransportError> {
        let shared = Arc::new(BrokerShared {
            config,
            state: Mutex::new(BrokerState::default()),
            wake: Condvar::new(),
        });

        let driver_shared = Arc::clone(&shared);
        let driver = thread::Builder::new()
            .name("hubstream-broker-driver".to_string())
            .spawn(move || drive(driver_shared))
            .map_err(|e| TransportError::new(format!("failed to spawn broker driver: {e}")))?;

        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Append with an explicit enqueue time (clamped to be no earlier than
    /// the partition's last one). Lets callers create timestamp ties.
    pub fn append_at(
        &self,
        partition: &PartitionId,
        payload: impl Into<Vec<u8>>,
        enqueued_time: DateTime<Utc>,
    ) -> Result<EventPosition, TransportError> {
        self.append_record(partition, payload.into(), BTreeMap::new(), Some(enqueued_time))
    }

    /// Retained events of `partition`, oldest first.
    pub fn events(&self, partition: &PartitionId) -> Vec<ReceivedEvent> {
        self.shared
            .lock()
            .ok()
            .and_then(|s| {
                s.partitions
                    .get(partition)
                    .map(|log| log.events.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Number of open links across all partitions.
    pub fn link_count(&self) -> usize {
        self.shared.lock().map(|s| s.links.len()).unwrap_or(0)
    }

    /// Report a transport fault on every open link of `partition`.
    ///
    /// Returns the number of links affected.
    pub fn inject_fault(&self, partition: &PartitionId, message: &str) -> usize {
        let Ok(state) = self.shared.lock() else {
            return 0;
        };
        let mut affected = 0;
        for link in state.links.values().filter(|l| l.partition == *partition) {
            link.buffer
                .fail(TransportError::new(message).with_partition(partition.clone()));
            affected += 1;
        }
        warn!(%partition, links = affected, message, "injected transport fault");
        affected
    }

    /// Close every link of `partition` from the broker side.
    pub fn detach_links(&self, partition: &PartitionId) -> usize {
        let Ok(mut state) = self.shared.lock() else {
            return 0;
        };
        let mut detached = 0;
        state.links.retain(|_, link| {
            if link.partition == *partition {
                link.buffer.detach();
                detached += 1;
                false
            } else {
                true
            }
        });
        debug!(%partition, links = detached, "detached links");
        detached
    }

    /// Stop the driver and detach every link. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.wake.notify_all();

        let driver = self.driver.lock().ok().and_then(|mut d| d.take());
        if let Some(driver) = driver {
            if driver.join().is_err() {
                error!("broker driver panicked");
            }
        }
    }

    fn append_record(
        &self,
        partition: &PartitionId,
        payload: Vec<u8>,
        properties: BTreeMap<String, String>,
        enqueued_time: Option<DateTime<Utc>>,
    ) -> Result<EventPosition, TransportError> {
        self.shared.check_partition(partition)?;

        let mut state = self.shared.lock()?;
        if state.shutdown {
            return Err(TransportError::new("broker is shut down").with_partition(partition.clone()));
        }

        let log = state.partitions.entry(partition.clone()).or_default();
        let position = EventPosition {
            offset: Offset::new(log.next_offset),
            sequence_number: SequenceNumber::new(log.next_sequence),
            enqueued_time: log.next_enqueued_time(enqueued_time),
        };

        log.next_offset += payload.len() as i64 + RECORD_HEADER_BYTES;
        log.next_sequence += 1;
        log.last_enqueued = Some(position.enqueued_time);
        log.events
            .push_back(ReceivedEvent::new(partition.clone(), position, payload).with_properties(properties));

        if let Some(max) = self.shared.config.retention {
            while log.events.len() > max {
                log.events.pop_front();
            }
        }

        state.deliver_partition(partition);
        trace!(
            %partition,
            sequence_number = %position.sequence_number,
            offset = %position.offset,
            "appended"
        );
        Ok(position)
    }
}

impl Drop for InMemoryBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PartitionClient for InMemoryBroker {
    fn open_link(
        &self,
        group: &ConsumerGroup,
        partition: &PartitionId,
        filter: &FilterExpression,
        buffer: Arc<PrefetchBuffer>,
    ) -> Result<LinkHandle, TransportError> {
        self.shared.check_partition(partition)?;

        if !self.shared.config.open_delay.is_zero() {
            thread::sleep(self.shared.config.open_delay);
        }

        buffer.set_credit_listener(Arc::new(DriverWaker {
            shared: Arc::downgrade(&self.shared),
        }));

        let mut state = self.shared.lock()?;
        if state.shutdown {
            return Err(TransportError::new("broker is shut down").with_partition(partition.clone()));
        }

        let handle = LinkHandle::new();
        state.links.insert(
            handle,
            LinkState {
                partition: partition.clone(),
                filter: *filter,
                buffer,
                next: None,
            },
        );
        state.deliver_partition(partition);

        debug!(%group, %partition, link = %handle, %filter, "link opened");
        Ok(handle)
    }

    fn close_link(&self, link: LinkHandle) {
        if let Ok(mut state) = self.shared.lock() {
            if state.links.remove(&link).is_some() {
                debug!(link = %link, "link closed");
            }
        }
    }

    fn last_sequence_number(
        &self,
        partition: &PartitionId,
    ) -> Result<Option<SequenceNumber>, TransportError> {
        self.shared.check_partition(partition)?;
        let state = self.shared.lock()?;
        Ok(state.partitions.get(partition).and_then(PartitionLog::tail))
    }
}

impl EventSender for InMemoryBroker {
    fn append_with_properties(
        &self,
        partition: &PartitionId,
        payload: Vec<u8>,
        properties: BTreeMap<String, String>,
    ) -> Result<EventPosition, TransportError> {
        self.append_record(partition, payload, properties, None)
    }
}

/// Driver loop: redeliver whenever credit comes back, until shutdown.
fn drive(shared: Arc<BrokerShared>) {
    debug!("broker driver started");

    let Ok(mut state) = shared.state.lock() else {
        error!("broker state poisoned; driver not started");
        return;
    };

    loop {
        if state.shutdown {
            break;
        }
        state.pending = false;
        state.deliver_all();

        state = match shared.wake.wait_while(state, |s| !s.pending && !s.shutdown) {
            Ok(state) => state,
            Err(_) => {
                error!("broker state poisoned; driver stopping");
                return;
            }
        };
    }

    for link in state.links.values() {
        link.buffer.detach();
    }
    state.links.clear();
    debug!("broker driver stopped");
}
