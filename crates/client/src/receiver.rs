//! Partition receiver: one cursor over one (consumer group, partition) pair.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──open──► Opening ──link up──► Open ⇄ Receiving
//!    ▲                 │                   │
//!    └── open failed ──┘                   │
//!  any state ──────────── close ─────────► Closed (terminal)
//! ```
//!
//! The link is opened on a short-lived background thread, so construction
//! never blocks. A `receive` issued before the link is up waits for it (up to
//! the open timeout) and fails with `NotReady` otherwise.
//!
//! ## Serialization
//!
//! Concurrent `receive` calls on one receiver are serialized by the session
//! lock: the second caller waits until the first returns. `close` never takes
//! that lock, so it can interrupt an in-flight receive, which then returns
//! `Closed` promptly.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use hubstream_core::{
    Batch, ConsumerGroup, CursorResolver, EventPosition, FilterExpression, PartitionId, Position,
    ReceiveError, ReceiveResult,
};

use crate::buffer::PrefetchBuffer;
use crate::config::ResolvedOptions;
use crate::fetch::FetchEngine;
use crate::transport::{LinkHandle, PartitionClient};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReceiverState {
    Created,
    Opening,
    Open,
    Receiving,
    Closed,
}

impl core::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Receiving => "receiving",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Current read position of a receiver.
///
/// Replaced wholesale when the receiver is repositioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    position: Position,
    filter: FilterExpression,
    last_delivered: Option<EventPosition>,
}

impl Cursor {
    fn new(position: Position, filter: FilterExpression) -> Self {
        Self {
            position,
            filter,
            last_delivered: None,
        }
    }

    /// Position the cursor was opened from.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Filter the link was opened with.
    pub fn filter(&self) -> FilterExpression {
        self.filter
    }

    pub fn last_delivered(&self) -> Option<EventPosition> {
        self.last_delivered
    }

    /// Position that reopens exactly after the last delivered event.
    pub fn resume_position(&self) -> Position {
        match self.last_delivered {
            Some(last) => Position::sequence_number(last.sequence_number),
            None => self.position,
        }
    }
}

struct LinkRef {
    handle: LinkHandle,
    buffer: Arc<PrefetchBuffer>,
}

struct OpenedLink {
    link: LinkRef,
    engine: FetchEngine,
    cursor: Cursor,
}

struct Lifecycle {
    state: ReceiverState,
    /// Bumped on every (re)open and on close; stale opener threads compare it.
    generation: u64,
    requested: Position,
    cursor: Option<Cursor>,
    link: Option<LinkRef>,
    /// Engine of a freshly opened link, waiting to be picked up by a receive.
    handoff: Option<FetchEngine>,
    open_error: Option<ReceiveError>,
}

#[derive(Default)]
struct Session {
    generation: u64,
    engine: Option<FetchEngine>,
}

pub(crate) struct ReceiverShared {
    client: Arc<dyn PartitionClient>,
    group: ConsumerGroup,
    partition: PartitionId,
    options: ResolvedOptions,
    resolver: CursorResolver,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    session: Mutex<Session>,
}

/// Handle to a partition receiver.
///
/// Clones share the same cursor and link.
#[derive(Clone)]
pub struct PartitionReceiver {
    shared: Arc<ReceiverShared>,
}

impl core::fmt::Debug for PartitionReceiver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartitionReceiver")
            .field("group", &self.shared.group)
            .field("partition", &self.shared.partition)
            .field("state", &self.state())
            .finish()
    }
}

impl PartitionReceiver {
    pub(crate) fn new(
        client: Arc<dyn PartitionClient>,
        group: ConsumerGroup,
        partition: PartitionId,
        position: Position,
        options: ResolvedOptions,
    ) -> ReceiveResult<Self> {
        position.validate()?;

        let shared = ReceiverShared {
            client,
            group,
            partition,
            options,
            resolver: CursorResolver::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: ReceiverState::Created,
                generation: 0,
                requested: position,
                cursor: None,
                link: None,
                handoff: None,
                open_error: None,
            }),
            changed: Condvar::new(),
            session: Mutex::new(Session::default()),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<ReceiverShared> {
        &self.shared
    }

    pub(crate) fn from_shared(shared: Arc<ReceiverShared>) -> Self {
        Self { shared }
    }

    pub fn consumer_group(&self) -> &ConsumerGroup {
        &self.shared.group
    }

    pub fn partition(&self) -> &PartitionId {
        &self.shared.partition
    }

    pub fn state(&self) -> ReceiverState {
        self.shared
            .lifecycle
            .lock()
            .map(|lc| lc.state)
            .unwrap_or(ReceiverState::Closed)
    }

    /// Start opening the link for the initial position.
    ///
    /// No-op unless the receiver is `Created`.
    pub fn open(&self) -> ReceiveResult<()> {
        let mut lc = self.shared.lock_lifecycle()?;
        match lc.state {
            ReceiverState::Closed => Err(ReceiveError::Closed),
            ReceiverState::Created => {
                let position = lc.requested;
                self.begin_open(&mut lc, position);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Receive up to `max_batch_size` events, waiting at most `timeout` for
    /// the first one.
    ///
    /// Returns an empty batch when nothing arrived in time.
    #[instrument(
        level = "debug",
        skip(self),
        fields(group = %self.shared.group, partition = %self.shared.partition),
        err
    )]
    pub fn receive(&self, max_batch_size: usize, timeout: Duration) -> ReceiveResult<Batch> {
        if max_batch_size == 0 {
            return Err(ReceiveError::invalid_argument(
                "max_batch_size must be at least 1",
            ));
        }

        let started = Instant::now();
        let mut session = self.shared.lock_session()?;

        self.await_link(&mut session)?;

        let remaining = timeout.saturating_sub(started.elapsed());
        let result = match session.engine.as_mut() {
            Some(engine) => engine.fetch(max_batch_size, remaining),
            None => Err(ReceiveError::NotReady {
                partition: self.shared.partition.clone(),
                waited: self.shared.options.open_timeout,
            }),
        };

        self.finish_receive(&session, &result);
        result
    }

    /// Receive with the configured default batch size.
    pub fn receive_batch(&self, timeout: Duration) -> ReceiveResult<Batch> {
        self.receive(self.shared.options.max_batch_size, timeout)
    }

    /// Receive with the configured default batch size and timeout.
    pub fn receive_default(&self) -> ReceiveResult<Batch> {
        self.receive(
            self.shared.options.max_batch_size,
            self.shared.options.receive_timeout,
        )
    }

    /// Reopen the link at `position`.
    ///
    /// Buffered-but-undelivered events of the old link are discarded; waits
    /// for an in-flight receive to finish first.
    #[instrument(skip(self), fields(partition = %self.shared.partition), err)]
    pub fn reposition(&self, position: Position) -> ReceiveResult<()> {
        position.validate()?;

        let mut session = self.shared.lock_session()?;
        let old = {
            let mut lc = self.shared.lock_lifecycle()?;
            if lc.state == ReceiverState::Closed {
                return Err(ReceiveError::Closed);
            }
            session.engine = None;
            lc.cursor = None;
            let old = lc.link.take();
            self.begin_open(&mut lc, position);
            old
        };
        drop(session);

        if let Some(old) = old {
            self.shared.release(old);
        }
        Ok(())
    }

    /// Close the receiver and its link. Idempotent.
    ///
    /// An in-flight `receive` returns `Closed` promptly.
    pub fn close(&self) {
        let link = {
            let mut lc = match self.shared.lifecycle.lock() {
                Ok(lc) => lc,
                Err(poisoned) => poisoned.into_inner(),
            };
            if lc.state == ReceiverState::Closed {
                return;
            }
            lc.state = ReceiverState::Closed;
            lc.generation += 1;
            lc.handoff = None;
            lc.link.take()
        };
        self.shared.changed.notify_all();

        if let Some(link) = link {
            self.shared.release(link);
        }
        debug!(partition = %self.shared.partition, "receiver closed");
    }

    /// Snapshot of the current cursor (`None` until a link is open).
    pub fn cursor(&self) -> Option<Cursor> {
        self.shared
            .lifecycle
            .lock()
            .ok()
            .and_then(|lc| lc.cursor.clone())
    }

    pub fn last_delivered(&self) -> Option<EventPosition> {
        self.cursor().and_then(|c| c.last_delivered())
    }

    /// Position to reopen from to continue right after the last delivered
    /// event (or at the requested position if nothing was delivered yet).
    pub fn resume_position(&self) -> Position {
        match self.shared.lifecycle.lock() {
            Ok(lc) => lc
                .cursor
                .as_ref()
                .map(Cursor::resume_position)
                .unwrap_or(lc.requested),
            Err(poisoned) => poisoned.into_inner().requested,
        }
    }

    fn begin_open(&self, lc: &mut Lifecycle, position: Position) {
        lc.generation += 1;
        lc.state = ReceiverState::Opening;
        lc.requested = position;
        lc.open_error = None;
        lc.handoff = None;

        let generation = lc.generation;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("hubstream-open-{}", self.shared.partition))
            .spawn(move || shared.complete_open(generation, position));

        match spawned {
            Ok(_) => debug!(partition = %self.shared.partition, %position, "opening link"),
            Err(e) => {
                lc.state = ReceiverState::Created;
                lc.open_error = Some(ReceiveError::transport(format!(
                    "failed to spawn link opener: {e}"
                )));
            }
        }
    }

    /// Wait (bounded by the open timeout) until this session holds the engine
    /// of the current link.
    fn await_link(&self, session: &mut Session) -> ReceiveResult<()> {
        let shared = &self.shared;
        let mut lc = shared.lock_lifecycle()?;

        if lc.state == ReceiverState::Created && lc.open_error.is_none() {
            let position = lc.requested;
            self.begin_open(&mut lc, position);
        }

        let waited = shared.options.open_timeout;
        let deadline = Instant::now().checked_add(waited);

        loop {
            if lc.state == ReceiverState::Closed {
                return Err(ReceiveError::Closed);
            }
            if let Some(err) = &lc.open_error {
                return Err(err.clone());
            }
            if let Some(engine) = lc.handoff.take() {
                session.engine = Some(engine);
                session.generation = lc.generation;
            }
            if session.engine.is_some()
                && session.generation == lc.generation
                && matches!(lc.state, ReceiverState::Open | ReceiverState::Receiving)
            {
                lc.state = ReceiverState::Receiving;
                return Ok(());
            }

            lc = match deadline {
                None => shared.changed.wait(lc).map_err(|_| lifecycle_poisoned())?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ReceiveError::NotReady {
                            partition: shared.partition.clone(),
                            waited,
                        });
                    }
                    shared
                        .changed
                        .wait_timeout(lc, deadline - now)
                        .map_err(|_| lifecycle_poisoned())?
                        .0
                }
            };
        }
    }

    fn finish_receive(&self, session: &Session, result: &ReceiveResult<Batch>) {
        let Ok(mut lc) = self.shared.lifecycle.lock() else {
            return;
        };
        if lc.state == ReceiverState::Receiving {
            lc.state = ReceiverState::Open;
        }
        if lc.generation != session.generation {
            return;
        }
        if let (Ok(batch), Some(cursor)) = (result, lc.cursor.as_mut()) {
            if let Some(last) = batch.last_position() {
                cursor.last_delivered = Some(last);
            }
        }
    }
}

impl ReceiverShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.lifecycle
            .lock()
            .map(|lc| lc.state == ReceiverState::Closed)
            .unwrap_or(true)
    }

    fn establish(&self, position: &Position) -> ReceiveResult<OpenedLink> {
        let tail = if position.requires_partition_tail() {
            self.client.last_sequence_number(&self.partition)?
        } else {
            None
        };
        let filter = self.resolver.resolve(position, tail)?;

        let buffer = Arc::new(PrefetchBuffer::new(
            self.partition.clone(),
            self.options.prefetch,
        ));
        let handle = self
            .client
            .open_link(&self.group, &self.partition, &filter, Arc::clone(&buffer))?;

        debug!(
            group = %self.group,
            partition = %self.partition,
            link = %handle,
            %filter,
            "link open"
        );

        Ok(OpenedLink {
            engine: FetchEngine::new(Arc::clone(&buffer)),
            link: LinkRef { handle, buffer },
            cursor: Cursor::new(*position, filter),
        })
    }

    fn complete_open(&self, generation: u64, position: Position) {
        let outcome = self.establish(&position);

        let mut lc = match self.lifecycle.lock() {
            Ok(lc) => lc,
            Err(_) => {
                if let Ok(opened) = outcome {
                    self.release(opened.link);
                }
                return;
            }
        };

        if lc.generation != generation || lc.state == ReceiverState::Closed {
            drop(lc);
            if let Ok(opened) = outcome {
                debug!(partition = %self.partition, "discarding link of a superseded open");
                self.release(opened.link);
            }
            return;
        }

        match outcome {
            Ok(opened) => {
                lc.link = Some(opened.link);
                lc.handoff = Some(opened.engine);
                lc.cursor = Some(opened.cursor);
                lc.state = ReceiverState::Open;
            }
            Err(err) => {
                warn!(partition = %self.partition, error = %err, "failed to open link");
                lc.open_error = Some(err);
                lc.state = ReceiverState::Created;
            }
        }
        drop(lc);
        self.changed.notify_all();
    }

    fn release(&self, link: LinkRef) {
        link.buffer.close();
        self.client.close_link(link.handle);
    }

    fn lock_lifecycle(&self) -> ReceiveResult<MutexGuard<'_, Lifecycle>> {
        self.lifecycle.lock().map_err(|_| lifecycle_poisoned())
    }

    fn lock_session(&self) -> ReceiveResult<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| ReceiveError::transport("receiver session lock poisoned"))
    }
}

impl Drop for ReceiverShared {
    fn drop(&mut self) {
        let link = match self.lifecycle.get_mut() {
            Ok(lc) => lc.link.take(),
            Err(poisoned) => poisoned.into_inner().link.take(),
        };
        if let Some(link) = link {
            self.release(link);
        }
    }
}

fn lifecycle_poisoned() -> ReceiveError {
    ReceiveError::transport("receiver lifecycle lock poisoned")
}
