//! A single proxy queue.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use bytes::Bytes;
use log::debug;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    chunk::SliceAssembler,
    codec::MessageCodec,
    error::Result,
    message::{Message, MessageHandle, ReceiveTimeout},
    protocol::ChunkFlags,
    registry::ProxyId,
    session::{ConsumerSession, ConsumerSessionInner},
};

/// How a queue hands messages to its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Buffers pushed messages for synchronous receives or an unthrottled
    /// callback.
    ReadAhead,
    /// Delivers batches to a registered callback under flow control.
    Asynch,
}

/// Flow-control settings of an attached callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryLimits {
    /// Delivered messages that may await deletion or unlock; zero is
    /// unlimited.
    pub max_active_messages: usize,
    /// Messages per callback invocation; zero is treated as one.
    pub max_batch_size: usize,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Message>,
    outstanding: HashSet<MessageHandle>,
    limits: Option<DeliveryLimits>,
    started: bool,
    closed: bool,
    delivering: bool,
    delivery_task: bool,
    assembler: Option<SliceAssembler>,
}

impl QueueState {
    fn free_slots(&self, limits: DeliveryLimits) -> usize {
        if limits.max_active_messages == 0 {
            usize::MAX
        } else {
            limits
                .max_active_messages
                .saturating_sub(self.outstanding.len())
        }
    }

    fn deliverable(&self) -> bool {
        let Some(limits) = self.limits else {
            return false;
        };
        self.started
            && !self.closed
            && !self.delivering
            && !self.messages.is_empty()
            && self.free_slots(limits) > 0
    }
}

/// Buffers the messages pushed for one consumer session.
pub struct ProxyQueue {
    id: ProxyId,
    kind: QueueKind,
    batch: u16,
    state: Mutex<QueueState>,
    version: watch::Sender<u64>,
    session: Mutex<Weak<ConsumerSessionInner>>,
    pub(super) shutdown: CancellationToken,
}

impl std::fmt::Debug for ProxyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyQueue")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl ProxyQueue {
    pub(crate) fn new(id: ProxyId, kind: QueueKind, batch: u16) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            batch,
            state: Mutex::new(QueueState::default()),
            version: watch::channel(0).0,
            session: Mutex::new(Weak::new()),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> ProxyId { self.id }

    #[must_use]
    pub fn kind(&self) -> QueueKind { self.kind }

    #[must_use]
    pub fn is_read_ahead(&self) -> bool { self.kind == QueueKind::ReadAhead }

    /// Sequence number of the message batch this queue accepts.
    #[must_use]
    pub fn batch_sequence(&self) -> u16 { self.batch }

    /// Messages buffered and not yet handed out.
    #[must_use]
    pub fn buffered(&self) -> usize { self.lock_state().messages.len() }

    /// Delivered messages still awaiting deletion or unlock.
    #[must_use]
    pub fn outstanding(&self) -> usize { self.lock_state().outstanding.len() }

    #[must_use]
    pub fn is_started(&self) -> bool { self.lock_state().started }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.lock_state().closed }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) { self.version.send_modify(|version| *version = version.wrapping_add(1)); }

    /// Wait until `probe` yields a value.
    ///
    /// The subscription is taken before the first probe so no state change
    /// between the probe and the wait is missed.
    async fn wait_for<T>(&self, mut probe: impl FnMut(&mut QueueState) -> Option<T>) -> T {
        let mut changes = self.version.subscribe();
        loop {
            let ready = {
                let mut state = self.lock_state();
                probe(&mut *state)
            };
            if let Some(value) = ready {
                return value;
            }
            if changes.changed().await.is_err() {
                // The sender lives as long as `self`.
                std::future::pending::<()>().await;
            }
        }
    }

    pub(crate) fn set_consumer_session(&self, session: Weak<ConsumerSessionInner>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    pub(super) fn session(&self) -> Option<ConsumerSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .map(ConsumerSession::from_arc)
    }

    /// Buffer a message pushed for batch `batch`.
    ///
    /// Messages from an earlier batch, or arriving after close, are dropped.
    /// Returns whether the message was accepted.
    pub fn put(&self, batch: u16, message: Message) -> bool {
        {
            let mut state = self.lock_state();
            if state.closed || batch != self.batch {
                debug!(
                    "queue {} dropped message for batch {batch} (current {})",
                    self.id, self.batch
                );
                return false;
            }
            state.messages.push_back(message);
        }
        self.notify();
        true
    }

    /// Add one slice of a chunked push, buffering the message once the last
    /// slice arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Chunk`](crate::error::ProxyError::Chunk) for an
    /// out-of-order slice or a codec error for an undecodable message.
    pub(crate) fn add_message_part(
        &self,
        batch: u16,
        flags: ChunkFlags,
        slice: Bytes,
        codec: &dyn MessageCodec,
    ) -> Result<()> {
        let complete = {
            let mut state = self.lock_state();
            let assembler = state.assembler.get_or_insert_with(SliceAssembler::new);
            let complete = assembler.push(flags, slice)?;
            if complete.is_some() {
                state.assembler = None;
            }
            complete
        };
        if let Some(slices) = complete {
            self.put(batch, codec.decode(&slices)?);
        }
        Ok(())
    }

    /// Allow delivery and synchronous receives.
    pub fn start(self: &Arc<Self>) {
        self.lock_state().started = true;
        self.notify();
        self.ensure_delivery_task();
    }

    /// Stop handing out messages and wait for any in-flight delivery to end.
    pub async fn stopping(&self) {
        self.lock_state().started = false;
        self.notify();
        self.wait_for(|state| (!state.delivering).then_some(())).await;
    }

    /// Record that the session has finished stopping.
    pub fn stopped(&self) {
        debug!("queue {} stopped with {} buffered", self.id, self.buffered());
    }

    /// Wait for any in-flight delivery to end ahead of a close.
    pub async fn closing(&self) {
        self.lock_state().started = false;
        self.notify();
        self.wait_for(|state| (!state.delivering).then_some(())).await;
    }

    /// Close the queue, dropping buffered messages and ending delivery.
    pub fn closed(&self) {
        {
            let mut state = self.lock_state();
            state.closed = true;
            state.started = false;
            state.messages.clear();
            state.outstanding.clear();
            state.assembler = None;
        }
        self.shutdown.cancel();
        self.notify();
    }

    /// Attach a callback with the given limits, starting delivery if needed.
    pub(crate) fn attach(self: &Arc<Self>, limits: DeliveryLimits) {
        self.lock_state().limits = Some(limits);
        self.notify();
        self.ensure_delivery_task();
    }

    /// Detach the callback; buffered messages stay for synchronous receive.
    pub(crate) fn detach(&self) {
        self.lock_state().limits = None;
        self.notify();
    }

    #[must_use]
    pub fn has_callback(&self) -> bool { self.lock_state().limits.is_some() }

    fn ensure_delivery_task(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.delivery_task || state.closed || state.limits.is_none() {
                return;
            }
            state.delivery_task = true;
        }
        tokio::spawn(super::delivery::run(Arc::clone(self)));
    }

    pub(super) fn delivery_task_ended(&self) { self.lock_state().delivery_task = false; }

    /// Wait until a batch could be delivered.
    pub(super) async fn wait_deliverable(&self) {
        self.wait_for(|state| state.deliverable().then_some(())).await;
    }

    /// Take the next batch and mark delivery as in flight.
    ///
    /// Returns `None` when nothing may be delivered right now.
    pub(crate) fn take_batch(&self) -> Option<Vec<Message>> {
        let mut state = self.lock_state();
        if !state.deliverable() {
            return None;
        }
        let limits = state.limits?;
        let count = limits
            .max_batch_size
            .max(1)
            .min(state.free_slots(limits))
            .min(state.messages.len());
        let batch: Vec<Message> = state.messages.drain(..count).collect();
        if limits.max_active_messages > 0 {
            state
                .outstanding
                .extend(batch.iter().filter_map(|message| message.handle));
        }
        state.delivering = true;
        Some(batch)
    }

    /// Mark the in-flight delivery as finished.
    pub(crate) fn delivery_finished(&self) {
        self.lock_state().delivering = false;
        self.notify();
    }

    /// Take a buffered message without waiting.
    #[must_use]
    pub fn receive_no_wait(&self) -> Option<Message> {
        let mut state = self.lock_state();
        if state.closed || !state.started {
            return None;
        }
        state.messages.pop_front()
    }

    /// Take a buffered message, waiting up to `timeout` for one to arrive.
    pub async fn receive(&self, timeout: ReceiveTimeout) -> Option<Message> {
        let wait = self.wait_for(|state| {
            if state.closed {
                return Some(None);
            }
            if state.started {
                state.messages.pop_front().map(Some)
            } else {
                None
            }
        });
        match timeout.duration() {
            None => wait.await,
            Some(limit) if limit.is_zero() => self.receive_no_wait(),
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
        }
    }

    /// Release the active-message slots held by `handles`.
    pub fn complete(&self, handles: &[MessageHandle]) {
        {
            let mut state = self.lock_state();
            for handle in handles {
                state.outstanding.remove(handle);
            }
        }
        self.notify();
    }

    /// Drop every buffered message and outstanding slot.
    ///
    /// Returns the number of buffered messages discarded.
    pub fn purge(&self) -> usize {
        let purged = {
            let mut state = self.lock_state();
            state.outstanding.clear();
            state.assembler = None;
            let purged = state.messages.len();
            state.messages.clear();
            purged
        };
        self.notify();
        purged
    }
}
