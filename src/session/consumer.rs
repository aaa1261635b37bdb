//! Consumer sessions.
//!
//! A consumer session moves between [`SessionState`]s under two locks: the
//! callback lock, held by every state change and by each asynchronous
//! delivery, and the synchronous-operation lock, held by receives and by
//! message completion. The callback lock is always taken first.
//!
//! A callback runs with a task-local marker naming its session. Calls the
//! callback makes on that same session do not touch the locks; they move a
//! [`CallbackThreadState`] that is replayed once the callback returns.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::FutureExt;
use log::{debug, error};
use tokio::sync::Mutex as AsyncMutex;

mod callback;
mod receive;
mod registration;
mod state;

pub use callback::{CallbackRegistration, ConsumerCallback};
use state::{CallbackIntent, CallbackThreadState};
pub use state::SessionState;

use super::SessionCore;
use crate::{
    chunk::SliceAssembler,
    completion::cascade,
    connection::Connection,
    error::{ProxyError, Result},
    message::{DestinationAddress, DestinationType, Reliability},
    metrics,
    ordering::OrderingContext,
    protocol::Segment,
    proxy_queue::ProxyQueue,
    registry::ProxyId,
};

tokio::task_local! {
    static CALLBACK_CONTEXT: u64;
}

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

/// Everything a connection learns while creating a consumer session.
pub(crate) struct ConsumerParts {
    pub(crate) proxy_id: ProxyId,
    pub(crate) connection: Connection,
    pub(crate) message_processor_id: i64,
    pub(crate) destination: DestinationAddress,
    pub(crate) destination_type: Option<DestinationType>,
    pub(crate) unrecoverable_reliability: Reliability,
    pub(crate) bifurcatable: bool,
    pub(crate) read_ahead_queue: Option<Arc<ProxyQueue>>,
}

struct ConsumerState {
    state: SessionState,
    read_ahead: bool,
    proxy_queue: Option<Arc<ProxyQueue>>,
    callback: Option<CallbackRegistration>,
    ordering: Option<OrderingContext>,
    receiving_with_wait: bool,
    pending_slices: Option<SliceAssembler>,
    callback_thread: CallbackIntent,
}

pub(crate) struct ConsumerSessionInner {
    key: u64,
    core: SessionCore,
    message_processor_id: i64,
    destination: DestinationAddress,
    destination_type: Option<DestinationType>,
    unrecoverable_reliability: Reliability,
    bifurcatable: bool,
    callback_lock: AsyncMutex<()>,
    synch_lock: AsyncMutex<()>,
    state: Mutex<ConsumerState>,
}

/// Client-side proxy for a consumer session on the messaging engine.
#[derive(Clone)]
pub struct ConsumerSession(Arc<ConsumerSessionInner>);

impl std::fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("proxy_id", &self.proxy_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConsumerSession {
    pub(crate) fn new(parts: ConsumerParts) -> Self {
        let read_ahead = parts.read_ahead_queue.is_some();
        let session = Self(Arc::new(ConsumerSessionInner {
            key: NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed),
            core: SessionCore::new(parts.proxy_id, parts.connection, metrics::SessionKind::Consumer),
            message_processor_id: parts.message_processor_id,
            destination: parts.destination,
            destination_type: parts.destination_type,
            unrecoverable_reliability: parts.unrecoverable_reliability,
            bifurcatable: parts.bifurcatable,
            callback_lock: AsyncMutex::new(()),
            synch_lock: AsyncMutex::new(()),
            state: Mutex::new(ConsumerState {
                state: SessionState::Stopped,
                read_ahead,
                proxy_queue: parts.read_ahead_queue,
                callback: None,
                ordering: None,
                receiving_with_wait: false,
                pending_slices: None,
                callback_thread: CallbackIntent::default(),
            }),
        }));
        if let Some(queue) = session.lock_state().proxy_queue.as_ref() {
            queue.set_consumer_session(session.downgrade());
        }
        session
    }

    pub(crate) fn from_arc(inner: Arc<ConsumerSessionInner>) -> Self { Self(inner) }

    pub(crate) fn downgrade(&self) -> Weak<ConsumerSessionInner> { Arc::downgrade(&self.0) }

    #[must_use]
    pub fn proxy_id(&self) -> ProxyId { self.0.core.proxy_id() }

    #[must_use]
    pub fn connection(&self) -> &Connection { self.0.core.connection() }

    /// Identifier of the engine-side consumer, used to create bifurcated
    /// sessions.
    #[must_use]
    pub fn message_processor_id(&self) -> i64 { self.0.message_processor_id }

    #[must_use]
    pub fn destination(&self) -> &DestinationAddress { &self.0.destination }

    #[must_use]
    pub fn destination_type(&self) -> Option<DestinationType> { self.0.destination_type }

    #[must_use]
    pub fn unrecoverable_reliability(&self) -> Reliability { self.0.unrecoverable_reliability }

    #[must_use]
    pub fn is_bifurcatable(&self) -> bool { self.0.bifurcatable }

    #[must_use]
    pub fn state(&self) -> SessionState { self.lock_state().state }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.state().is_closed() }

    /// Returns true while pushed messages are buffered for synchronous
    /// receive.
    #[must_use]
    pub fn is_read_ahead(&self) -> bool { self.lock_state().read_ahead }

    #[must_use]
    pub fn is_registered(&self) -> bool { self.lock_state().callback.is_some() }

    /// The queue pushed messages land on, if any.
    #[must_use]
    pub fn proxy_queue(&self) -> Option<Arc<ProxyQueue>> { self.lock_state().proxy_queue.clone() }

    /// The ordering context held by the current registration.
    #[must_use]
    pub fn ordering_context(&self) -> Option<OrderingContext> { self.lock_state().ordering.clone() }

    fn lock_state(&self) -> MutexGuard<'_, ConsumerState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when called from this session's own callback.
    pub(crate) fn executing_on_callback_thread(&self) -> bool {
        CALLBACK_CONTEXT
            .try_with(|key| *key == self.0.key)
            .unwrap_or(false)
    }

    fn unavailable(&self) -> ProxyError {
        ProxyError::SessionUnavailable(format!("consumer session {} is closed", self.proxy_id()))
    }

    fn check_not_closed(&self) -> Result<()> {
        if self.lock_state().state.is_closed() || self.connection().is_closed() {
            return Err(self.unavailable());
        }
        Ok(())
    }

    /// Move the callback-context state, failing once the session or the
    /// callback context has closed.
    fn in_callback(&self, change: impl FnOnce(&mut CallbackIntent) -> Result<()>) -> Result<()> {
        let mut state = self.lock_state();
        if state.state.is_closed() || state.callback_thread.state == CallbackThreadState::Closed {
            return Err(self.unavailable());
        }
        change(&mut state.callback_thread)
    }

    /// Start delivery.
    ///
    /// A start during a stop is remembered and applied once the stop
    /// finishes.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once the session has closed,
    /// or the peer's error if the start flow fails.
    pub async fn start(&self) -> Result<()> {
        if self.executing_on_callback_thread() {
            return self.in_callback(|intent| {
                intent.state = intent.state.started();
                Ok(())
            });
        }
        let _callback = self.0.callback_lock.lock().await;
        let _synch = self.0.synch_lock.lock().await;
        let current = self.lock_state().state;
        match current {
            SessionState::Closing | SessionState::Closed => Err(self.unavailable()),
            SessionState::Started | SessionState::StoppingThenStarted => Ok(()),
            SessionState::Stopping => {
                self.lock_state().state = SessionState::StoppingThenStarted;
                Ok(())
            }
            SessionState::Stopped => self.start_internal().await,
        }
    }

    /// Both locks must be held.
    async fn start_internal(&self) -> Result<()> {
        let queue = {
            let mut state = self.lock_state();
            state.state = SessionState::Started;
            state.proxy_queue.clone()
        };
        if let Some(queue) = &queue {
            queue.start();
        }
        if let Err(err) = self.0.core.control(Segment::START_SESS, cascade::SESSION_CONTROL).await {
            {
                let mut state = self.lock_state();
                if state.state == SessionState::Started {
                    state.state = SessionState::Stopped;
                }
            }
            if let Some(queue) = &queue {
                queue.stopping().await;
            }
            return Err(err);
        }
        debug!("consumer session {} started", self.proxy_id());
        Ok(())
    }

    /// Stop delivery, waiting for any in-flight callback to return.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once the session has closed,
    /// or the peer's error if the stop flow fails.
    pub async fn stop(&self) -> Result<()> { self.stop_internal(true).await }

    async fn stop_internal(&self, notify_peer: bool) -> Result<()> {
        if self.executing_on_callback_thread() {
            return self.in_callback(|intent| {
                intent.state = intent.state.stopped();
                Ok(())
            });
        }
        let queue = {
            let _callback = self.0.callback_lock.lock().await;
            let _synch = self.0.synch_lock.lock().await;
            let mut state = self.lock_state();
            match state.state {
                SessionState::Closing | SessionState::Closed => return Err(self.unavailable()),
                SessionState::Stopped | SessionState::Stopping => return Ok(()),
                SessionState::StoppingThenStarted => {
                    state.state = SessionState::Stopping;
                    return Ok(());
                }
                SessionState::Started => {
                    state.state = SessionState::Stopping;
                    state.proxy_queue.clone()
                }
            }
        };
        if let Some(queue) = &queue {
            queue.stopping().await;
        }
        let flowed = if notify_peer {
            self.0.core.control(Segment::STOP_SESS, cascade::SESSION_CONTROL).await
        } else {
            Ok(())
        };

        let _callback = self.0.callback_lock.lock().await;
        let _synch = self.0.synch_lock.lock().await;
        let restart = {
            let mut state = self.lock_state();
            let restart = state.state == SessionState::StoppingThenStarted;
            if matches!(state.state, SessionState::Stopping | SessionState::StoppingThenStarted) {
                state.state = SessionState::Stopped;
            }
            restart
        };
        if let Some(queue) = &queue {
            queue.stopped();
        }
        debug!("consumer session {} stopped", self.proxy_id());
        if restart {
            self.start_internal().await?;
        }
        flowed
    }

    /// Close the session and tell the peer.
    ///
    /// Closing an already closed session does nothing.
    ///
    /// # Errors
    ///
    /// Returns the peer's error if the close flow fails; the session is
    /// closed locally regardless.
    pub async fn close(&self) -> Result<()> { self.close_internal(false).await }

    /// Close the session.
    ///
    /// With `closing_connection` the owning connection is tearing down: no
    /// flow is sent and the session locks are not taken, since the
    /// connection already holds its close lock exclusively.
    pub(crate) async fn close_internal(&self, closing_connection: bool) -> Result<()> {
        if closing_connection {
            self.finish_close();
            return Ok(());
        }
        if self.executing_on_callback_thread() {
            self.lock_state().callback_thread.state = CallbackThreadState::Closed;
            return Ok(());
        }
        let queue = {
            let _callback = self.0.callback_lock.lock().await;
            let _synch = self.0.synch_lock.lock().await;
            let mut state = self.lock_state();
            if state.state.is_closed() {
                return Ok(());
            }
            state.state = SessionState::Closing;
            state.proxy_queue.clone()
        };
        if let Some(queue) = &queue {
            queue.closing().await;
        }
        let flowed = if self.connection().is_closed() {
            Ok(())
        } else {
            let request = self.0.core.request();
            self.0
                .core
                .exchange(Segment::CLOSE_CONSUMER_SESS, request, cascade::SESSION_CLOSE)
                .await
                .map(drop)
        };
        self.finish_close();
        self.connection().consumer_closed_notification(self.proxy_id());
        flowed
    }

    fn finish_close(&self) {
        let (queue, ordering) = {
            let mut state = self.lock_state();
            state.state = SessionState::Closed;
            state.callback = None;
            state.pending_slices = None;
            (state.proxy_queue.take(), state.ordering.take())
        };
        if let Some(queue) = queue {
            queue.closed();
            if let Some(group) = self.connection().existing_queue_group() {
                group.bury(self.proxy_id());
            }
        }
        if let Some(ordering) = ordering {
            ordering.decrement_use_count();
        }
        if self.0.core.mark_closed() {
            debug!("consumer session {} closed", self.proxy_id());
        }
    }

    /// Hand the next batch of `queue` to the registered callback, then apply
    /// whatever the callback asked for.
    pub(crate) async fn deliver_from(&self, queue: &Arc<ProxyQueue>) -> Result<()> {
        let intent = {
            let _callback = self.0.callback_lock.lock().await;
            let registration = {
                let state = self.lock_state();
                if state.state == SessionState::Started {
                    state.callback.clone()
                } else {
                    None
                }
            };
            let Some(registration) = registration else {
                return Ok(());
            };
            let Some(batch) = queue.take_batch() else {
                return Ok(());
            };
            self.lock_state().callback_thread = CallbackIntent::default();
            let delivery = CALLBACK_CONTEXT.scope(
                self.0.key,
                registration.callback().consume_messages(self, batch),
            );
            if let Err(panic) = AssertUnwindSafe(delivery).catch_unwind().await {
                let message = crate::proxy_queue::panic_message(panic.as_ref());
                error!("callback of consumer session {} panicked: {message}", self.proxy_id());
            }
            let intent = std::mem::take(&mut self.lock_state().callback_thread);
            queue.delivery_finished();
            intent
        };
        self.perform_in_callback_actions(intent).await.map(drop)
    }

    /// Replay what a callback asked for. Returns true when the session is
    /// left started.
    async fn perform_in_callback_actions(&self, intent: CallbackIntent) -> Result<bool> {
        match intent.state {
            CallbackThreadState::Closed => {
                self.close().await?;
                Ok(false)
            }
            CallbackThreadState::StoppedDeregistered => {
                self.stop().await?;
                self.deregister_async_consumer_callback().await?;
                Ok(false)
            }
            CallbackThreadState::StoppedRegistered => {
                self.stop().await?;
                if let Some(registration) = intent.registration {
                    self.register_async_consumer_callback(registration).await?;
                }
                Ok(false)
            }
            CallbackThreadState::StartedDeregistered => {
                self.stop().await?;
                self.deregister_async_consumer_callback().await?;
                self.start().await?;
                Ok(true)
            }
            CallbackThreadState::StartedRegistered => {
                if let Some(registration) = intent.registration {
                    self.stop().await?;
                    self.register_async_consumer_callback(registration).await?;
                    self.start().await?;
                }
                Ok(true)
            }
        }
    }

    /// The peer stopped this stoppable session; stop locally without a flow
    /// and tell the callback.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once the session has closed.
    pub async fn stoppable_consumer_session_stopped(&self) -> Result<()> {
        self.stop_internal(false).await?;
        let registration = self.lock_state().callback.clone();
        if let Some(registration) = registration {
            registration.callback().consumer_session_stopped(self).await;
        }
        Ok(())
    }

    /// Forward an error pushed by the peer to the registered callback.
    pub async fn deliver_async_exception(&self, error: ProxyError) {
        let registration = self.lock_state().callback.clone();
        match registration {
            Some(registration) => registration.callback().async_exception(self, &error).await,
            None => debug!(
                "consumer session {} has no callback for asynchronous error: {error}",
                self.proxy_id()
            ),
        }
    }

    /// Engine-side activation is not available to clients.
    ///
    /// # Errors
    ///
    /// Always returns [`ProxyError::IncorrectCall`].
    pub fn activate_async_consumer(&self) -> Result<()> {
        Err(ProxyError::incorrect_call(
            "asynchronous consumers cannot be activated by a client",
        ))
    }
}
