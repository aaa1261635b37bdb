//! The connection proxy.
//!
//! A [`Connection`] is one logical connection to a messaging engine over a
//! [`Conversation`]. It creates sessions, sends and receives messages
//! directly, creates transactions and clones sibling connections over the
//! same link.
//!
//! Two locks guard every operation. The general lock serialises operations
//! on the connection against each other. The close lock is a
//! reader/writer lock shared with every session and transaction the
//! connection creates: operations hold the read side, `close` holds the
//! write side. The general lock is always taken before the close lock and
//! both are released when the operation's guard drops, in reverse order.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicI16, AtomicI32, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OwnedRwLockReadGuard, RwLock};

mod builder;
mod counter;
mod destinations;
mod lifecycle;
mod messaging;
mod options;
mod router;
mod sessions;
mod transactions;

pub use builder::ConnectionBuilder;
use counter::ActiveConnection;
pub use counter::open_connection_count;
pub(crate) use messaging::SendRoute;
pub use options::{
    BrowserOptions,
    ConsumerOptions,
    DurableSubscriptionOptions,
    ProducerOptions,
    ReceiveOptions,
    SendOptions,
};
use router::ReceiveRouter;

use crate::{
    chunk::SliceAssembler,
    codec::{MessageCodec, ReplyBuffer, RequestBuffer},
    config::ProxyConfig,
    conversation::{Conversation, Priority},
    error::{ProxyError, Result},
    metrics::{self, ExchangeOutcome},
    protocol::{HandshakeProperties, Segment},
    proxy_queue::ProxyQueueGroup,
    registry::{ProxyId, ProxyIdAllocator, SessionRegistry},
    session::ConsumerSession,
    transaction::XidTable,
};

/// Which optional capabilities a connection was created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Standard,
    /// The peer can recover in-doubt XA branches remotely.
    XaRecoveryCapable,
}

/// Notifications the peer pushes about the engine behind a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    EngineQuiescing,
    EngineTerminated,
    LinkLost,
    Other(i16),
}

impl ConnectionEvent {
    pub(crate) fn from_wire(code: i16) -> Self {
        match code {
            1 => Self::EngineQuiescing,
            2 => Self::EngineTerminated,
            3 => Self::LinkLost,
            other => Self::Other(other),
        }
    }
}

/// Observer of asynchronous conditions on a connection.
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    /// The peer reported an error not tied to any request.
    async fn async_exception(&self, connection: &Connection, error: &ProxyError);

    /// The peer reported a change in the engine's state.
    async fn event_occurred(&self, connection: &Connection, event: ConnectionEvent);
}

/// Engine identity learnt when the root connection was established.
#[derive(Clone, Debug)]
struct EngineIdentity {
    name: String,
    uuid: String,
    user: Option<String>,
}

/// Fields read from a connect, clone or reset reply.
#[derive(Debug)]
struct Established {
    object_id: i16,
    unique_id_stem: Option<Bytes>,
    ordering_id: Option<i16>,
}

pub(crate) struct ConnectionInner {
    conversation: Arc<dyn Conversation>,
    handshake: HandshakeProperties,
    config: ProxyConfig,
    codec: Arc<dyn MessageCodec>,
    xid_table: Arc<XidTable>,
    kind: ConnectionKind,
    engine: EngineIdentity,
    parent: Option<Weak<ConnectionInner>>,
    object_id: AtomicI16,
    general: AsyncMutex<()>,
    close_lock: Arc<RwLock<()>>,
    closed: AtomicBool,
    active: Mutex<Option<ActiveConnection>>,
    sessions: SessionRegistry,
    proxy_ids: ProxyIdAllocator,
    transaction_ids: AtomicI32,
    ordering_ids: AtomicI16,
    ordering_pool: Mutex<VecDeque<i16>>,
    unique_id_stem: Mutex<Option<Bytes>>,
    queue_group: Mutex<Option<Arc<ProxyQueueGroup>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    clone_cache: Mutex<Vec<Connection>>,
    /// Held from request to reply by connection-level receives, which
    /// share `pending_slices`.
    receive: AsyncMutex<()>,
    pending_slices: Mutex<Option<SliceAssembler>>,
}

/// Client-side proxy for one logical connection to a messaging engine.
///
/// Handles are cheap to clone and all refer to the same connection.
#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("object_id", &self.object_id())
            .field("conversation", &self.conversation_id())
            .field("kind", &self.0.kind)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Locks held for the duration of one operation.
///
/// Fields drop in declaration order, so the close lock is released before
/// the general lock.
struct OperationGuard<'a> {
    _read: OwnedRwLockReadGuard<()>,
    _general: Option<AsyncMutexGuard<'a, ()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exchange on `conversation` and count the outcome.
async fn exchange_on(
    conversation: &dyn Conversation,
    segment: Segment,
    priority: Priority,
    request: RequestBuffer,
) -> Result<ReplyBuffer> {
    match conversation.exchange(segment, priority, request.freeze()).await {
        Ok(reply) => {
            metrics::inc_exchanges(ExchangeOutcome::Replied);
            Ok(ReplyBuffer::from(reply))
        }
        Err(error) => {
            metrics::inc_exchanges(ExchangeOutcome::Failed);
            Err(error.into())
        }
    }
}

impl Connection {
    /// Start building a connection over `conversation`.
    #[must_use]
    pub fn builder(conversation: Arc<dyn Conversation>) -> ConnectionBuilder {
        ConnectionBuilder::new(conversation)
    }

    fn from_inner(inner: Arc<ConnectionInner>) -> Self { Self(inner) }

    fn downgrade(&self) -> Weak<ConnectionInner> { Arc::downgrade(&self.0) }

    /// Identifier the peer assigned to this connection.
    #[must_use]
    pub fn object_id(&self) -> i16 { self.0.object_id.load(Ordering::Acquire) }

    /// Identifier of the conversation this connection runs on.
    #[must_use]
    pub fn conversation_id(&self) -> u32 { self.0.conversation.id() }

    #[must_use]
    pub fn handshake(&self) -> HandshakeProperties { self.0.handshake }

    #[must_use]
    pub fn config(&self) -> &ProxyConfig { &self.0.config }

    /// The codec turning messages into transmission slices.
    #[must_use]
    pub fn codec(&self) -> &dyn MessageCodec { self.0.codec.as_ref() }

    #[must_use]
    pub fn kind(&self) -> ConnectionKind { self.0.kind }

    /// Name of the messaging engine.
    #[must_use]
    pub fn engine_name(&self) -> &str { &self.0.engine.name }

    #[must_use]
    pub fn engine_uuid(&self) -> &str { &self.0.engine.uuid }

    /// User the engine authenticated the connection as.
    #[must_use]
    pub fn resolved_user(&self) -> Option<&str> { self.0.engine.user.as_deref() }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.0.closed.load(Ordering::Acquire) }

    /// Returns true when this connection was cloned from another.
    #[must_use]
    pub fn is_clone(&self) -> bool { self.0.parent.is_some() }

    /// Number of reset clones this connection holds for reuse.
    #[must_use]
    pub fn cached_clone_count(&self) -> usize { lock(&self.0.clone_cache).len() }

    /// Returns true when both handles refer to the same connection.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }

    /// Live consumer session registered under `id`.
    #[must_use]
    pub fn consumer_session(&self, id: ProxyId) -> Option<ConsumerSession> { self.0.sessions.get(&id) }

    /// Live consumer sessions of this connection.
    #[must_use]
    pub fn consumer_sessions(&self) -> Vec<ConsumerSession> { self.0.sessions.active_sessions() }

    /// A consumer session has closed; forget it.
    pub fn consumer_closed_notification(&self, id: ProxyId) { self.0.sessions.remove(&id); }

    /// The proxy queue group of this conversation, created on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`] once closed.
    pub fn queue_group(&self) -> Result<Arc<ProxyQueueGroup>> {
        let mut group = lock(&self.0.queue_group);
        if self.is_closed() {
            return Err(self.unavailable());
        }
        Ok(Arc::clone(group.get_or_insert_with(ProxyQueueGroup::new)))
    }

    /// The proxy queue group, if one was ever created.
    #[must_use]
    pub fn existing_queue_group(&self) -> Option<Arc<ProxyQueueGroup>> {
        lock(&self.0.queue_group).clone()
    }

    /// Register `listener` for asynchronous errors and engine events.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        lock(&self.0.listeners).push(listener);
    }

    /// Remove a listener added earlier. Returns false if it was not present.
    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = lock(&self.0.listeners);
        let before = listeners.len();
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        listeners.len() != before
    }

    #[must_use]
    pub fn connection_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        lock(&self.0.listeners).clone()
    }

    pub(crate) fn next_transaction_id(&self) -> i32 {
        self.0.transaction_ids.fetch_add(1, Ordering::AcqRel)
    }

    /// Allocate an id not held by a live session or proxy queue.
    fn next_proxy_id(&self) -> Result<ProxyId> {
        let queues = self.existing_queue_group();
        self.0
            .proxy_ids
            .next_unused(|id| {
                self.0.sessions.contains_live(&id)
                    || queues.as_ref().is_some_and(|group| group.find(id).is_some())
            })
            .ok_or_else(|| {
                ProxyError::LimitExceeded(format!(
                    "connection {} has no free proxy ids",
                    self.object_id()
                ))
            })
    }

    fn unavailable(&self) -> ProxyError {
        ProxyError::ConnectionUnavailable(format!("connection {} is closed", self.object_id()))
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(self.unavailable());
        }
        Ok(())
    }

    /// Take the general lock, then the close read lock, then check the
    /// connection is still open.
    async fn operation(&self) -> Result<OperationGuard<'_>> {
        let general = self.0.general.lock().await;
        let read = Arc::clone(&self.0.close_lock).read_owned().await;
        self.check_open()?;
        Ok(OperationGuard {
            _read: read,
            _general: Some(general),
        })
    }

    /// Take only the close read lock, as session operations do.
    async fn shared(&self) -> Result<OperationGuard<'_>> {
        let read = Arc::clone(&self.0.close_lock).read_owned().await;
        self.check_open()?;
        Ok(OperationGuard {
            _read: read,
            _general: None,
        })
    }

    /// Exchange without taking any lock. Callers hold the locks they need.
    async fn exchange(
        &self,
        segment: Segment,
        priority: Priority,
        request: RequestBuffer,
    ) -> Result<ReplyBuffer> {
        exchange_on(self.0.conversation.as_ref(), segment, priority, request).await
    }

    async fn send_request(
        &self,
        segment: Segment,
        priority: Priority,
        request: RequestBuffer,
    ) -> Result<()> {
        self.0
            .conversation
            .send(segment, priority, request.freeze())
            .await
            .map_err(ProxyError::from)
    }

    /// Exchange under the close read lock, as sessions and transactions do.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`] once closed, or the
    /// transport failure.
    pub(crate) async fn exchange_shared(
        &self,
        segment: Segment,
        priority: Priority,
        request: RequestBuffer,
    ) -> Result<ReplyBuffer> {
        let _guard = self.shared().await?;
        self.exchange(segment, priority, request).await
    }

    /// Exchange without the close read lock, for requests that may wait
    /// indefinitely for the peer.
    pub(crate) async fn exchange_unguarded(
        &self,
        segment: Segment,
        priority: Priority,
        request: RequestBuffer,
    ) -> Result<ReplyBuffer> {
        self.check_open()?;
        self.exchange(segment, priority, request).await
    }

    /// Send without a reply under the close read lock.
    pub(crate) async fn send_shared(
        &self,
        segment: Segment,
        priority: Priority,
        request: RequestBuffer,
    ) -> Result<()> {
        let _guard = self.shared().await?;
        self.send_request(segment, priority, request).await
    }

    /// Request carrying this connection's object id.
    fn request(&self) -> RequestBuffer {
        let mut request = RequestBuffer::new();
        request.put_i16(self.object_id());
        request
    }
}
