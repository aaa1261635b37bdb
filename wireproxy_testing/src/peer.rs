//! An in-memory messaging engine that records every request.
//!
//! [`MockPeer`] answers exchanges from per-segment handlers and one-shot
//! scripted replies, falling back to the replies an engine gives when every
//! flow succeeds with nothing to deliver. Conversations
//! opened on it, including clones, share one request log.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicI16, AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use wireproxy::{
    codec::{ReplyBuffer, RequestBuffer},
    conversation::{Conversation, Priority, ReceiveListener, Reply},
    error::TransportError,
    protocol::{Capabilities, HandshakeProperties, Segment, level},
};

use crate::replies;

type Handler = Arc<dyn Fn(&Recorded) -> Result<Reply, TransportError> + Send + Sync>;

/// One transmission received by the peer.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub conversation: u32,
    pub segment: Segment,
    pub priority: Priority,
    pub payload: Bytes,
    /// The sender waited for a reply.
    pub exchanged: bool,
}

impl Recorded {
    /// Reader over the request body.
    pub fn body(&self) -> ReplyBuffer { ReplyBuffer::new(self.segment, self.payload.clone()) }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Scripted engine shared by every conversation opened on it.
pub struct MockPeer {
    handshake: HandshakeProperties,
    next_conversation: AtomicU32,
    next_object: AtomicI16,
    handlers: Mutex<HashMap<Segment, Handler>>,
    scripted: Mutex<HashMap<Segment, VecDeque<Result<Reply, TransportError>>>>,
    holds: Mutex<HashMap<Segment, Arc<Notify>>>,
    requests: Mutex<Vec<Recorded>>,
    conversations: Mutex<HashMap<u32, Weak<MockConversation>>>,
    refuse_clones: AtomicBool,
}

impl fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPeer")
            .field("handshake", &self.handshake)
            .field("requests", &lock(&self.requests).len())
            .finish_non_exhaustive()
    }
}

impl MockPeer {
    pub fn new(handshake: HandshakeProperties) -> Arc<Self> {
        Arc::new(Self {
            handshake,
            next_conversation: AtomicU32::new(1),
            next_object: AtomicI16::new(1),
            handlers: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            conversations: Mutex::new(HashMap::new()),
            refuse_clones: AtomicBool::new(false),
        })
    }

    /// A peer negotiated at `level` that supports transactions.
    pub fn at_level(level: u16) -> Arc<Self> {
        Self::new(HandshakeProperties::new(level, Capabilities::TRANSACTIONS))
    }

    pub fn handshake(&self) -> HandshakeProperties { self.handshake }

    /// Open a root conversation.
    pub fn conversation(self: &Arc<Self>) -> Arc<MockConversation> {
        let id = self.next_conversation.fetch_add(1, Ordering::Relaxed);
        let conversation = Arc::new(MockConversation {
            id,
            peer: Arc::clone(self),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            fast_closed: AtomicBool::new(false),
        });
        lock(&self.conversations).insert(id, Arc::downgrade(&conversation));
        conversation
    }

    /// Answer every exchange on `segment` with `handler`.
    pub fn on(
        &self,
        segment: Segment,
        handler: impl Fn(&Recorded) -> Result<Reply, TransportError> + Send + Sync + 'static,
    ) {
        lock(&self.handlers).insert(segment, Arc::new(handler));
    }

    /// Answer the next exchange on `segment` with `reply`.
    pub fn reply_once(&self, segment: Segment, reply: Reply) {
        lock(&self.scripted)
            .entry(segment)
            .or_default()
            .push_back(Ok(reply));
    }

    /// Fail the next transmission on `segment` with `error`.
    pub fn fail_once(&self, segment: Segment, error: TransportError) {
        lock(&self.scripted)
            .entry(segment)
            .or_default()
            .push_back(Err(error));
    }

    /// Make clone flows fail at the transport.
    pub fn refuse_clones(&self) { self.refuse_clones.store(true, Ordering::Release); }

    /// Hold exchanges on `segment` until [`release`](Self::release).
    pub fn hold(&self, segment: Segment) {
        lock(&self.holds).insert(segment, Arc::new(Notify::new()));
    }

    /// Let one held exchange on `segment` reply.
    pub fn release(&self, segment: Segment) {
        if let Some(notify) = lock(&self.holds).get(&segment) {
            notify.notify_one();
        }
    }

    /// Every transmission received so far, in arrival order.
    pub fn requests(&self) -> Vec<Recorded> { lock(&self.requests).clone() }

    /// Segments of every transmission received so far.
    pub fn segments(&self) -> Vec<Segment> {
        lock(&self.requests).iter().map(|r| r.segment).collect()
    }

    /// Transmissions received on `segment`.
    pub fn requests_for(&self, segment: Segment) -> Vec<Recorded> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.segment == segment)
            .cloned()
            .collect()
    }

    /// Number of transmissions received on `segment`.
    pub fn count(&self, segment: Segment) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.segment == segment)
            .count()
    }

    /// The live conversation with `id`.
    pub fn conversation_by_id(&self, id: u32) -> Option<Arc<MockConversation>> {
        lock(&self.conversations).get(&id).and_then(Weak::upgrade)
    }

    /// Deliver a push on conversation `id`.
    ///
    /// Returns false when the conversation is gone or has no listener.
    pub async fn push(&self, id: u32, segment: Segment, payload: Bytes) -> bool {
        let listener = self
            .conversation_by_id(id)
            .and_then(|conversation| lock(&conversation.listener).clone());
        match listener {
            Some(listener) => {
                listener.data_received(segment, payload).await;
                true
            }
            None => false,
        }
    }

    fn record(&self, recorded: Recorded) { lock(&self.requests).push(recorded); }

    fn scripted(&self, segment: Segment) -> Option<Result<Reply, TransportError>> {
        lock(&self.scripted)
            .get_mut(&segment)
            .and_then(VecDeque::pop_front)
    }

    fn next_object_id(&self) -> i16 { self.next_object.fetch_add(1, Ordering::Relaxed) }

    fn answer(&self, recorded: &Recorded) -> Result<Reply, TransportError> {
        if let Some(scripted) = self.scripted(recorded.segment) {
            return scripted;
        }
        let handler = lock(&self.handlers).get(&recorded.segment).cloned();
        if let Some(handler) = handler {
            return handler(recorded);
        }
        Ok(self.default_reply(recorded))
    }

    fn default_reply(&self, recorded: &Recorded) -> Reply {
        let segment = recorded.segment;
        match segment {
            Segment::CONNECT => {
                let user = recorded.body().get_opt_string().ok().flatten();
                replies::connected(self.next_object_id(), user.as_deref(), self.handshake)
            }
            Segment::CREATE_CLONE_CONNECTION => {
                replies::established(segment, self.next_object_id(), self.handshake)
            }
            Segment::CLOSE_CONNECTION => {
                let mut body = recorded.body();
                let _object = body.get_i16();
                let reset = self.handshake.supports(level::CHUNKING)
                    && body.get_u8().is_ok_and(|reset| reset != 0);
                if reset {
                    replies::reset(self.next_object_id(), self.handshake)
                } else {
                    replies::closed(self.handshake)
                }
            }
            Segment::CREATE_CONSUMER_SESS | Segment::CREATE_CONSUMER_FOR_DURABLE_SUB => {
                replies::consumer_created(segment, 1000 + i64::from(self.next_object_id()))
            }
            Segment::CREATE_PRODUCER_SESS | Segment::CREATE_BIFURCATED_SESS => {
                replies::proxy_created(segment, self.next_object_id())
            }
            Segment::RECEIVE_CONN_MSG
            | Segment::RECEIVE_SESS_MSG
            | Segment::BROWSE_NEXT
            | Segment::READ_SET
            | Segment::READ_AND_DELETE_SET => replies::received(segment, None),
            Segment::XA_PREPARE => replies::vote(0),
            Segment::GET_UNIQUE_ID => {
                let mut body = RequestBuffer::new();
                body.put_short_bytes(b"engine-unique").expect("id fits");
                replies::success(segment, body)
            }
            _ => replies::empty(segment),
        }
    }
}

/// One conversation opened on a [`MockPeer`].
pub struct MockConversation {
    id: u32,
    peer: Arc<MockPeer>,
    listener: Mutex<Option<Arc<dyn ReceiveListener>>>,
    closed: AtomicBool,
    fast_closed: AtomicBool,
}

impl fmt::Debug for MockConversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConversation")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MockConversation {
    pub fn peer(&self) -> &Arc<MockPeer> { &self.peer }

    /// Returns true once closed gracefully or fast.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.fast_closed.load(Ordering::Acquire)
    }

    /// Returns true when the conversation was fast closed.
    pub fn was_fast_closed(&self) -> bool { self.fast_closed.load(Ordering::Acquire) }

    /// Returns true when a receive listener is registered.
    pub fn has_listener(&self) -> bool { lock(&self.listener).is_some() }

    fn transmission(
        &self,
        segment: Segment,
        priority: Priority,
        request: Bytes,
        exchanged: bool,
    ) -> Result<Recorded, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let recorded = Recorded {
            conversation: self.id,
            segment,
            priority,
            payload: request,
            exchanged,
        };
        self.peer.record(recorded.clone());
        Ok(recorded)
    }
}

#[async_trait]
impl Conversation for MockConversation {
    fn id(&self) -> u32 { self.id }

    fn handshake(&self) -> HandshakeProperties { self.peer.handshake }

    fn set_receive_listener(&self, listener: Arc<dyn ReceiveListener>) {
        *lock(&self.listener) = Some(listener);
    }

    async fn exchange(
        &self,
        segment: Segment,
        priority: Priority,
        request: Bytes,
    ) -> Result<Reply, TransportError> {
        let recorded = self.transmission(segment, priority, request, true)?;
        let hold = lock(&self.peer.holds).get(&segment).cloned();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        self.peer.answer(&recorded)
    }

    async fn send(
        &self,
        segment: Segment,
        priority: Priority,
        request: Bytes,
    ) -> Result<(), TransportError> {
        self.transmission(segment, priority, request, false)?;
        match self.peer.scripted(segment) {
            Some(Err(error)) => Err(error),
            _ => Ok(()),
        }
    }

    async fn clone_conversation(
        &self,
        listener: Arc<dyn ReceiveListener>,
    ) -> Result<Arc<dyn Conversation>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.peer.refuse_clones.load(Ordering::Acquire) {
            return Err(TransportError::Dropped("clone refused".into()));
        }
        let clone = self.peer.conversation();
        clone.set_receive_listener(listener);
        Ok(clone)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn fast_close(&self) { self.fast_closed.store(true, Ordering::Release); }
}
