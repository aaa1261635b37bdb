//! The per-conversation set of proxy queues.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use log::debug;

use super::{ProxyQueue, QueueKind};
use crate::{
    error::{ProxyError, Result},
    registry::ProxyId,
};

/// Every proxy queue of one conversation, keyed by proxy id.
#[derive(Debug, Default)]
pub struct ProxyQueueGroup {
    queues: DashMap<ProxyId, Arc<ProxyQueue>>,
    closed: AtomicBool,
}

impl ProxyQueueGroup {
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::ConnectionUnavailable(
                "proxy queue group is closed".into(),
            ));
        }
        Ok(())
    }

    fn install(&self, queue: Arc<ProxyQueue>) -> Arc<ProxyQueue> {
        if let Some(previous) = self.queues.insert(queue.id(), Arc::clone(&queue)) {
            previous.closed();
        }
        queue
    }

    /// Create the read-ahead queue of a new consumer session.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`] once the group is closed.
    pub fn create_read_ahead_queue(&self, id: ProxyId) -> Result<Arc<ProxyQueue>> {
        self.check_open()?;
        Ok(self.install(ProxyQueue::new(id, QueueKind::ReadAhead, 0)))
    }

    /// Create an asynchronous queue, replacing any queue with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`] once the group is closed.
    pub fn create_async_queue(&self, id: ProxyId, batch: u16) -> Result<Arc<ProxyQueue>> {
        self.check_open()?;
        Ok(self.install(ProxyQueue::new(id, QueueKind::Asynch, batch)))
    }

    /// Look up the queue for `id`.
    #[must_use]
    pub fn find(&self, id: ProxyId) -> Option<Arc<ProxyQueue>> {
        self.queues.get(&id).map(|queue| Arc::clone(&queue))
    }

    #[must_use]
    pub fn len(&self) -> usize { self.queues.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.queues.is_empty() }

    /// Close and forget the queue for `id`.
    pub fn bury(&self, id: ProxyId) {
        if let Some((_, queue)) = self.queues.remove(&id) {
            debug!("burying proxy queue {id}");
            queue.closed();
        }
    }

    /// The conversation is closing: stop every queue from handing out more
    /// messages.
    pub fn close_notification(&self) {
        self.closed.store(true, Ordering::Release);
        for entry in &self.queues {
            entry.value().closed();
        }
    }

    /// Forget every queue once the conversation has closed.
    pub fn close(&self) {
        self.close_notification();
        self.queues.clear();
    }
}
