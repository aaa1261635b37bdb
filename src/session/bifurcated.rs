//! Bifurcated consumer sessions.

use std::sync::Arc;

use super::SessionCore;
use crate::{
    codec::ReplyBuffer,
    completion::cascade,
    connection::Connection,
    error::Result,
    message::{Message, MessageHandle},
    metrics,
    protocol::{Segment, level},
    registry::ProxyId,
    transaction::{self, Transaction},
};

struct BifurcatedInner {
    core: SessionCore,
    message_processor_id: i64,
}

/// Operates on messages locked by another consumer session, identified by
/// that session's message processor id.
#[derive(Clone)]
pub struct BifurcatedConsumerSession(Arc<BifurcatedInner>);

impl BifurcatedConsumerSession {
    pub(crate) fn new(proxy_id: ProxyId, connection: Connection, message_processor_id: i64) -> Self {
        Self(Arc::new(BifurcatedInner {
            core: SessionCore::new(proxy_id, connection, metrics::SessionKind::Bifurcated),
            message_processor_id,
        }))
    }

    #[must_use]
    pub fn proxy_id(&self) -> ProxyId { self.0.core.proxy_id() }

    #[must_use]
    pub fn message_processor_id(&self) -> i64 { self.0.message_processor_id }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.0.core.is_closed() }

    fn read_messages(&self, reply: &mut ReplyBuffer) -> Result<Vec<Message>> {
        let count = usize::try_from(reply.get_i32()?).unwrap_or_default();
        let codec = self.0.core.connection().codec();
        let mut messages = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let slice = reply.get_slice()?;
            messages.push(codec.decode(&[slice])?);
        }
        Ok(messages)
    }

    /// Read the locked messages named by `handles`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`](crate::error::ProxyError::SessionUnavailable)
    /// once closed, or the peer's error.
    pub async fn read_set(&self, handles: &[MessageHandle]) -> Result<Vec<Message>> {
        self.0.core.check_open()?;
        let mut request = self.0.core.request();
        request.put_handles(handles)?;
        let mut reply = self
            .0
            .core
            .exchange(Segment::READ_SET, request, cascade::UNLOCK_SET)
            .await?;
        self.read_messages(&mut reply)
    }

    /// Read and delete the messages named by `handles`.
    ///
    /// # Errors
    ///
    /// As [`read_set`](Self::read_set), plus
    /// [`ProxyError::IncorrectCall`](crate::error::ProxyError::IncorrectCall)
    /// for a completed transaction.
    pub async fn read_and_delete_set(
        &self,
        handles: &[MessageHandle],
        transaction: Option<&Transaction>,
    ) -> Result<Vec<Message>> {
        self.0.core.check_open()?;
        transaction::ensure_valid(transaction)?;
        let mut request = self.0.core.request();
        transaction::put_transaction(&mut request, transaction)?;
        request.put_handles(handles)?;
        let mut reply = self
            .0
            .core
            .exchange(Segment::READ_AND_DELETE_SET, request, cascade::DELETE_SET)
            .await?;
        self.read_messages(&mut reply)
    }

    /// Delete the messages named by `handles`.
    ///
    /// # Errors
    ///
    /// As [`read_and_delete_set`](Self::read_and_delete_set).
    pub async fn delete_set(&self, handles: &[MessageHandle], transaction: Option<&Transaction>) -> Result<()> {
        self.0.core.check_open()?;
        transaction::ensure_valid(transaction)?;
        let mut request = self.0.core.request();
        transaction::put_transaction(&mut request, transaction)?;
        request.put_handles(handles)?;
        self.0
            .core
            .exchange(Segment::DELETE_SET, request, cascade::DELETE_SET)
            .await
            .map(drop)
    }

    /// Unlock the messages named by `handles`.
    ///
    /// # Errors
    ///
    /// As [`read_set`](Self::read_set).
    pub async fn unlock_set(&self, handles: &[MessageHandle], increment_lock_count: bool) -> Result<()> {
        self.0.core.check_open()?;
        let mut request = self.0.core.request();
        request.put_handles(handles)?;
        let negotiated = self.0.core.connection().handshake().level();
        if negotiated >= level::UNLOCK_INCREMENT && negotiated != level::CHUNKING {
            request.put_bool(increment_lock_count);
        }
        self.0
            .core
            .exchange(Segment::UNLOCK_SET, request, cascade::UNLOCK_SET)
            .await
            .map(drop)
    }

    /// # Errors
    ///
    /// Returns the peer's error if the close flow fails.
    pub async fn close(&self) -> Result<()> {
        if !self.0.core.mark_closed() || self.0.core.connection().is_closed() {
            return Ok(());
        }
        let request = self.0.core.request();
        self.0
            .core
            .exchange(Segment::CLOSE_CONSUMER_SESS, request, cascade::SESSION_CLOSE)
            .await
            .map(drop)
    }
}
