//! Synchronous receives and message completion.

use bytes::Bytes;
use log::{debug, warn};

use super::ConsumerSession;
use crate::{
    chunk::SliceAssembler,
    completion::cascade,
    conversation::Priority,
    error::{ProxyError, Result},
    message::{Message, MessageHandle, ReceiveTimeout},
    protocol::{ChunkFlags, Segment, level},
    transaction::{self, Transaction},
};

/// Clears the in-progress wait marker however the receive ends.
struct WaitMarker<'a>(&'a ConsumerSession);

impl<'a> WaitMarker<'a> {
    fn set(session: &'a ConsumerSession) -> Self {
        session.lock_state().receiving_with_wait = true;
        Self(session)
    }
}

impl Drop for WaitMarker<'_> {
    fn drop(&mut self) { self.0.lock_state().receiving_with_wait = false; }
}

impl ConsumerSession {
    /// Receive a message if one is available now.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once closed and
    /// [`ProxyError::IncorrectCall`] while a waiting receive is in progress,
    /// while a callback is registered or for a completed transaction.
    pub async fn receive_no_wait(&self, transaction: Option<&Transaction>) -> Result<Option<Message>> {
        self.check_not_closed()?;
        if self.lock_state().receiving_with_wait {
            return Err(ProxyError::incorrect_call(
                "receive_no_wait called while a waiting receive is in progress",
            ));
        }
        transaction::ensure_valid(transaction)?;
        let _synch = self.0.synch_lock.lock().await;
        self.receive_locked(transaction, ReceiveTimeout::NoWait).await
    }

    /// Receive a message, waiting up to `timeout` for one.
    ///
    /// The wait does not block state changes; closing the session ends it
    /// with `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once closed and
    /// [`ProxyError::IncorrectCall`] while a callback is registered or for a
    /// completed transaction.
    pub async fn receive_with_wait(
        &self,
        transaction: Option<&Transaction>,
        timeout: ReceiveTimeout,
    ) -> Result<Option<Message>> {
        self.check_not_closed()?;
        transaction::ensure_valid(transaction)?;
        // No synch lock: start, stop and close must get through while waiting.
        let _waiting = WaitMarker::set(self);
        self.receive_locked(transaction, timeout).await
    }

    async fn receive_locked(
        &self,
        transaction: Option<&Transaction>,
        timeout: ReceiveTimeout,
    ) -> Result<Option<Message>> {
        let (queue, read_ahead, registered) = {
            let state = self.lock_state();
            if state.state.is_closed() {
                return Err(self.unavailable());
            }
            (state.proxy_queue.clone(), state.read_ahead, state.callback.is_some())
        };
        if registered {
            return Err(ProxyError::incorrect_call(
                "synchronous receive while an asynchronous callback is registered",
            ));
        }
        match queue {
            Some(queue) if read_ahead => {
                let message = queue.receive(timeout).await;
                if let (Some(transaction), Some(handle)) =
                    (transaction, message.as_ref().and_then(|message| message.handle))
                {
                    self.delete_set_locked(&[handle], Some(transaction)).await?;
                }
                Ok(message)
            }
            _ => self.perform_receive(transaction, timeout).await,
        }
    }

    async fn perform_receive(
        &self,
        transaction: Option<&Transaction>,
        timeout: ReceiveTimeout,
    ) -> Result<Option<Message>> {
        let mut request = self.0.core.request();
        transaction::put_transaction(&mut request, transaction)?;
        request.put_i64(timeout.to_wire());
        let connection = self.connection();
        let mut reply = if timeout == ReceiveTimeout::NoWait {
            connection
                .exchange_shared(Segment::RECEIVE_SESS_MSG, Priority::Medium, request)
                .await?
        } else {
            connection
                .exchange_unguarded(Segment::RECEIVE_SESS_MSG, Priority::Medium, request)
                .await?
        };
        reply.check_completion(Segment::RECEIVE_SESS_MSG.reply(), cascade::SESSION_RECEIVE)?;
        let pending = self.lock_state().pending_slices.take();
        connection.read_received_message(&mut reply, pending)
    }

    /// Buffer one pushed slice of a chunked synchronous receive.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Chunk`] for an out-of-order slice.
    pub fn add_message_part(&self, flags: ChunkFlags, slice: Bytes) -> Result<()> {
        let mut state = self.lock_state();
        let assembler = state.pending_slices.get_or_insert_with(SliceAssembler::new);
        if assembler.push(flags, slice)?.is_some() {
            warn!(
                "consumer session {} got a complete message outside a receive reply; dropped",
                self.proxy_id()
            );
            state.pending_slices = None;
        }
        Ok(())
    }

    /// Unlock every message locked by this session.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once closed, or the peer's
    /// error.
    pub async fn unlock_all(&self) -> Result<()> {
        self.check_not_closed()?;
        let _synch = self.0.synch_lock.lock().await;
        let queue = self.lock_state().proxy_queue.clone();
        if let Some(queue) = queue {
            let purged = queue.purge();
            debug!("consumer session {} purged {purged} buffered messages", self.proxy_id());
        }
        let request = self.0.core.request();
        self.0
            .core
            .exchange(Segment::UNLOCK_ALL, request, cascade::SESSION_CONTROL)
            .await
            .map(drop)
    }

    /// Unlock the given messages so they can be redelivered.
    ///
    /// The lock-count flag is only sent to peers that understand it.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once closed, or the peer's
    /// error.
    pub async fn unlock_set(&self, handles: &[MessageHandle], increment_lock_count: bool) -> Result<()> {
        self.check_not_closed()?;
        let _synch = self.0.synch_lock.lock().await;
        let mut request = self.0.core.request();
        request.put_handles(handles)?;
        let negotiated = self.connection().handshake().level();
        if negotiated >= level::UNLOCK_INCREMENT && negotiated != level::CHUNKING {
            request.put_bool(increment_lock_count);
        }
        self.0
            .core
            .exchange(Segment::UNLOCK_SET, request, cascade::UNLOCK_SET)
            .await?;
        self.complete_handles(handles);
        Ok(())
    }

    /// Delete the given messages, optionally under a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`] once closed,
    /// [`ProxyError::IncorrectCall`] for a completed transaction, or the
    /// peer's error.
    pub async fn delete_set(&self, handles: &[MessageHandle], transaction: Option<&Transaction>) -> Result<()> {
        self.check_not_closed()?;
        transaction::ensure_valid(transaction)?;
        let _synch = self.0.synch_lock.lock().await;
        self.delete_set_locked(handles, transaction).await
    }

    async fn delete_set_locked(
        &self,
        handles: &[MessageHandle],
        transaction: Option<&Transaction>,
    ) -> Result<()> {
        let mut request = self.0.core.request();
        transaction::put_transaction(&mut request, transaction)?;
        request.put_handles(handles)?;
        self.0
            .core
            .exchange(Segment::DELETE_SET, request, cascade::DELETE_SET)
            .await?;
        self.complete_handles(handles);
        Ok(())
    }

    fn complete_handles(&self, handles: &[MessageHandle]) {
        let queue = self.lock_state().proxy_queue.clone();
        if let Some(queue) = queue {
            queue.complete(handles);
        }
    }

    /// A transaction on the connection rolled back: drop buffered messages so
    /// redelivery keeps its order.
    pub async fn rollback_occurred(&self) {
        let _callback = if self.executing_on_callback_thread() {
            None
        } else {
            Some(self.0.callback_lock.lock().await)
        };
        let _synch = self.0.synch_lock.lock().await;
        let queue = self.lock_state().proxy_queue.clone();
        if let Some(queue) = queue {
            let purged = queue.purge();
            debug!(
                "consumer session {} purged {purged} messages after rollback",
                self.proxy_id()
            );
        }
    }
}
