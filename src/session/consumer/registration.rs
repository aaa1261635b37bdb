//! Registering and deregistering asynchronous consumer callbacks.

use log::debug;

use super::{CallbackRegistration, ConsumerSession, ConsumerState, SessionState};
use crate::{
    error::{ProxyError, Result},
    ordering::OrderingContext,
    protocol::level,
    proxy_queue::ProxyQueueGroup,
};

impl ConsumerSession {
    /// Register a callback for asynchronous delivery.
    ///
    /// The session must not be started. A read-ahead session whose
    /// registration asks for active-message limits, lock expiry or
    /// stoppability switches to an asynchronous queue under the same proxy
    /// id with the next batch sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IncorrectCall`] while started,
    /// [`ProxyError::SessionUnavailable`] once closed, or
    /// [`ProxyError::ProtocolLevel`] for a stoppable registration on a peer
    /// below level 9.
    pub async fn register_async_consumer_callback(
        &self,
        registration: CallbackRegistration,
    ) -> Result<()> {
        if registration.is_stoppable() {
            self.connection().handshake().require(level::CHUNKING)?;
        }
        if self.executing_on_callback_thread() {
            return self.in_callback(|intent| {
                if intent.state.is_started() {
                    return Err(ProxyError::incorrect_call(
                        "cannot register a callback while the session is started",
                    ));
                }
                intent.state = intent.state.registered();
                intent.registration = Some(registration);
                Ok(())
            });
        }
        let _callback = self.0.callback_lock.lock().await;
        let _synch = self.0.synch_lock.lock().await;
        self.check_not_closed()?;
        let group = self.connection().queue_group()?;
        let mut state = self.lock_state();
        if state.state.is_closed() {
            return Err(self.unavailable());
        }
        if state.state == SessionState::Started {
            return Err(ProxyError::incorrect_call(
                "cannot register a callback while the session is started",
            ));
        }
        self.register_locked(&mut state, registration, &group)
    }

    /// Register a stoppable callback; the peer may stop the session after
    /// `max_sequential_failures` failed deliveries.
    ///
    /// # Errors
    ///
    /// As [`register_async_consumer_callback`](Self::register_async_consumer_callback);
    /// a registration without stoppable options is rejected with
    /// [`ProxyError::IncorrectCall`].
    pub async fn register_stoppable_async_consumer_callback(
        &self,
        registration: CallbackRegistration,
    ) -> Result<()> {
        if !registration.is_stoppable() {
            return Err(ProxyError::incorrect_call(
                "registration carries no stoppable options",
            ));
        }
        self.register_async_consumer_callback(registration).await
    }

    fn register_locked(
        &self,
        state: &mut ConsumerState,
        registration: CallbackRegistration,
        group: &ProxyQueueGroup,
    ) -> Result<()> {
        let queue = match state.proxy_queue.clone() {
            Some(queue) if state.read_ahead && registration.needs_async_queue() => {
                let replacement = group
                    .create_async_queue(self.proxy_id(), queue.batch_sequence().wrapping_add(1))?;
                replacement.set_consumer_session(self.downgrade());
                state.read_ahead = false;
                debug!(
                    "consumer session {} replaced its read-ahead queue",
                    self.proxy_id()
                );
                replacement
            }
            Some(queue) => queue,
            None => {
                let queue = group.create_async_queue(self.proxy_id(), 0)?;
                queue.set_consumer_session(self.downgrade());
                queue
            }
        };
        let registered = state.callback.is_some();
        account_ordering(state, registered, registration.ordering());
        queue.attach(registration.limits());
        state.proxy_queue = Some(queue);
        state.callback = Some(registration);
        Ok(())
    }

    /// Remove the registered callback.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IncorrectCall`] while started or
    /// [`ProxyError::SessionUnavailable`] once closed.
    pub async fn deregister_async_consumer_callback(&self) -> Result<()> {
        if self.executing_on_callback_thread() {
            return self.in_callback(|intent| {
                if intent.state.is_started() {
                    return Err(ProxyError::incorrect_call(
                        "cannot deregister a callback while the session is started",
                    ));
                }
                intent.state = intent.state.deregistered();
                intent.registration = None;
                Ok(())
            });
        }
        if self.state() == SessionState::Started {
            return Err(ProxyError::incorrect_call(
                "cannot deregister a callback while the session is started",
            ));
        }
        let _callback = self.0.callback_lock.lock().await;
        let _synch = self.0.synch_lock.lock().await;
        let buried = {
            let mut state = self.lock_state();
            if state.state.is_closed() {
                return Err(self.unavailable());
            }
            if state.state == SessionState::Started {
                return Err(ProxyError::incorrect_call(
                    "cannot deregister a callback while the session is started",
                ));
            }
            if state.callback.take().is_none() {
                return Ok(());
            }
            if let Some(ordering) = state.ordering.take() {
                ordering.decrement_use_count();
            }
            match state.proxy_queue.take() {
                Some(queue) if state.read_ahead => {
                    queue.detach();
                    state.proxy_queue = Some(queue);
                    false
                }
                Some(queue) => {
                    queue.closed();
                    true
                }
                None => false,
            }
        };
        if buried {
            if let Some(group) = self.connection().existing_queue_group() {
                group.bury(self.proxy_id());
            }
        }
        Ok(())
    }

    /// Deregister a stoppable callback.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ProtocolLevel`] below level 9, otherwise as
    /// [`deregister_async_consumer_callback`](Self::deregister_async_consumer_callback).
    pub async fn deregister_stoppable_async_consumer_callback(&self) -> Result<()> {
        self.connection().handshake().require(level::CHUNKING)?;
        self.deregister_async_consumer_callback().await
    }
}

/// Move the registration's hold on an ordering context from the current
/// context to `next`.
fn account_ordering(state: &mut ConsumerState, registered: bool, next: Option<&OrderingContext>) {
    match (state.ordering.take(), next) {
        (Some(current), Some(next)) if registered && current.same_as(next) => {
            state.ordering = Some(current);
        }
        (current, next) => {
            if let Some(current) = current {
                current.decrement_use_count();
            }
            if let Some(next) = next {
                next.increment_use_count();
            }
            state.ordering = next.cloned();
        }
    }
}
