//! Asynchronous consumer callbacks and their registration options.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::ConsumerSession;
use crate::{
    error::ProxyError,
    message::Message,
    ordering::OrderingContext,
    proxy_queue::DeliveryLimits,
};

/// Receives messages delivered asynchronously to a consumer session.
///
/// Session methods called from inside these hooks are recorded and applied
/// once the hook returns, so a callback may stop, deregister or close its
/// own session.
#[async_trait]
pub trait ConsumerCallback: Send + Sync + 'static {
    /// Handle one batch of locked messages.
    async fn consume_messages(&self, session: &ConsumerSession, messages: Vec<Message>);

    /// The peer stopped a stoppable session after repeated failures.
    async fn consumer_session_stopped(&self, _session: &ConsumerSession) {}

    /// The peer reported an error for this session outside any call.
    async fn async_exception(&self, _session: &ConsumerSession, _error: &ProxyError) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StoppableOptions {
    max_sequential_failures: u32,
    hidden_message_delay: Duration,
}

/// A callback together with its delivery options.
#[derive(Clone)]
pub struct CallbackRegistration {
    callback: Arc<dyn ConsumerCallback>,
    max_active_messages: usize,
    message_lock_expiry: Duration,
    max_batch_size: usize,
    ordering_context: Option<OrderingContext>,
    stoppable: Option<StoppableOptions>,
}

impl fmt::Debug for CallbackRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistration")
            .field("max_active_messages", &self.max_active_messages)
            .field("message_lock_expiry", &self.message_lock_expiry)
            .field("max_batch_size", &self.max_batch_size)
            .field("ordering_context", &self.ordering_context)
            .field("stoppable", &self.stoppable)
            .finish_non_exhaustive()
    }
}

impl CallbackRegistration {
    /// Register `callback` with one message per batch and no limits.
    #[must_use]
    pub fn new(callback: Arc<dyn ConsumerCallback>) -> Self {
        Self {
            callback,
            max_active_messages: 0,
            message_lock_expiry: Duration::ZERO,
            max_batch_size: 1,
            ordering_context: None,
            stoppable: None,
        }
    }

    /// Limit delivered messages awaiting deletion or unlock; zero is
    /// unlimited.
    #[must_use]
    pub fn max_active_messages(mut self, count: usize) -> Self {
        self.max_active_messages = count;
        self
    }

    #[must_use]
    pub fn message_lock_expiry(mut self, expiry: Duration) -> Self {
        self.message_lock_expiry = expiry;
        self
    }

    #[must_use]
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Deliver in order with every other user of `context`.
    #[must_use]
    pub fn ordering_context(mut self, context: OrderingContext) -> Self {
        self.ordering_context = Some(context);
        self
    }

    /// Let the peer stop the session after `max_sequential_failures`
    /// failed deliveries.
    #[must_use]
    pub fn stoppable(mut self, max_sequential_failures: u32, hidden_message_delay: Duration) -> Self {
        self.stoppable = Some(StoppableOptions {
            max_sequential_failures,
            hidden_message_delay,
        });
        self
    }

    #[must_use]
    pub fn callback(&self) -> &Arc<dyn ConsumerCallback> { &self.callback }

    #[must_use]
    pub fn is_stoppable(&self) -> bool { self.stoppable.is_some() }

    #[must_use]
    pub fn max_sequential_failures(&self) -> Option<u32> {
        self.stoppable.map(|options| options.max_sequential_failures)
    }

    #[must_use]
    pub fn hidden_message_delay(&self) -> Option<Duration> {
        self.stoppable.map(|options| options.hidden_message_delay)
    }

    pub(crate) fn ordering(&self) -> Option<&OrderingContext> { self.ordering_context.as_ref() }

    /// A read-ahead queue cannot honour these options.
    pub(crate) fn needs_async_queue(&self) -> bool {
        self.max_active_messages != 0 || !self.message_lock_expiry.is_zero() || self.stoppable.is_some()
    }

    pub(crate) fn limits(&self) -> DeliveryLimits {
        DeliveryLimits {
            max_active_messages: self.max_active_messages,
            max_batch_size: self.max_batch_size,
        }
    }
}
