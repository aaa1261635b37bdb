//! Producer sessions.

use std::sync::Arc;

use super::SessionCore;
use crate::{
    completion::cascade,
    connection::{Connection, SendRoute},
    error::Result,
    message::{DestinationAddress, DestinationType, Message},
    metrics,
    ordering::OrderingContext,
    protocol::Segment,
    registry::ProxyId,
    transaction::{self, Transaction},
};

struct ProducerInner {
    core: SessionCore,
    destination: DestinationAddress,
    destination_type: Option<DestinationType>,
    ordering: Option<OrderingContext>,
}

/// Sends messages to the destination fixed at creation.
///
/// The session holds one use of its ordering context until it closes.
#[derive(Clone)]
pub struct ProducerSession(Arc<ProducerInner>);

impl std::fmt::Debug for ProducerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSession")
            .field("proxy_id", &self.proxy_id())
            .finish_non_exhaustive()
    }
}

impl ProducerSession {
    pub(crate) fn new(
        proxy_id: ProxyId,
        connection: Connection,
        destination: DestinationAddress,
        destination_type: Option<DestinationType>,
        ordering: Option<OrderingContext>,
    ) -> Self {
        Self(Arc::new(ProducerInner {
            core: SessionCore::new(proxy_id, connection, metrics::SessionKind::Producer),
            destination,
            destination_type,
            ordering,
        }))
    }

    #[must_use]
    pub fn proxy_id(&self) -> ProxyId { self.0.core.proxy_id() }

    #[must_use]
    pub fn destination(&self) -> &DestinationAddress { &self.0.destination }

    #[must_use]
    pub fn destination_type(&self) -> Option<DestinationType> { self.0.destination_type }

    #[must_use]
    pub fn ordering_context(&self) -> Option<&OrderingContext> { self.0.ordering.as_ref() }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.0.core.is_closed() }

    /// Send `message`, optionally under a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`](crate::error::ProxyError::SessionUnavailable)
    /// once closed, [`ProxyError::IncorrectCall`](crate::error::ProxyError::IncorrectCall)
    /// for a completed transaction, or the peer's error.
    pub async fn send(&self, message: &Message, transaction: Option<&Transaction>) -> Result<()> {
        self.0.core.check_open()?;
        transaction::ensure_valid(transaction)?;
        self.0
            .core
            .connection()
            .transmit(
                SendRoute::Session(self.proxy_id()),
                message,
                transaction,
                self.0.ordering.as_ref(),
            )
            .await
    }

    /// Close the session and release its ordering context.
    ///
    /// # Errors
    ///
    /// Returns the peer's error if the close flow fails.
    pub async fn close(&self) -> Result<()> {
        if !self.0.core.mark_closed() {
            return Ok(());
        }
        if let Some(ordering) = &self.0.ordering {
            ordering.decrement_use_count();
        }
        if self.0.core.connection().is_closed() {
            return Ok(());
        }
        let request = self.0.core.request();
        self.0
            .core
            .exchange(Segment::CLOSE_PRODUCER_SESS, request, cascade::SESSION_CLOSE)
            .await
            .map(drop)
    }
}
