//! Browser sessions.

use std::sync::Arc;

use super::SessionCore;
use crate::{
    completion::cascade,
    connection::Connection,
    error::Result,
    message::{DestinationAddress, Message, SelectionCriteria},
    metrics,
    protocol::Segment,
    registry::ProxyId,
};

struct BrowserInner {
    core: SessionCore,
    destination: DestinationAddress,
    criteria: Option<SelectionCriteria>,
}

/// Walks the messages on a destination without consuming them.
#[derive(Clone)]
pub struct BrowserSession(Arc<BrowserInner>);

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("proxy_id", &self.proxy_id())
            .finish_non_exhaustive()
    }
}

impl BrowserSession {
    pub(crate) fn new(
        proxy_id: ProxyId,
        connection: Connection,
        destination: DestinationAddress,
        criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self(Arc::new(BrowserInner {
            core: SessionCore::new(proxy_id, connection, metrics::SessionKind::Browser),
            destination,
            criteria,
        }))
    }

    #[must_use]
    pub fn proxy_id(&self) -> ProxyId { self.0.core.proxy_id() }

    #[must_use]
    pub fn destination(&self) -> &DestinationAddress { &self.0.destination }

    #[must_use]
    pub fn criteria(&self) -> Option<&SelectionCriteria> { self.0.criteria.as_ref() }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.0.core.is_closed() }

    /// Fetch the next message; `None` once the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`](crate::error::ProxyError::SessionUnavailable)
    /// once closed, or the peer's error.
    pub async fn next(&self) -> Result<Option<Message>> {
        self.0.core.check_open()?;
        let request = self.0.core.request();
        let mut reply = self
            .0
            .core
            .exchange(Segment::BROWSE_NEXT, request, cascade::SESSION_RECEIVE)
            .await?;
        self.0.core.connection().read_received_message(&mut reply, None)
    }

    /// Move the cursor back to the first message.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionUnavailable`](crate::error::ProxyError::SessionUnavailable)
    /// once closed, or the peer's error.
    pub async fn reset(&self) -> Result<()> {
        self.0.core.check_open()?;
        let request = self.0.core.request();
        self.0
            .core
            .exchange(Segment::RESET_BROWSE, request, cascade::SESSION_CONTROL)
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
            .exchange(Segment::CLOSE_BROWSER_SESS, request, cascade::SESSION_CLOSE)
            .await
            .map(drop)
    }
}
