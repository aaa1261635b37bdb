//! State shared by every session kind.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    codec::{ReplyBuffer, RequestBuffer},
    completion::ExceptionKind,
    connection::Connection,
    conversation::Priority,
    error::{ProxyError, Result},
    metrics,
    protocol::Segment,
    registry::ProxyId,
};

/// Identity of a session and its route to the peer.
pub(crate) struct SessionCore {
    proxy_id: ProxyId,
    connection: Connection,
    kind: metrics::SessionKind,
    closed: AtomicBool,
}

impl SessionCore {
    pub(crate) fn new(proxy_id: ProxyId, connection: Connection, kind: metrics::SessionKind) -> Self {
        metrics::inc_sessions(kind);
        Self {
            proxy_id,
            connection,
            kind,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn proxy_id(&self) -> ProxyId { self.proxy_id }

    pub(crate) fn connection(&self) -> &Connection { &self.connection }

    pub(crate) fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Fail with [`ProxyError::SessionUnavailable`] once the session or its
    /// connection has closed.
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() || self.connection.is_closed() {
            return Err(ProxyError::SessionUnavailable(format!(
                "session {} is closed",
                self.proxy_id
            )));
        }
        Ok(())
    }

    /// Mark the session closed. Returns false when it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::AcqRel);
        if was_open {
            metrics::dec_sessions(self.kind);
        }
        was_open
    }

    /// Start a request with the connection object id and proxy id.
    pub(crate) fn request(&self) -> RequestBuffer {
        let mut request = RequestBuffer::new();
        request.put_i16(self.connection.object_id());
        request.put_i16(self.proxy_id.as_i16());
        request
    }

    /// Exchange under the close read lock and check the completion code.
    pub(crate) async fn exchange(
        &self,
        segment: Segment,
        request: RequestBuffer,
        cascade: &[ExceptionKind],
    ) -> Result<ReplyBuffer> {
        let mut reply = self
            .connection
            .exchange_shared(segment, Priority::Medium, request)
            .await?;
        reply.check_completion(segment.reply(), cascade)?;
        Ok(reply)
    }

    /// Flow a session control request; a reply is awaited from level 3.
    pub(crate) async fn control(&self, segment: Segment, cascade: &[ExceptionKind]) -> Result<()> {
        let request = self.request();
        if self
            .connection
            .handshake()
            .supports(crate::protocol::level::START_REPLY)
        {
            self.exchange(segment, request, cascade).await.map(drop)
        } else {
            self.connection
                .send_shared(segment, Priority::Medium, request)
                .await
        }
    }
}
