//! Cloning, closing and invalidating connections.

use std::sync::{Arc, atomic::Ordering};

use log::{debug, warn};

use super::{
    ActiveConnection, Connection, ConnectionKind, Established, ReceiveRouter,
    builder::{Assembly, assemble, read_level_fields},
    exchange_on, lock,
};
use crate::{
    codec::ReplyBuffer,
    completion::cascade,
    conversation::Priority,
    error::Result,
    metrics::{self, CloneCacheResult},
    protocol::{Segment, level},
};

/// What the close flow needs to know to decide whether to reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct ResetInputs {
    /// The peer negotiated a level that carries the reset byte.
    pub(super) supports_reset: bool,
    pub(super) force: bool,
    /// The connection is a clone whose parent is still open.
    pub(super) parent_open: bool,
    pub(super) parent_cached: usize,
    pub(super) max_cached: usize,
}

/// Ask the peer to reset a closing clone for reuse instead of destroying
/// it.
pub(super) fn should_reset(inputs: ResetInputs) -> bool {
    inputs.supports_reset
        && !inputs.force
        && inputs.parent_open
        && inputs.parent_cached < inputs.max_cached
}

impl Connection {
    fn parent(&self) -> Option<Connection> {
        self.0
            .parent
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
            .map(Connection::from_inner)
    }

    /// Create a sibling connection over a clone of this conversation.
    ///
    /// A clone reset by an earlier close is reused when one is cached.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`](crate::error::ProxyError::ConnectionUnavailable)
    /// once closed, a transport failure, or the peer's error from the clone
    /// cascade.
    pub async fn clone_connection(&self) -> Result<Connection> {
        let _guard = self.operation().await?;
        let cached = lock(&self.0.clone_cache).pop();
        if let Some(clone) = cached {
            clone.reopen(self);
            metrics::clone_cache(CloneCacheResult::Hit);
            debug!(
                "reusing cached clone {} of connection {}",
                clone.object_id(),
                self.object_id()
            );
            return Ok(clone);
        }
        metrics::clone_cache(CloneCacheResult::Miss);

        let router = Arc::new(ReceiveRouter::default());
        let conversation = self
            .0
            .conversation
            .clone_conversation(router.clone())
            .await?;
        let reply = exchange_on(
            conversation.as_ref(),
            Segment::CREATE_CLONE_CONNECTION,
            Priority::Medium,
            self.request(),
        )
        .await
        .and_then(|mut reply| {
            reply.check_completion(Segment::CREATE_CLONE_CONNECTION.reply(), cascade::CLONE)?;
            let object_id = reply.get_i16()?;
            read_level_fields(object_id, &mut reply, self.0.handshake)
        });
        let established = match reply {
            Ok(established) => established,
            Err(error) => {
                conversation.fast_close().await;
                return Err(error);
            }
        };
        let kind = if self.0.handshake.supports(level::OPTIMIZED_TRANSACTIONS) {
            ConnectionKind::XaRecoveryCapable
        } else {
            ConnectionKind::Standard
        };
        let clone = assemble(Assembly {
            conversation,
            config: self.0.config.clone(),
            codec: Arc::clone(&self.0.codec),
            xid_table: Arc::clone(&self.0.xid_table),
            kind,
            engine: self.0.engine.clone(),
            parent: Some(self.downgrade()),
            established,
        });
        router.bind(&clone);
        debug!("cloned connection {} as {}", self.object_id(), clone.object_id());
        Ok(clone)
    }

    /// Bring a cached clone back into service for `parent`.
    fn reopen(&self, parent: &Connection) {
        *lock(&self.0.active) = Some(ActiveConnection::new());
        *lock(&self.0.listeners) = parent.connection_listeners();
        self.0.closed.store(false, Ordering::Release);
    }

    /// Offer a reset clone to its parent's cache. Returns false when the
    /// parent has closed or the cache filled up meanwhile.
    fn cache_clone(&self, clone: &Connection) -> bool {
        let mut cache = lock(&self.0.clone_cache);
        if self.is_closed() || cache.len() >= self.0.config.max_cached_clones_value() {
            return false;
        }
        cache.push(clone.clone());
        true
    }

    /// Close the connection and every session it created.
    ///
    /// Waits for in-flight operations to finish. A clone closed without
    /// `force` may be reset by the peer and cached by its parent for reuse.
    /// Transport failures during the close flow are logged, not returned.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; the result is kept for callers that
    /// treat close like any other flow.
    pub async fn close(&self, force: bool) -> Result<()> {
        let write = Arc::clone(&self.0.close_lock).write_owned().await;
        if self.is_closed() {
            return Ok(());
        }
        let cached: Vec<Connection> = std::mem::take(&mut *lock(&self.0.clone_cache));
        for clone in cached {
            clone.destroy_cached().await;
            metrics::clone_cache(CloneCacheResult::Destroyed);
        }

        let parent = self.parent();
        let reset = should_reset(ResetInputs {
            supports_reset: self.0.handshake.supports(level::CHUNKING),
            force,
            parent_open: parent.as_ref().is_some_and(|parent| !parent.is_closed()),
            parent_cached: parent.as_ref().map_or(0, Connection::cached_clone_count),
            max_cached: self.0.config.max_cached_clones_value(),
        });
        let (flow_ok, established) = match self.close_flow(reset).await {
            Ok(reply) => (true, reply),
            Err(error) => {
                warn!("close flow for connection {} failed: {error}", self.object_id());
                (false, None)
            }
        };

        self.teardown().await;
        drop(write);

        match (established, parent) {
            (Some(established), Some(parent)) => {
                self.adopt(established);
                if parent.cache_clone(self) {
                    metrics::clone_cache(CloneCacheResult::Cached);
                    debug!(
                        "connection {} reset and cached by {}",
                        self.object_id(),
                        parent.object_id()
                    );
                } else {
                    self.0.conversation.fast_close().await;
                }
            }
            _ => self.release_conversation(flow_ok).await,
        }
        Ok(())
    }

    /// Flow the close request. From level 9 the reply starts with a byte
    /// saying whether the peer reset the connection; a reset reply then
    /// carries the identity the clone takes on for reuse.
    async fn close_flow(&self, reset: bool) -> Result<Option<Established>> {
        let reset_capable = self.0.handshake.supports(level::CHUNKING);
        let mut request = self.request();
        if reset_capable {
            request.put_u8(u8::from(reset));
        }
        let mut reply = self
            .exchange(Segment::CLOSE_CONNECTION, Priority::Medium, request)
            .await?;
        reply.check_completion(Segment::CLOSE_CONNECTION.reply(), cascade::CLOSE)?;
        if !reset_capable || reply.get_u8()? != 1 {
            if reset {
                debug!("peer declined to reset connection {}", self.object_id());
            }
            return Ok(None);
        }
        let object_id = reply.get_i16()?;
        read_level_fields(object_id, &mut reply, self.0.handshake).map(Some)
    }

    /// Destroy a clone held in the cache. Its sessions were torn down when
    /// it was reset.
    async fn destroy_cached(&self) {
        let mut request = self.request();
        if self.0.handshake.supports(level::CHUNKING) {
            request.put_u8(0);
        }
        let flowed = self
            .exchange(Segment::CLOSE_CONNECTION, Priority::Medium, request)
            .await
            .and_then(|mut reply: ReplyBuffer| {
                reply.check_completion(Segment::CLOSE_CONNECTION.reply(), cascade::CLOSE)
            });
        if let Err(error) = &flowed {
            warn!("destroying cached clone {} failed: {error}", self.object_id());
        }
        self.release_conversation(flowed.is_ok()).await;
    }

    /// Release the conversation of a connection that was not reset.
    ///
    /// From level 9 the peer tears its side down too, so the conversation
    /// is fast-closed; older peers get a graceful close. A failed close flow
    /// always fast-closes.
    async fn release_conversation(&self, flow_ok: bool) {
        if flow_ok && !self.0.handshake.supports(level::CHUNKING) {
            if let Err(error) = self.0.conversation.close().await {
                warn!(
                    "closing conversation {} failed: {error}",
                    self.conversation_id()
                );
            }
        } else {
            self.0.conversation.fast_close().await;
        }
    }

    /// Mark the connection closed and release everything hanging off it.
    ///
    /// Called with the close lock held exclusively, so sessions are closed
    /// without taking their own locks or flowing.
    async fn teardown(&self) {
        self.0.closed.store(true, Ordering::Release);
        lock(&self.0.ordering_pool).clear();
        lock(&self.0.listeners).clear();
        *lock(&self.0.pending_slices) = None;
        *lock(&self.0.unique_id_stem) = None;
        for session in self.0.sessions.drain() {
            if let Err(error) = session.close_internal(true).await {
                debug!("session {} close during teardown: {error}", session.proxy_id());
            }
        }
        let group = lock(&self.0.queue_group).take();
        if let Some(group) = group {
            group.close_notification();
        }
        lock(&self.0.active).take();
    }

    /// Tear the connection down after a failure that leaves it unusable.
    ///
    /// No close flow is sent; the conversation is dropped.
    pub async fn invalidate(&self) {
        let write = Arc::clone(&self.0.close_lock).write_owned().await;
        if self.is_closed() {
            return;
        }
        warn!("invalidating connection {}", self.object_id());
        let cached: Vec<Connection> = std::mem::take(&mut *lock(&self.0.clone_cache));
        self.teardown().await;
        drop(write);
        for clone in cached {
            clone.0.conversation.fast_close().await;
            metrics::clone_cache(CloneCacheResult::Destroyed);
        }
        self.0.conversation.fast_close().await;
    }
}
