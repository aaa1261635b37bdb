//! Routing of pushes the peer sends without a request.
//!
//! Each conversation gets one [`ReceiveRouter`]. Pushes name their target by
//! proxy id and are dispatched to the consumer session registry, the proxy
//! queue group, or the connection's listeners. Work that may call back into
//! the connection runs on its own task so the conversation's receive loop
//! never waits on it.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};

use super::{Connection, ConnectionEvent, ConnectionInner};
use crate::{
    codec::ReplyBuffer,
    completion::{cascade, resolve},
    conversation::ReceiveListener,
    error::{ProxyError, Result},
    protocol::{ChunkFlags, Segment},
    proxy_queue::ProxyQueue,
    registry::ProxyId,
    session::ConsumerSession,
};

/// Proxy id the peer uses for errors that concern the whole connection.
const CONNECTION_TARGET: i16 = 0;

/// Receive listener bound to one connection once it is established.
#[derive(Debug, Default)]
pub(super) struct ReceiveRouter {
    connection: OnceLock<Weak<ConnectionInner>>,
}

impl ReceiveRouter {
    pub(super) fn bind(&self, connection: &Connection) {
        if self.connection.set(connection.downgrade()).is_err() {
            debug!(
                "receive router already bound; ignoring connection {}",
                connection.object_id()
            );
        }
    }

    fn connection(&self) -> Option<Connection> {
        self.connection
            .get()?
            .upgrade()
            .map(Connection::from_inner)
    }
}

#[async_trait]
impl ReceiveListener for ReceiveRouter {
    async fn data_received(&self, segment: Segment, payload: Bytes) {
        let Some(connection) = self.connection() else {
            debug!("dropping push {segment}: no connection");
            return;
        };
        if let Err(error) = route(&connection, ReplyBuffer::new(segment, payload)) {
            warn!(
                "failed to handle push {segment} on connection {}: {error}",
                connection.object_id()
            );
        }
    }
}

fn unknown_target(connection: &Connection, segment: Segment, id: ProxyId) {
    warn!(
        "push {segment} for unknown {id} on connection {}; dropped",
        connection.object_id()
    );
}

fn session(connection: &Connection, segment: Segment, id: ProxyId) -> Option<ConsumerSession> {
    let session = connection.consumer_session(id);
    if session.is_none() {
        unknown_target(connection, segment, id);
    }
    session
}

fn queue(connection: &Connection, segment: Segment, id: ProxyId) -> Option<Arc<ProxyQueue>> {
    let queue = connection
        .existing_queue_group()
        .and_then(|group| group.find(id));
    if queue.is_none() {
        unknown_target(connection, segment, id);
    }
    queue
}

fn route(connection: &Connection, mut push: ReplyBuffer) -> Result<()> {
    let segment = push.segment();
    match segment {
        Segment::CHUNKED_SYNC_CONN_MSG => {
            let flags = ChunkFlags::from_bits_truncate(push.get_u8()?);
            connection.add_message_part(flags, push.get_slice()?)
        }
        Segment::CHUNKED_SYNC_SESS_MSG => {
            let id = ProxyId::new(push.get_i16()?);
            let flags = ChunkFlags::from_bits_truncate(push.get_u8()?);
            let slice = push.get_slice()?;
            match session(connection, segment, id) {
                Some(session) => session.add_message_part(flags, slice),
                None => Ok(()),
            }
        }
        Segment::PROXY_MESSAGE => {
            let id = ProxyId::new(push.get_i16()?);
            let batch = push.get_u16()?;
            let count = usize::try_from(push.get_i32()?).unwrap_or_default();
            let mut slices = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                slices.push(push.get_slice()?);
            }
            if let Some(queue) = queue(connection, segment, id) {
                let message = connection.codec().decode(&slices)?;
                if !queue.put(batch, message) {
                    debug!("{id} discarded a message from stale batch {batch}");
                }
            }
            Ok(())
        }
        Segment::CHUNKED_PROXY_MESSAGE => {
            let id = ProxyId::new(push.get_i16()?);
            let batch = push.get_u16()?;
            let flags = ChunkFlags::from_bits_truncate(push.get_u8()?);
            let slice = push.get_slice()?;
            match queue(connection, segment, id) {
                Some(queue) => queue.add_message_part(batch, flags, slice, connection.codec()),
                None => Ok(()),
            }
        }
        Segment::ASYNC_SESSION_STOPPED => {
            let id = ProxyId::new(push.get_i16()?);
            if let Some(session) = session(connection, segment, id) {
                tokio::spawn(async move {
                    if let Err(error) = session.stoppable_consumer_session_stopped().await {
                        debug!("stopping consumer session {id} failed: {error}");
                    }
                });
            }
            Ok(())
        }
        Segment::ASYNC_EXCEPTION => {
            let target = push.get_i16()?;
            let (code, message) = push.read_exception()?;
            let error = resolve(code, message, cascade::SESSION_RECEIVE);
            if target == CONNECTION_TARGET {
                notify_async_exception(connection, error);
            } else if let Some(session) = session(connection, segment, ProxyId::new(target)) {
                tokio::spawn(async move { session.deliver_async_exception(error).await });
            }
            Ok(())
        }
        Segment::EVENT_OCCURRED => {
            let event = ConnectionEvent::from_wire(push.get_i16()?);
            notify_event(connection, event);
            Ok(())
        }
        other => {
            warn!(
                "unexpected push {other} on connection {}; dropped",
                connection.object_id()
            );
            Ok(())
        }
    }
}

fn notify_async_exception(connection: &Connection, error: ProxyError) {
    let listeners = connection.connection_listeners();
    if listeners.is_empty() {
        warn!(
            "connection {} has no listener for asynchronous error: {error}",
            connection.object_id()
        );
        return;
    }
    let connection = connection.clone();
    tokio::spawn(async move {
        for listener in listeners {
            listener.async_exception(&connection, &error).await;
        }
    });
}

fn notify_event(connection: &Connection, event: ConnectionEvent) {
    let listeners = connection.connection_listeners();
    debug!(
        "connection {} event {event:?} for {} listeners",
        connection.object_id(),
        listeners.len()
    );
    let connection = connection.clone();
    tokio::spawn(async move {
        for listener in listeners {
            listener.event_occurred(&connection, event).await;
        }
    });
}
