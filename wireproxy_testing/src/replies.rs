//! Builders for the replies and pushes a messaging engine would send.

use std::num::NonZeroUsize;

use bytes::Bytes;
use wireproxy::{
    codec::{BincodeMessageCodec, MessageCodec, RequestBuffer},
    completion::ExceptionKind,
    conversation::Reply,
    message::Message,
    protocol::{ChunkFlags, HandshakeProperties, Segment, level},
    registry::ProxyId,
};

/// A successful reply to `segment` with an empty body.
pub fn empty(segment: Segment) -> Reply { Reply::new(segment.reply(), Bytes::new()) }

/// A successful reply to `segment` carrying `body`.
pub fn success(segment: Segment, body: RequestBuffer) -> Reply {
    Reply::new(segment.reply(), body.freeze())
}

/// An exception reply carrying `kind`'s completion code.
pub fn exception(kind: ExceptionKind, message: &str) -> Reply { exception_code(kind.code(), message) }

/// An exception reply carrying a raw completion code.
pub fn exception_code(code: i16, message: &str) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_u16(1);
    body.put_i16(code);
    body.put_string(message).expect("exception message fits");
    Reply::new(Segment::EXCEPTION, body.freeze())
}

/// An XA exception reply carrying the resource manager's `xa_code`.
pub fn xa_exception(xa_code: i32, message: &str) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_u16(1);
    body.put_i16(ExceptionKind::Xa.code());
    body.put_string(message).expect("exception message fits");
    body.put_i32(xa_code);
    Reply::new(Segment::EXCEPTION, body.freeze())
}

/// Write the unique id stem and pooled ordering id sent from level 9.
pub fn put_level_fields(body: &mut RequestBuffer, object_id: i16, handshake: HandshakeProperties) {
    if handshake.supports(level::CHUNKING) {
        body
            .put_short_bytes(format!("stem-{object_id}").as_bytes())
            .expect("stem fits");
        body.put_i16(object_id + 100);
    }
}

/// Reply to a connect flow.
pub fn connected(object_id: i16, user: Option<&str>, handshake: HandshakeProperties) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_i16(object_id);
    body.put_string("engine-a").expect("name fits");
    body.put_string("engine-uuid").expect("uuid fits");
    body.put_opt_string(user).expect("user fits");
    put_level_fields(&mut body, object_id, handshake);
    success(Segment::CONNECT, body)
}

/// Reply to a clone flow.
pub fn established(segment: Segment, object_id: i16, handshake: HandshakeProperties) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_i16(object_id);
    put_level_fields(&mut body, object_id, handshake);
    success(segment, body)
}

/// Reply to a close flow that closed the connection; from level 9 the
/// reset byte is 0.
pub fn closed(handshake: HandshakeProperties) -> Reply {
    let mut body = RequestBuffer::new();
    if handshake.supports(level::CHUNKING) {
        body.put_u8(0);
    }
    success(Segment::CLOSE_CONNECTION, body)
}

/// Reply to a close flow that reset the connection under a new identity.
pub fn reset(object_id: i16, handshake: HandshakeProperties) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_u8(1);
    body.put_i16(object_id);
    put_level_fields(&mut body, object_id, handshake);
    success(Segment::CLOSE_CONNECTION, body)
}

/// Reply to a consumer creation carrying the message processor id.
pub fn consumer_created(segment: Segment, message_processor_id: i64) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_i64(message_processor_id);
    if segment == Segment::CREATE_CONSUMER_SESS {
        body.put_u16(0);
    }
    success(segment, body)
}

/// Reply to a producer or bifurcated consumer creation carrying its id.
pub fn proxy_created(segment: Segment, id: i16) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_i16(id);
    success(segment, body)
}

/// Reply to a prepare carrying the peer's vote.
pub fn vote(code: i32) -> Reply {
    let mut body = RequestBuffer::new();
    body.put_i32(code);
    success(Segment::XA_PREPARE, body)
}

/// Codec matching the default connection configuration.
pub fn codec() -> BincodeMessageCodec {
    BincodeMessageCodec::new(NonZeroUsize::new(64 * 1024).expect("non-zero"))
}

/// Encoded slices of `message`.
pub fn slices(message: &Message) -> Vec<Bytes> { codec().encode(message).expect("message encodes") }

/// Body of a receive reply carrying `message`, or an empty body.
pub fn received(segment: Segment, message: Option<&Message>) -> Reply {
    let mut body = RequestBuffer::new();
    match message {
        None => body.put_i32(0),
        Some(message) => {
            let slices = slices(message);
            body.put_i32(i32::try_from(slices.len()).expect("slice count fits"));
            for slice in &slices {
                body.put_slice(slice).expect("slice fits");
            }
        }
    }
    success(segment, body)
}

/// Push carrying one chunk of a message received on a connection.
pub fn connection_chunk(flags: ChunkFlags, slice: &[u8]) -> Bytes {
    let mut body = RequestBuffer::new();
    body.put_u8(flags.bits());
    body.put_slice(slice).expect("slice fits");
    body.freeze()
}

/// Push delivering `message` to the proxy queue of `session`.
pub fn proxy_message(session: ProxyId, batch: u16, message: &Message) -> Bytes {
    let slices = slices(message);
    let mut body = RequestBuffer::new();
    body.put_i16(session.as_i16());
    body.put_u16(batch);
    body.put_i32(i32::try_from(slices.len()).expect("slice count fits"));
    for slice in &slices {
        body.put_slice(slice).expect("slice fits");
    }
    body.freeze()
}

/// Push reporting an asynchronous error for `target`, zero meaning the
/// connection itself.
pub fn async_exception(target: i16, kind: ExceptionKind, message: &str) -> Bytes {
    let mut body = RequestBuffer::new();
    body.put_i16(target);
    body.put_u16(1);
    body.put_i16(kind.code());
    body.put_string(message).expect("message fits");
    body.freeze()
}

/// Push reporting an engine event.
pub fn event(code: i16) -> Bytes {
    let mut body = RequestBuffer::new();
    body.put_i16(code);
    body.freeze()
}

/// Push telling a stoppable consumer session that the peer stopped it.
pub fn session_stopped(session: ProxyId) -> Bytes {
    let mut body = RequestBuffer::new();
    body.put_i16(session.as_i16());
    body.freeze()
}
