//! Field-level wire codec.
//!
//! [`RequestBuffer`] writes typed request fields in network byte order and
//! [`ReplyBuffer`] reads them back from a reply. [`MessageCodec`] turns a
//! [`Message`](crate::message::Message) into transmission slices and back;
//! the slice boundaries it produces are the ones chunked sends follow.

pub mod error;
mod message_codec;
mod reply;
mod request;

pub use error::CodecError;
pub use message_codec::{BincodeMessageCodec, MessageCodec};
pub use reply::ReplyBuffer;
pub use request::RequestBuffer;

/// Length prefix written in place of an absent string.
pub(crate) const NULL_STRING: u16 = u16::MAX;
