//! Message encoding into transmission slices.

use std::{fmt, num::NonZeroUsize};

use bincode::config;
use bytes::{Bytes, BytesMut};

use super::CodecError;
use crate::message::Message;

/// Turns messages into slices for transmission and reassembles them.
///
/// The concatenation of the slices returned by [`encode`](Self::encode) is
/// the complete encoded message; [`decode`](Self::decode) accepts any
/// partition of that byte sequence.
pub trait MessageCodec: Send + Sync + fmt::Debug + 'static {
    /// Encode `message` into one or more slices.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the message cannot be encoded.
    fn encode(&self, message: &Message) -> Result<Vec<Bytes>, CodecError>;

    /// Rebuild a message from its slices in transmission order.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the bytes do not form a message.
    fn decode(&self, slices: &[Bytes]) -> Result<Message, CodecError>;
}

/// Default codec: `bincode` standard configuration cut at a fixed slice size.
#[derive(Clone, Copy, Debug)]
pub struct BincodeMessageCodec {
    max_slice_size: NonZeroUsize,
}

impl BincodeMessageCodec {
    #[must_use]
    pub const fn new(max_slice_size: NonZeroUsize) -> Self { Self { max_slice_size } }

    /// Largest slice produced by [`MessageCodec::encode`].
    #[must_use]
    pub const fn max_slice_size(&self) -> NonZeroUsize { self.max_slice_size }
}

impl MessageCodec for BincodeMessageCodec {
    fn encode(&self, message: &Message) -> Result<Vec<Bytes>, CodecError> {
        let encoded = Bytes::from(bincode::encode_to_vec(message, config::standard())?);
        let size = self.max_slice_size.get();
        let mut slices = Vec::with_capacity(encoded.len().div_ceil(size).max(1));
        let mut rest = encoded;
        while rest.len() > size {
            slices.push(rest.split_to(size));
        }
        slices.push(rest);
        Ok(slices)
    }

    fn decode(&self, slices: &[Bytes]) -> Result<Message, CodecError> {
        let (message, _) = match slices {
            [] => return Err(CodecError::NoSlices),
            [single] => bincode::decode_from_slice(single, config::standard())?,
            many => {
                let mut joined = BytesMut::with_capacity(many.iter().map(Bytes::len).sum());
                for slice in many {
                    joined.extend_from_slice(slice);
                }
                bincode::decode_from_slice(&joined, config::standard())?
            }
        };
        Ok(message)
    }
}
