//! Error types for the codec layer.

use thiserror::Error;

use crate::protocol::Segment;

/// Failures reading or writing wire fields.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The reply ended before the field was complete.
    #[error("short read: need {need} bytes, {have} remaining")]
    ShortRead { need: usize, have: usize },
    /// A string field did not hold valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// A field is too long for its length prefix.
    #[error("field of {len} bytes exceeds its length prefix")]
    FieldTooLong { len: usize },
    /// The reply carried a segment other than the expected one.
    #[error("unexpected reply segment: expected {expected}, found {found}")]
    UnexpectedSegment { expected: Segment, found: Segment },
    /// Serialising a message failed.
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    /// Deserialising a message failed.
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    /// A message was reassembled from an empty slice list.
    #[error("no message slices to decode")]
    NoSlices,
}
