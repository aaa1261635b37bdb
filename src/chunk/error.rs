//! Error and status types emitted by the chunking layer.

use thiserror::Error;

/// Result of feeding a slice into a [`ChunkSeries`](crate::chunk::ChunkSeries).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    /// More slices are expected.
    Incomplete,
    /// The slice completed the message.
    Complete,
}

/// Ordering violations detected while assembling slices.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// A middle or last slice arrived before any first slice.
    #[error("slice received before the first slice of a message")]
    MissingFirst,
    /// A first slice arrived while another message was still incomplete.
    #[error("first slice received while a message is still being assembled")]
    UnexpectedFirst,
    /// A slice arrived after the last slice.
    #[error("slice received after the last slice of a message")]
    SeriesComplete,
}
