//! Inbound accumulation of message slices.

use bytes::Bytes;

use super::{ChunkError, ChunkSeries, ChunkStatus};
use crate::protocol::ChunkFlags;

/// Collects the slices of one chunked message.
#[derive(Debug, Default)]
pub struct SliceAssembler {
    series: ChunkSeries,
    slices: Vec<Bytes>,
    bytes: usize,
}

impl SliceAssembler {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Bytes accumulated so far.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize { self.bytes }

    /// Number of slices accumulated so far.
    #[must_use]
    pub fn slice_count(&self) -> usize { self.slices.len() }

    /// Append a slice.
    ///
    /// Returns the complete slice list when `flags` marks the last slice.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError`] when the slice is out of order; the assembler
    /// is left unchanged.
    pub fn push(
        &mut self,
        flags: ChunkFlags,
        payload: Bytes,
    ) -> Result<Option<Vec<Bytes>>, ChunkError> {
        let status = self.series.accept(flags)?;
        self.bytes += payload.len();
        self.slices.push(payload);
        match status {
            ChunkStatus::Incomplete => Ok(None),
            ChunkStatus::Complete => {
                self.series = ChunkSeries::new();
                self.bytes = 0;
                Ok(Some(std::mem::take(&mut self.slices)))
            }
        }
    }
}
