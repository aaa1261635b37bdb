//! Ordering tracker for the slices of one message.

use super::{ChunkError, ChunkStatus};
use crate::protocol::ChunkFlags;

/// Track where in a chunked message the next slice belongs.
///
/// The series keeps only two flags so it can be embedded wherever slices are
/// accumulated.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkSeries {
    started: bool,
    complete: bool,
}

impl ChunkSeries {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            started: false,
            complete: false,
        }
    }

    /// Returns true once a first slice has been accepted.
    #[must_use]
    pub const fn is_started(&self) -> bool { self.started }

    /// Returns true once the last slice has been accepted.
    #[must_use]
    pub const fn is_complete(&self) -> bool { self.complete }

    /// Accept a slice carrying `flags`.
    ///
    /// # Examples
    ///
    /// ```
    /// use wireproxy::{
    ///     chunk::{ChunkSeries, ChunkStatus},
    ///     protocol::ChunkFlags,
    /// };
    ///
    /// let mut series = ChunkSeries::new();
    /// assert_eq!(series.accept(ChunkFlags::FIRST), Ok(ChunkStatus::Incomplete));
    /// assert_eq!(series.accept(ChunkFlags::MIDDLE), Ok(ChunkStatus::Incomplete));
    /// assert_eq!(series.accept(ChunkFlags::LAST), Ok(ChunkStatus::Complete));
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::MissingFirst`] for a middle or last slice with no
    /// preceding first slice, [`ChunkError::UnexpectedFirst`] for a first
    /// slice while a message is in progress and [`ChunkError::SeriesComplete`]
    /// for any slice after the last.
    pub fn accept(&mut self, flags: ChunkFlags) -> Result<ChunkStatus, ChunkError> {
        if self.complete {
            return Err(ChunkError::SeriesComplete);
        }

        if flags.contains(ChunkFlags::FIRST) {
            if self.started {
                return Err(ChunkError::UnexpectedFirst);
            }
            self.started = true;
        } else if !self.started {
            return Err(ChunkError::MissingFirst);
        }

        if flags.contains(ChunkFlags::LAST) {
            self.complete = true;
            return Ok(ChunkStatus::Complete);
        }
        Ok(ChunkStatus::Incomplete)
    }
}
