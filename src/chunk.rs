//! Chunked transmission of large messages.
//!
//! Outbound, [`ChunkPlan`] tags each codec slice of a message with
//! first/middle/last [`ChunkFlags`](crate::protocol::ChunkFlags). Inbound,
//! [`SliceAssembler`] accumulates tagged slices in order, using a
//! [`ChunkSeries`] to reject slices that arrive out of place, and hands back
//! the complete slice list once the last slice arrives.

mod assembler;
mod error;
mod plan;
mod series;

pub use assembler::SliceAssembler;
pub use error::{ChunkError, ChunkStatus};
pub use plan::{Chunk, ChunkPlan};
pub use series::ChunkSeries;

#[cfg(test)]
mod tests;
