//! Outbound slice tagging.

use bytes::Bytes;

use crate::protocol::ChunkFlags;

/// One tagged slice ready for transmission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub flags: ChunkFlags,
    pub payload: Bytes,
}

impl Chunk {
    /// Returns true for the slice that carries the destination fields.
    #[must_use]
    pub fn is_first(&self) -> bool { self.flags.contains(ChunkFlags::FIRST) }

    /// Returns true for the slice whose transmission may require a reply.
    #[must_use]
    pub fn is_last(&self) -> bool { self.flags.contains(ChunkFlags::LAST) }
}

/// The slices of one message in transmission order.
#[derive(Clone, Debug)]
pub struct ChunkPlan {
    slices: Vec<Bytes>,
}

impl ChunkPlan {
    /// Plan the transmission of `slices`, as produced by the message codec.
    #[must_use]
    pub fn new(slices: Vec<Bytes>) -> Self { Self { slices } }

    /// Total encoded size across all slices.
    #[must_use]
    pub fn total_len(&self) -> usize { self.slices.iter().map(Bytes::len).sum() }

    /// Number of slices.
    #[must_use]
    pub fn len(&self) -> usize { self.slices.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.slices.is_empty() }

    /// Returns true when a message of this size must be chunked.
    #[must_use]
    pub fn needs_chunking(&self, threshold: usize) -> bool { self.total_len() >= threshold }

    /// Flags for the slice at `index` out of `count`.
    #[must_use]
    pub fn flags_for(index: usize, count: usize) -> ChunkFlags {
        let mut flags = ChunkFlags::empty();
        if index == 0 {
            flags |= ChunkFlags::FIRST;
        }
        if index + 1 == count {
            flags |= ChunkFlags::LAST;
        }
        if flags.is_empty() {
            flags = ChunkFlags::MIDDLE;
        }
        flags
    }

    /// Concatenate the slices into one buffer for unchunked transmission.
    #[must_use]
    pub fn into_whole(self) -> Bytes {
        match <[Bytes; 1]>::try_from(self.slices) {
            Ok([single]) => single,
            Err(slices) => Bytes::from(slices.concat()),
        }
    }

    /// Tag every slice.
    pub fn into_chunks(self) -> impl Iterator<Item = Chunk> {
        let count = self.slices.len();
        self.slices
            .into_iter()
            .enumerate()
            .map(move |(index, payload)| Chunk {
                flags: Self::flags_for(index, count),
                payload,
            })
    }
}
