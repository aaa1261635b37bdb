//! Tests for chunk planning and slice assembly.

use bytes::Bytes;
use proptest::prelude::*;
use rstest::rstest;

use super::*;
use crate::protocol::ChunkFlags;

fn slices(sizes: &[usize]) -> Vec<Bytes> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, size)| Bytes::from(vec![u8::try_from(i % 251).unwrap_or(0); *size]))
        .collect()
}

#[rstest]
#[case(0, 1, ChunkFlags::FIRST | ChunkFlags::LAST)]
#[case(0, 3, ChunkFlags::FIRST)]
#[case(1, 3, ChunkFlags::MIDDLE)]
#[case(2, 3, ChunkFlags::LAST)]
fn flags_follow_slice_position(
    #[case] index: usize,
    #[case] count: usize,
    #[case] expected: ChunkFlags,
) {
    assert_eq!(ChunkPlan::flags_for(index, count), expected);
}

#[test]
fn threshold_is_inclusive() {
    let plan = ChunkPlan::new(slices(&[10, 10]));
    assert!(plan.needs_chunking(20));
    assert!(!plan.needs_chunking(21));
}

#[test]
fn whole_buffer_concatenates_slices() {
    let plan = ChunkPlan::new(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
    assert_eq!(plan.into_whole(), Bytes::from_static(b"abcd"));
}

#[test]
fn middle_slice_without_first_is_rejected() {
    let mut assembler = SliceAssembler::new();
    let err = assembler
        .push(ChunkFlags::MIDDLE, Bytes::from_static(b"x"))
        .expect_err("no first slice yet");
    assert_eq!(err, ChunkError::MissingFirst);
    assert_eq!(assembler.slice_count(), 0);
}

#[test]
fn second_first_slice_is_rejected() {
    let mut series = ChunkSeries::new();
    series.accept(ChunkFlags::FIRST).expect("first slice");
    assert_eq!(series.accept(ChunkFlags::FIRST), Err(ChunkError::UnexpectedFirst));
}

#[test]
fn assembler_resets_after_completion() {
    let mut assembler = SliceAssembler::new();
    assert_eq!(
        assembler
            .push(ChunkFlags::FIRST, Bytes::from_static(b"a"))
            .expect("first"),
        None
    );
    let done = assembler
        .push(ChunkFlags::LAST, Bytes::from_static(b"b"))
        .expect("last")
        .expect("complete");
    assert_eq!(done.len(), 2);
    assert_eq!(assembler.buffered_bytes(), 0);
    assert!(
        assembler
            .push(ChunkFlags::FIRST | ChunkFlags::LAST, Bytes::from_static(b"c"))
            .expect("fresh message")
            .is_some()
    );
}

proptest! {
    #[test]
    fn tagged_chunks_reassemble_in_order(sizes in proptest::collection::vec(0usize..64, 1..12)) {
        let original = slices(&sizes);
        let mut assembler = SliceAssembler::new();
        let mut result = None;
        for chunk in ChunkPlan::new(original.clone()).into_chunks() {
            prop_assert!(result.is_none());
            result = assembler.push(chunk.flags, chunk.payload).expect("ordered slices");
        }
        prop_assert_eq!(result, Some(original));
    }
}
