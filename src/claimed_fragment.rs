/*
 * Handles over space a producer reserved but has not published yet. Both
 * types borrow the partition, so the memory outlives them, and both consume
 * themselves on commit/abort so a claim is completed exactly once. A handle
 * dropped without either aborts, the same way an unpublished write buffer is
 * handed back.
*/
use crate::constants::{FLAG_BATCH_BEGIN, FLAG_BATCH_END, FRAME_ALIGNMENT, FRAME_HEADER_SIZE};
use crate::error::Error;
use crate::partition::LogBufferPartition;
use crate::position::Position;
use crate::utils::align;
use log::warn;

pub struct ClaimedFragment<'a> {
    partition: &'a LogBufferPartition,
    offset: u32,
    length: usize,
    position: Position,
    completed: bool,
}

impl std::fmt::Debug for ClaimedFragment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedFragment")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}

impl<'a> ClaimedFragment<'a> {
    pub(crate) fn new(
        partition: &'a LogBufferPartition,
        partition_id: u32,
        offset: u32,
        length: usize,
    ) -> ClaimedFragment<'a> {
        let end = offset as usize + align(FRAME_HEADER_SIZE + length, FRAME_ALIGNMENT);
        return ClaimedFragment {
            partition,
            offset,
            length,
            position: Position::new(partition_id, end as u32),
            completed: false,
        };
    }

    /// The position right after this fragment, what an `offer` of the same
    /// payload would have returned.
    pub fn position(&self) -> Position {
        return self.position;
    }

    pub fn offset(&self) -> u32 {
        return self.offset;
    }

    pub fn len(&self) -> usize {
        return self.length;
    }

    pub fn is_empty(&self) -> bool {
        return self.length == 0;
    }

    pub fn buffer(&mut self) -> &mut [u8] {
        // the claim gave us this range, we hand out at most one &mut at a time
        unsafe {
            return self.partition.payload_mut(self.offset, self.length);
        }
    }

    pub fn commit(mut self) {
        self.completed = true;
        self.partition.commit(self.offset);
    }

    pub fn abort(mut self) {
        self.completed = true;
        self.partition.abort(self.offset);
    }
}

impl Drop for ClaimedFragment<'_> {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                "Fragment at {} was never committed, aborting it",
                self.position
            );
            self.partition.abort(self.offset);
        }
    }
}

/// Several fragments under one tail reservation. Readers see either all of
/// them or none: the first fragment is committed last and they stop at it.
pub struct ClaimedFragmentBatch<'a> {
    partition: &'a LogBufferPartition,
    partition_id: u32,
    // start of the reservation
    offset: u32,
    reserved_length: u32,
    fragment_count: usize,
    // where the next fragment goes
    next_offset: u32,
    created: usize,
    completed: bool,
}

impl std::fmt::Debug for ClaimedFragmentBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedFragmentBatch")
            .field("offset", &self.offset)
            .field("reserved_length", &self.reserved_length)
            .field("fragments", &self.created)
            .field("fragment_count", &self.fragment_count)
            .finish()
    }
}

/// Bytes to reserve so that `fragment_count` fragments with `batch_length`
/// payload bytes between them always fit, whatever the split. `None` when
/// that does not even fit a usize.
pub(crate) fn batch_reservation(fragment_count: usize, batch_length: usize) -> Option<usize> {
    let overhead = fragment_count.checked_mul(FRAME_HEADER_SIZE + FRAME_ALIGNMENT)?;
    let unaligned = batch_length.checked_add(overhead)?;
    if unaligned > usize::MAX - FRAME_ALIGNMENT {
        return None;
    }
    return Some(align(unaligned, FRAME_ALIGNMENT));
}

impl<'a> ClaimedFragmentBatch<'a> {
    pub(crate) fn new(
        partition: &'a LogBufferPartition,
        partition_id: u32,
        offset: u32,
        reserved_length: u32,
        fragment_count: usize,
    ) -> ClaimedFragmentBatch<'a> {
        return ClaimedFragmentBatch {
            partition,
            partition_id,
            offset,
            reserved_length,
            fragment_count,
            next_offset: offset,
            created: 0,
            completed: false,
        };
    }

    /// The position right after the whole reservation.
    pub fn position(&self) -> Position {
        return Position::new(self.partition_id, self.offset + self.reserved_length);
    }

    /// The position right after the most recent fragment, `None` before the
    /// first one.
    pub fn fragment_position(&self) -> Option<Position> {
        if self.created == 0 {
            return None;
        }
        return Some(Position::new(self.partition_id, self.next_offset));
    }

    pub fn fragment_count(&self) -> usize {
        return self.created;
    }

    /// Adds a fragment and returns its payload to write into.
    pub fn next_fragment(&mut self, length: usize, stream_id: u32) -> Result<&mut [u8], Error> {
        let remaining = (self.offset + self.reserved_length - self.next_offset) as usize;
        let aligned = align(FRAME_HEADER_SIZE + length, FRAME_ALIGNMENT);
        if self.created == self.fragment_count || aligned > remaining {
            return Err(Error::FragmentOverflow {
                requested: length,
                remaining: remaining.saturating_sub(FRAME_HEADER_SIZE),
            });
        }

        let fragment_offset = self.next_offset;
        self.partition.write_header(
            fragment_offset,
            (FRAME_HEADER_SIZE + length) as u32,
            stream_id,
            0,
        );
        self.next_offset += aligned as u32;
        self.created += 1;

        unsafe {
            return Ok(self.partition.payload_mut(fragment_offset, length));
        }
    }

    pub fn commit(mut self) {
        self.completed = true;

        let end = self.offset + self.reserved_length;
        if self.next_offset < end {
            self.partition
                .write_padding(self.next_offset, end - self.next_offset);
        }
        if self.created == 0 {
            // the padding above covers the whole reservation
            return;
        }

        // commit back to front, readers are held at the first fragment until
        // it flips
        let mut offsets = Vec::with_capacity(self.created);
        let mut fragment_offset = self.offset;
        for _ in 0..self.created {
            offsets.push(fragment_offset);
            let length = self.partition.frame_length(fragment_offset) as usize;
            fragment_offset += align(length, FRAME_ALIGNMENT) as u32;
        }

        self.partition
            .add_flags(offsets[offsets.len() - 1], FLAG_BATCH_END);
        self.partition.add_flags(offsets[0], FLAG_BATCH_BEGIN);
        for fragment_offset in offsets.iter().skip(1).rev() {
            self.partition.commit(*fragment_offset);
        }
        self.partition.commit(offsets[0]);
    }

    pub fn abort(mut self) {
        self.completed = true;
        self.partition
            .abort_range(self.offset, self.reserved_length);
    }
}

impl Drop for ClaimedFragmentBatch<'_> {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                "Batch of {} fragments at {} was never committed, aborting it",
                self.created,
                Position::new(self.partition_id, self.offset)
            );
            self.partition
                .abort_range(self.offset, self.reserved_length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_fd::MemFd;
    use crate::partition::{ReadFrame, Reservation};
    use std::sync::Arc;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn partition(size: u32) -> LogBufferPartition {
        let mem = Arc::new(MemFd::new("claims", 64 + size as usize).expect("Should map"));
        return LogBufferPartition::new(mem, 0, 0, 64, size);
    }

    fn claim(partition: &LogBufferPartition, length: usize) -> ClaimedFragment<'_> {
        match partition.claim(length, 3) {
            Reservation::Reserved(offset) => ClaimedFragment::new(partition, 0, offset, length),
            Reservation::EndOfPartition => panic!("Should fit"),
        }
    }

    fn batch(
        partition: &LogBufferPartition,
        fragment_count: usize,
        batch_length: usize,
    ) -> ClaimedFragmentBatch<'_> {
        let reserved = batch_reservation(fragment_count, batch_length).expect("Should fit") as u32;
        match partition.reserve(reserved) {
            Reservation::Reserved(offset) => {
                ClaimedFragmentBatch::new(partition, 0, offset, reserved, fragment_count)
            }
            Reservation::EndOfPartition => panic!("Should fit"),
        }
    }

    #[test]
    fn fragment_commit() {
        init();
        let partition = partition(1024);
        let mut fragment = claim(&partition, 4);
        assert_eq!(fragment.position(), Position::new(0, 32));
        assert_eq!(fragment.len(), 4);
        fragment.buffer().copy_from_slice(b"abcd");
        fragment.commit();

        match partition.read_from(0) {
            ReadFrame::Frame(frame) => assert_eq!(frame.payload(), b"abcd"),
            other => panic!("Expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn dropped_fragment_is_aborted() {
        init();
        let partition = partition(1024);
        {
            let mut fragment = claim(&partition, 4);
            fragment.buffer().copy_from_slice(b"lost");
        }
        assert!(matches!(partition.read_from(0), ReadFrame::Padding { .. }));
    }

    #[test]
    fn batch_commits_as_a_whole() {
        init();
        let partition = partition(1024);
        let mut batch = batch(&partition, 3, 30);
        assert_eq!(batch.fragment_position(), None);

        batch.next_fragment(10, 1).expect("Should fit").fill(1);
        batch.next_fragment(10, 2).expect("Should fit").fill(2);
        // nothing visible while the batch is open
        assert!(matches!(partition.read_from(0), ReadFrame::Blocked));
        batch.next_fragment(10, 3).expect("Should fit").fill(3);
        assert_eq!(batch.fragment_count(), 3);
        assert_eq!(batch.fragment_position(), Some(Position::new(0, 96)));
        assert!(batch.next_fragment(0, 4).is_err());

        let end = batch.position().partition_offset();
        batch.commit();

        let mut offset = 0;
        let mut seen = vec![];
        while offset < end {
            match partition.read_from(offset) {
                ReadFrame::Frame(frame) => {
                    seen.push((frame.stream_id(), frame.flags()));
                    assert!(frame.payload().iter().all(|b| *b == frame.stream_id() as u8));
                    offset = frame.next_offset();
                }
                ReadFrame::Padding { length } => {
                    offset += align(length as usize, FRAME_ALIGNMENT) as u32
                }
                other => panic!("Unexpected {:?} at {}", other, offset),
            }
        }
        assert_eq!(offset, end);
        assert_eq!(
            seen,
            vec![(1, FLAG_BATCH_BEGIN), (2, 0), (3, FLAG_BATCH_END)]
        );
    }

    #[test]
    fn batch_rejects_oversized_fragment() {
        init();
        let partition = partition(1024);
        let mut batch = batch(&partition, 1, 10);
        let err = batch.next_fragment(500, 0).expect_err("Should not fit");
        assert!(matches!(err, Error::FragmentOverflow { requested: 500, .. }));
        batch.next_fragment(10, 0).expect("Should fit");
        batch.commit();
        match partition.read_from(0) {
            ReadFrame::Frame(frame) => {
                assert_eq!(frame.flags(), FLAG_BATCH_BEGIN | FLAG_BATCH_END)
            }
            other => panic!("Expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn batch_abort_skips_everything() {
        init();
        let partition = partition(1024);
        let mut batch = batch(&partition, 2, 20);
        let reserved = batch.position().partition_offset();
        batch.next_fragment(10, 1).expect("Should fit");
        batch.next_fragment(10, 2).expect("Should fit");
        batch.abort();

        match partition.read_from(0) {
            ReadFrame::Padding { length } => assert_eq!(length, reserved),
            other => panic!("Expected padding, got {:?}", other),
        }
    }

    #[test]
    fn empty_batch_commit_is_padding() {
        init();
        let partition = partition(1024);
        let batch = batch(&partition, 2, 20);
        let reserved = batch.position().partition_offset();
        batch.commit();
        match partition.read_from(0) {
            ReadFrame::Padding { length } => assert_eq!(length, reserved),
            other => panic!("Expected padding, got {:?}", other),
        }
    }

    #[test]
    fn batch_reservation_sizes() {
        // 3 x (16 header + up to 15 alignment) on top of the payload
        assert_eq!(batch_reservation(3, 30), Some(128));
        assert_eq!(batch_reservation(1, 0), Some(32));
        assert_eq!(batch_reservation(usize::MAX, 1), None);
        assert_eq!(batch_reservation(1, usize::MAX - 8), None);
    }
}
