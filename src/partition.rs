/*
 * One fixed size region of the log buffer plus its tail counter.
 * Writers never coordinate with each other beyond the fetch-and-add on the
 * tail: whatever range the add hands out belongs to that writer alone until it
 * flips the frame state. Readers only trust a frame once they acquire-load a
 * COMMITTED state, which pairs with the writer's release-store.
*/
use crate::constants::{
    FLAG_FAILED, FRAME_ALIGNMENT, FRAME_HEADER_SIZE, FRAME_POS_CRC, FRAME_POS_FLAGS,
    FRAME_POS_LENGTH, FRAME_POS_STATE, FRAME_POS_STREAM_ID, META_POS_PARTITION_ID,
    META_POS_STATUS, META_POS_TAIL, PARTITION_CLEAN, PARTITION_CLEANING,
    PARTITION_NEEDS_CLEANING, STATE_CLAIMED, STATE_COMMITTED, STATE_EMPTY, STATE_PADDING,
};
use crate::mem_fd::MemFd;
use crate::utils::{align, compute_crc32};
use log::debug;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Outcome of reserving space at the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The range starting at this offset belongs to the caller.
    Reserved(u32),
    /// The reservation did not fit. The rest of the partition was padded (by
    /// whoever crossed the end first) and the buffer has to rotate.
    EndOfPartition,
}

/// What a reader finds at an offset.
#[derive(Debug)]
pub enum ReadFrame<'a> {
    Frame(FrameView<'a>),
    /// Aborted frame or end-of-partition filler, `length` bytes to skip.
    Padding { length: u32 },
    /// Nothing written yet, or claimed but not yet committed.
    Blocked,
    EndOfPartition,
}

/// A committed frame as seen by a reader.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    offset: u32,
    length: u32,
    stream_id: u32,
    flags: u8,
    crc: u32,
    payload: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn offset(&self) -> u32 {
        return self.offset;
    }

    /// Offset of the frame after this one.
    pub fn next_offset(&self) -> u32 {
        return self.offset + align(self.length as usize, FRAME_ALIGNMENT) as u32;
    }

    pub fn stream_id(&self) -> u32 {
        return self.stream_id;
    }

    pub fn flags(&self) -> u8 {
        return self.flags;
    }

    pub fn payload(&self) -> &'a [u8] {
        return self.payload;
    }

    pub fn crc_matches(&self) -> bool {
        return compute_crc32(self.payload) == self.crc;
    }
}

pub struct LogBufferPartition {
    mem: Arc<MemFd>,
    index: u32,
    // where our metadata (tail, id, status) is located
    meta_position: usize,
    // where our frames start
    data_position: usize,
    partition_size: u32,
}

impl std::fmt::Debug for LogBufferPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBufferPartition")
            .field("index", &self.index)
            .field("partition_id", &self.partition_id())
            .field("tail", &self.tail_volatile())
            .field("status", &self.status())
            .finish()
    }
}

impl LogBufferPartition {
    pub(crate) fn new(
        mem: Arc<MemFd>,
        index: u32,
        meta_position: usize,
        data_position: usize,
        partition_size: u32,
    ) -> LogBufferPartition {
        assert!(data_position % FRAME_ALIGNMENT == 0);
        assert!(data_position + partition_size as usize <= mem.len());
        return LogBufferPartition {
            mem,
            index,
            meta_position,
            data_position,
            partition_size,
        };
    }

    fn tail(&self) -> &AtomicU32 {
        return self.mem.atomic_u32_at(self.meta_position + META_POS_TAIL);
    }

    fn id_counter(&self) -> &AtomicU32 {
        return self
            .mem
            .atomic_u32_at(self.meta_position + META_POS_PARTITION_ID);
    }

    fn status_counter(&self) -> &AtomicU32 {
        return self.mem.atomic_u32_at(self.meta_position + META_POS_STATUS);
    }

    fn length_at(&self, offset: u32) -> &AtomicU32 {
        return self
            .mem
            .atomic_u32_at(self.data_position + offset as usize + FRAME_POS_LENGTH);
    }

    fn stream_id_at(&self, offset: u32) -> &AtomicU32 {
        return self
            .mem
            .atomic_u32_at(self.data_position + offset as usize + FRAME_POS_STREAM_ID);
    }

    fn crc_at(&self, offset: u32) -> &AtomicU32 {
        return self
            .mem
            .atomic_u32_at(self.data_position + offset as usize + FRAME_POS_CRC);
    }

    fn state_at(&self, offset: u32) -> &AtomicU8 {
        return self
            .mem
            .atomic_u8_at(self.data_position + offset as usize + FRAME_POS_STATE);
    }

    fn flags_at(&self, offset: u32) -> &AtomicU8 {
        return self
            .mem
            .atomic_u8_at(self.data_position + offset as usize + FRAME_POS_FLAGS);
    }

    pub fn index(&self) -> u32 {
        return self.index;
    }

    pub fn partition_size(&self) -> u32 {
        return self.partition_size;
    }

    pub fn partition_id(&self) -> u32 {
        return self.id_counter().load(Ordering::Acquire);
    }

    pub(crate) fn init_partition_id(&self, partition_id: u32) {
        self.id_counter().store(partition_id, Ordering::Release);
    }

    /// May be larger than the partition size once the partition filled up,
    /// by at most one reservation per concurrent producer.
    pub fn tail_volatile(&self) -> u32 {
        return self.tail().load(Ordering::Acquire);
    }

    pub fn status(&self) -> u32 {
        return self.status_counter().load(Ordering::Acquire);
    }

    pub fn is_clean(&self) -> bool {
        return self.status() == PARTITION_CLEAN;
    }

    /// Atomically reserves `aligned_length` bytes. The writer whose reservation
    /// crosses the end pads the remainder so readers can skip to the next
    /// partition; everyone past the end just gets `EndOfPartition`.
    pub fn reserve(&self, aligned_length: u32) -> Reservation {
        debug_assert!(aligned_length as usize % FRAME_ALIGNMENT == 0);
        let size = self.partition_size;
        // once full, stop adding: while a rotation is held back producers keep
        // retrying and the tail must not wrap around
        if self.tail().load(Ordering::Acquire) >= size {
            return Reservation::EndOfPartition;
        }
        let previous = self.tail().fetch_add(aligned_length, Ordering::AcqRel);
        let new_tail = previous as u64 + aligned_length as u64;

        if new_tail > size as u64 {
            if previous < size {
                self.write_padding(previous, size - previous);
            }
            return Reservation::EndOfPartition;
        }
        return Reservation::Reserved(previous);
    }

    /// Reserves room for a frame of `length` payload bytes and writes its
    /// header in the CLAIMED state.
    pub fn claim(&self, length: usize, stream_id: u32) -> Reservation {
        let frame_length = FRAME_HEADER_SIZE + length;
        let aligned = align(frame_length, FRAME_ALIGNMENT) as u32;
        let reservation = self.reserve(aligned);
        if let Reservation::Reserved(offset) = reservation {
            self.write_header(offset, frame_length as u32, stream_id, 0);
        }
        return reservation;
    }

    pub(crate) fn write_header(&self, offset: u32, frame_length: u32, stream_id: u32, flags: u8) {
        self.length_at(offset).store(frame_length, Ordering::Relaxed);
        self.stream_id_at(offset).store(stream_id, Ordering::Relaxed);
        self.flags_at(offset).store(flags, Ordering::Relaxed);
        self.crc_at(offset).store(0, Ordering::Relaxed);
        self.state_at(offset).store(STATE_CLAIMED, Ordering::Release);
    }

    pub(crate) fn write_padding(&self, offset: u32, length: u32) {
        debug_assert!(length as usize >= FRAME_HEADER_SIZE);
        self.length_at(offset).store(length, Ordering::Relaxed);
        self.stream_id_at(offset).store(0, Ordering::Relaxed);
        self.flags_at(offset).store(0, Ordering::Relaxed);
        self.crc_at(offset).store(0, Ordering::Relaxed);
        self.state_at(offset).store(STATE_PADDING, Ordering::Release);
    }

    pub(crate) fn frame_length(&self, offset: u32) -> u32 {
        return self.length_at(offset).load(Ordering::Relaxed);
    }

    pub(crate) fn add_flags(&self, offset: u32, flags: u8) {
        self.flags_at(offset).fetch_or(flags, Ordering::AcqRel);
    }

    pub(crate) fn mark_failed(&self, offset: u32) {
        self.add_flags(offset, FLAG_FAILED);
    }

    /// Payload bytes of a claimed frame.
    ///
    /// # Safety
    /// `offset` must be a frame the caller claimed and has not yet committed
    /// or aborted, and the caller must not hand out two slices of it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self, offset: u32, length: usize) -> &mut [u8] {
        let start = self.data_position + offset as usize + FRAME_HEADER_SIZE;
        return self.mem.mut_slice(start, length);
    }

    /// Raw bytes of the partition, headers included.
    ///
    /// # Safety
    /// Every frame in the range must be committed or padding.
    pub(crate) unsafe fn bytes(&self, offset: u32, length: usize) -> &[u8] {
        return self
            .mem
            .slice(self.data_position + offset as usize, length);
    }

    /// Makes a claimed frame visible to readers.
    pub fn commit(&self, offset: u32) {
        debug_assert_eq!(self.state_at(offset).load(Ordering::Acquire), STATE_CLAIMED);
        let length = self.length_at(offset).load(Ordering::Relaxed) as usize;
        let payload = unsafe {
            self.mem.slice(
                self.data_position + offset as usize + FRAME_HEADER_SIZE,
                length - FRAME_HEADER_SIZE,
            )
        };
        self.crc_at(offset)
            .store(compute_crc32(payload), Ordering::Relaxed);

        // everything above must be visible to whoever sees COMMITTED
        self.state_at(offset)
            .store(STATE_COMMITTED, Ordering::Release);
    }

    /// Turns a claimed frame into padding every reader skips.
    pub fn abort(&self, offset: u32) {
        debug_assert_eq!(self.state_at(offset).load(Ordering::Acquire), STATE_CLAIMED);
        self.state_at(offset).store(STATE_PADDING, Ordering::Release);
    }

    pub(crate) fn abort_range(&self, offset: u32, length: u32) {
        self.length_at(offset).store(length, Ordering::Relaxed);
        self.state_at(offset).store(STATE_PADDING, Ordering::Release);
    }

    pub fn read_from(&self, offset: u32) -> ReadFrame<'_> {
        if offset as usize + FRAME_HEADER_SIZE > self.partition_size as usize {
            return ReadFrame::EndOfPartition;
        }

        match self.state_at(offset).load(Ordering::Acquire) {
            STATE_COMMITTED => {
                let length = self.length_at(offset).load(Ordering::Relaxed);
                if (length as usize) < FRAME_HEADER_SIZE
                    || offset as u64 + length as u64 > self.partition_size as u64
                {
                    // cannot happen while the publisher limit holds, treat it
                    // as not yet readable rather than run off the partition
                    return ReadFrame::Blocked;
                }
                let payload = unsafe {
                    self.mem.slice(
                        self.data_position + offset as usize + FRAME_HEADER_SIZE,
                        length as usize - FRAME_HEADER_SIZE,
                    )
                };
                return ReadFrame::Frame(FrameView {
                    offset,
                    length,
                    stream_id: self.stream_id_at(offset).load(Ordering::Relaxed),
                    flags: self.flags_at(offset).load(Ordering::Acquire),
                    crc: self.crc_at(offset).load(Ordering::Relaxed),
                    payload,
                });
            }
            STATE_PADDING => {
                let length = self.length_at(offset).load(Ordering::Relaxed);
                if (length as usize) < FRAME_HEADER_SIZE {
                    return ReadFrame::Blocked;
                }
                return ReadFrame::Padding { length };
            }
            STATE_EMPTY | STATE_CLAIMED => return ReadFrame::Blocked,
            state => {
                debug!("Unknown frame state {} at {}", state, offset);
                return ReadFrame::Blocked;
            }
        }
    }

    pub(crate) fn mark_needs_cleaning(&self) {
        let _ = self.status_counter().compare_exchange(
            PARTITION_CLEAN,
            PARTITION_NEEDS_CLEANING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Zeroes the partition and hands it the id it will carry on its next turn
    /// in the ring. Returns false when the partition did not need cleaning or
    /// someone else is already on it.
    pub(crate) fn try_clean(&self, partition_count: u32) -> bool {
        if self
            .status_counter()
            .compare_exchange(
                PARTITION_NEEDS_CLEANING,
                PARTITION_CLEANING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        // every subscription is past this partition, nobody reads these bytes
        unsafe {
            self.mem
                .zero(self.data_position, self.partition_size as usize);
        }
        self.tail().store(0, Ordering::Release);
        let previous_id = self.id_counter().fetch_add(partition_count, Ordering::AcqRel);
        self.status_counter()
            .store(PARTITION_CLEAN, Ordering::Release);

        debug!(
            "Cleaned partition {} for reuse, id {} -> {}",
            self.index,
            previous_id,
            previous_id + partition_count
        );
        return true;
    }
}
