use crate::claimed_fragment::{batch_reservation, ClaimedFragment, ClaimedFragmentBatch};
use crate::constants::{FRAME_ALIGNMENT, FRAME_HEADER_SIZE};
use crate::error::Error;
use crate::partition::{LogBufferPartition, Reservation};
use crate::utils::align;

/// What an append produced when it did not fail outright.
#[derive(Debug)]
pub enum Appended<T> {
    Ok(T),
    /// The partition is full, the caller has to rotate the buffer.
    EndOfPartition,
}

/// Writes frames into a partition. Holds nothing but the per-call limit, so
/// one instance serves every producer thread.
#[derive(Debug, Clone, Copy)]
pub struct LogAppender {
    max_frame_length: usize,
}

impl LogAppender {
    pub fn new(max_frame_length: usize) -> LogAppender {
        return LogAppender { max_frame_length };
    }

    pub fn max_frame_length(&self) -> usize {
        return self.max_frame_length;
    }

    /// The most a single call may take off the tail: one frame carrying
    /// `max_frame_length` payload bytes. Batches are held to the same bound,
    /// fragment headers included.
    pub fn max_reservation(&self) -> usize {
        return align(FRAME_HEADER_SIZE + self.max_frame_length, FRAME_ALIGNMENT);
    }

    fn check_length(&self, length: usize) -> Result<(), Error> {
        if length > self.max_frame_length {
            return Err(Error::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }
        return Ok(());
    }

    /// Claims, copies and commits in one go. Returns the partition offset just
    /// past the new frame.
    pub fn append_frame(
        &self,
        partition: &LogBufferPartition,
        payload: &[u8],
        stream_id: u32,
    ) -> Result<Appended<u32>, Error> {
        self.check_length(payload.len())?;

        match partition.claim(payload.len(), stream_id) {
            Reservation::Reserved(offset) => {
                // we own the range until the commit below
                unsafe { partition.payload_mut(offset, payload.len()) }.copy_from_slice(payload);
                partition.commit(offset);
                let aligned = align(FRAME_HEADER_SIZE + payload.len(), FRAME_ALIGNMENT) as u32;
                return Ok(Appended::Ok(offset + aligned));
            }
            Reservation::EndOfPartition => return Ok(Appended::EndOfPartition),
        }
    }

    /// Claims a frame without writing it, the caller fills and completes it.
    pub fn claim<'a>(
        &self,
        partition: &'a LogBufferPartition,
        partition_id: u32,
        length: usize,
        stream_id: u32,
    ) -> Result<Appended<ClaimedFragment<'a>>, Error> {
        self.check_length(length)?;

        match partition.claim(length, stream_id) {
            Reservation::Reserved(offset) => {
                return Ok(Appended::Ok(ClaimedFragment::new(
                    partition,
                    partition_id,
                    offset,
                    length,
                )));
            }
            Reservation::EndOfPartition => return Ok(Appended::EndOfPartition),
        }
    }

    /// One reservation big enough for `fragment_count` fragments carrying
    /// `batch_length` payload bytes in total.
    pub fn claim_batch<'a>(
        &self,
        partition: &'a LogBufferPartition,
        partition_id: u32,
        fragment_count: usize,
        batch_length: usize,
    ) -> Result<Appended<ClaimedFragmentBatch<'a>>, Error> {
        if fragment_count == 0 {
            return Err(Error::EmptyBatch);
        }
        self.check_length(batch_length)?;
        let reserved = match batch_reservation(fragment_count, batch_length) {
            Some(reserved) if reserved <= self.max_reservation() => reserved as u32,
            too_large => {
                return Err(Error::FrameTooLarge {
                    length: too_large.unwrap_or(usize::MAX),
                    max: self.max_reservation(),
                })
            }
        };

        match partition.reserve(reserved) {
            Reservation::Reserved(offset) => {
                return Ok(Appended::Ok(ClaimedFragmentBatch::new(
                    partition,
                    partition_id,
                    offset,
                    reserved,
                    fragment_count,
                )));
            }
            Reservation::EndOfPartition => return Ok(Appended::EndOfPartition),
        }
    }
}
