/*
 * One consumer's view of the log: a position and the loops that walk
 * committed frames from it. The position is the only shared part, the
 * dispatcher reads it to compute the publisher limit and, in pipeline mode,
 * the next stage reads it as its own limit.
*/
use crate::constants::{FLAG_BATCH_BEGIN, FLAG_BATCH_END, FLAG_FAILED, FRAME_ALIGNMENT};
use crate::dispatcher::DispatcherInner;
use crate::log_buffer::LogBuffer;
use crate::partition::{FrameView, LogBufferPartition, ReadFrame};
use crate::position::Position;
use crate::utils::align;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// What a [`FragmentHandler`] did with a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentResult {
    Consume,
    /// Leave the fragment (and everything after it) for the next poll.
    Postpone,
    /// Consume it, but flag it as failed for whoever reads it later.
    Failed,
}

/// A committed fragment handed to a consumer.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    offset: u32,
    payload: &'a [u8],
    stream_id: u32,
    position: Position,
    flags: u8,
}

impl<'a> Fragment<'a> {
    fn from_frame(frame: &FrameView<'a>, partition_id: u32) -> Fragment<'a> {
        return Fragment {
            offset: frame.offset(),
            payload: frame.payload(),
            stream_id: frame.stream_id(),
            position: Position::new(partition_id, frame.next_offset()),
            flags: frame.flags(),
        };
    }

    pub fn payload(&self) -> &'a [u8] {
        return self.payload;
    }

    pub fn stream_id(&self) -> u32 {
        return self.stream_id;
    }

    /// The position just past this fragment.
    pub fn position(&self) -> Position {
        return self.position;
    }

    pub fn is_failed(&self) -> bool {
        return self.flags & FLAG_FAILED != 0;
    }

    pub fn is_batch_begin(&self) -> bool {
        return self.flags & FLAG_BATCH_BEGIN != 0;
    }

    pub fn is_batch_end(&self) -> bool {
        return self.flags & FLAG_BATCH_END != 0;
    }
}

pub trait FragmentHandler {
    fn on_fragment(&mut self, fragment: &Fragment<'_>) -> FragmentResult;
}

impl<F> FragmentHandler for F
where
    F: FnMut(&Fragment<'_>) -> FragmentResult,
{
    fn on_fragment(&mut self, fragment: &Fragment<'_>) -> FragmentResult {
        return self(fragment);
    }
}

/// The part of a subscription the dispatcher keeps in its subscription list.
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    id: u32,
    name: String,
    position: AtomicU64,
    closed: AtomicBool,
    // a live Subscription handle exists
    taken: AtomicBool,
}

impl SubscriptionState {
    pub(crate) fn new(id: u32, name: &str, position: Position) -> SubscriptionState {
        return SubscriptionState {
            id,
            name: name.to_string(),
            position: AtomicU64::new(position.as_raw()),
            closed: AtomicBool::new(false),
            taken: AtomicBool::new(false),
        };
    }

    /// Claims the single consumer handle. False if someone already holds it.
    pub(crate) fn try_take(&self) -> bool {
        return !self.taken.swap(true, Ordering::AcqRel);
    }

    fn release(&self) {
        self.taken.store(false, Ordering::Release);
    }

    pub(crate) fn id(&self) -> u32 {
        return self.id;
    }

    pub(crate) fn name(&self) -> &str {
        return &self.name;
    }

    pub(crate) fn position(&self) -> Position {
        return Position::from_raw(self.position.load(Ordering::Acquire));
    }

    fn set_position(&self, position: Position) {
        self.position.store(position.as_raw(), Ordering::Release);
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        return self.closed.load(Ordering::Acquire);
    }
}

enum Cursor<'a> {
    Frame(&'a LogBufferPartition, FrameView<'a>),
    /// Padding or the end of a partition, continue here.
    Skip(Position),
    /// Nothing readable at this position (yet).
    Stop,
}

fn read_at(log_buffer: &LogBuffer, position: Position) -> Cursor<'_> {
    let partition_id = position.partition_id();
    let offset = position.partition_offset();
    let partition = log_buffer.partition(partition_id);
    if partition.partition_id() != partition_id {
        // not rotated in yet
        return Cursor::Stop;
    }

    match partition.read_from(offset) {
        ReadFrame::Frame(frame) => return Cursor::Frame(partition, frame),
        ReadFrame::Padding { length } => {
            let next = offset + align(length as usize, FRAME_ALIGNMENT) as u32;
            return Cursor::Skip(Position::new(partition_id, next));
        }
        ReadFrame::EndOfPartition => return Cursor::Skip(Position::new(partition_id + 1, 0)),
        ReadFrame::Blocked => return Cursor::Stop,
    }
}

/// A consumer's read cursor. Owned by exactly one thread, hence the `&mut`
/// on every read; the dispatcher never hands out a second live handle.
pub struct Subscription {
    state: Arc<SubscriptionState>,
    dispatcher: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id())
            .field("name", &self.state.name())
            .field("position", &self.state.position())
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        state: Arc<SubscriptionState>,
        dispatcher: Arc<DispatcherInner>,
    ) -> Subscription {
        return Subscription { state, dispatcher };
    }

    pub(crate) fn state(&self) -> &Arc<SubscriptionState> {
        return &self.state;
    }

    pub fn id(&self) -> u32 {
        return self.state.id();
    }

    pub fn name(&self) -> &str {
        return self.state.name();
    }

    pub fn position(&self) -> Position {
        return self.state.position();
    }

    /// Moves the cursor before anything was read, e.g. to resume where a
    /// previous consumer stopped.
    pub fn set_position_on_open(&mut self, position: Position) {
        self.state.set_position(position);
    }

    pub fn is_closed(&self) -> bool {
        return self.state.is_closed();
    }

    /// Hands up to `max_fragments` committed fragments to `handler`, moving
    /// the position past every fragment it consumes. Returns how many were
    /// consumed; 0 means nothing is available right now.
    pub fn poll<H>(&mut self, handler: &mut H, max_fragments: usize) -> usize
    where
        H: FragmentHandler + ?Sized,
    {
        if self.state.is_closed() {
            return 0;
        }
        let dispatcher: &DispatcherInner = &self.dispatcher;
        let log_buffer = dispatcher.log_buffer();
        if log_buffer.is_released() {
            return 0;
        }
        let limit = match dispatcher.subscriber_limit_for(&self.state) {
            Some(limit) => limit,
            None => return 0,
        };

        let start = self.state.position();
        let mut position = start;
        let mut fragments_read = 0;
        while fragments_read < max_fragments && position < limit {
            match read_at(log_buffer, position) {
                Cursor::Stop => break,
                Cursor::Skip(next) => position = next,
                Cursor::Frame(partition, frame) => {
                    let fragment = Fragment::from_frame(&frame, position.partition_id());
                    if dispatcher.verify_checksums() && !frame.crc_matches() {
                        error!(
                            "Checksum mismatch for fragment ending at {} in {}, skipping it",
                            fragment.position(),
                            self.state.name()
                        );
                        position = fragment.position();
                        continue;
                    }

                    match handler.on_fragment(&fragment) {
                        FragmentResult::Consume => {}
                        FragmentResult::Failed => partition.mark_failed(frame.offset()),
                        FragmentResult::Postpone => break,
                    }
                    position = fragment.position();
                    fragments_read += 1;
                    // the next pipeline stage may start on it right away
                    self.state.set_position(position);
                }
            }
        }

        if position != start {
            self.state.set_position(position);
            dispatcher.update_publisher_limit();
        }
        return fragments_read;
    }

    /// Looks at a contiguous block of committed fragments without consuming
    /// it. The block never splits a batch, never crosses padding or a
    /// partition boundary and, when `stream_aware`, holds a single stream.
    /// It stays within `max_block_size` bytes unless its first fragment or
    /// batch alone is larger, in which case that one is returned by itself.
    pub fn peek_block(&mut self, max_block_size: usize, stream_aware: bool) -> Option<BlockPeek<'_>> {
        if self.state.is_closed() {
            return None;
        }
        let dispatcher: &DispatcherInner = &self.dispatcher;
        let state: &SubscriptionState = &self.state;
        let log_buffer = dispatcher.log_buffer();
        if log_buffer.is_released() {
            return None;
        }
        let limit = dispatcher.subscriber_limit_for(state)?;

        // step over padding and partition ends first
        let start = state.position();
        let mut position = start;
        let partition = loop {
            if position >= limit {
                break None;
            }
            match read_at(log_buffer, position) {
                Cursor::Frame(partition, _) => break Some(partition),
                Cursor::Skip(next) => position = next,
                Cursor::Stop => break None,
            }
        };
        if position != start {
            state.set_position(position);
        }
        let partition = partition?;

        let partition_id = position.partition_id();
        let block_start = position.partition_offset();
        let mut offset = block_start;
        let mut fragments: Vec<Fragment<'_>> = vec![];
        let mut in_batch = false;
        // fragments that form whole units (plain fragments or complete batches)
        let mut complete = 0;
        let mut complete_end = block_start;
        let mut first_stream: Option<u32> = None;

        while Position::new(partition_id, offset) < limit {
            let frame = match partition.read_from(offset) {
                ReadFrame::Frame(frame) => frame,
                _ => break,
            };
            if !in_batch && complete > 0 && stream_aware && first_stream != Some(frame.stream_id()) {
                break;
            }
            if dispatcher.verify_checksums() && !frame.crc_matches() {
                error!(
                    "Checksum mismatch at {} in {}, block ends before it",
                    Position::new(partition_id, offset),
                    state.name()
                );
                break;
            }

            let fragment = Fragment::from_frame(&frame, partition_id);
            if fragment.is_batch_begin() && !fragment.is_batch_end() {
                in_batch = true;
            } else if fragment.is_batch_end() {
                in_batch = false;
            }
            if first_stream.is_none() {
                first_stream = Some(fragment.stream_id());
            }
            fragments.push(fragment);
            offset = frame.next_offset();

            if !in_batch {
                let block_length = (offset - block_start) as usize;
                if complete > 0 && block_length > max_block_size {
                    // this unit goes to the next block
                    break;
                }
                complete = fragments.len();
                complete_end = offset;
                if block_length >= max_block_size {
                    break;
                }
            }
        }

        if complete == 0 {
            return None;
        }
        fragments.truncate(complete);
        debug!(
            "{} peeked {} fragments ({} bytes) at {}",
            state.name(),
            fragments.len(),
            complete_end - block_start,
            position
        );
        return Some(BlockPeek {
            state,
            dispatcher,
            partition,
            block_start,
            block_length: (complete_end - block_start) as usize,
            new_position: Position::new(partition_id, complete_end),
            fragments,
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.release();
    }
}

/// A block of fragments returned by [`Subscription::peek_block`]. Nothing is
/// consumed until [`BlockPeek::commit`].
pub struct BlockPeek<'a> {
    state: &'a SubscriptionState,
    dispatcher: &'a DispatcherInner,
    partition: &'a LogBufferPartition,
    block_start: u32,
    block_length: usize,
    new_position: Position,
    fragments: Vec<Fragment<'a>>,
}

impl std::fmt::Debug for BlockPeek<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPeek")
            .field("fragments", &self.fragments.len())
            .field("block_length", &self.block_length)
            .field("new_position", &self.new_position)
            .finish()
    }
}

impl<'a> BlockPeek<'a> {
    pub fn fragments(&self) -> &[Fragment<'a>] {
        return &self.fragments;
    }

    pub fn len(&self) -> usize {
        return self.fragments.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.fragments.is_empty();
    }

    /// Bytes of the block on the buffer, frame headers included.
    pub fn block_length(&self) -> usize {
        return self.block_length;
    }

    /// The raw block as laid out on the buffer, frame headers included.
    pub fn buffer(&self) -> &'a [u8] {
        // every frame in the block is committed
        unsafe {
            return self.partition.bytes(self.block_start, self.block_length);
        }
    }

    /// Where the subscription continues after [`BlockPeek::commit`].
    pub fn new_position(&self) -> Position {
        return self.new_position;
    }

    pub fn mark_failed(&self) {
        for fragment in &self.fragments {
            self.partition.mark_failed(fragment.offset);
        }
    }

    pub fn commit(self) {
        self.state.set_position(self.new_position);
        self.dispatcher.update_publisher_limit();
    }
}
