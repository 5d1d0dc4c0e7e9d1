use std::fmt;

/// A monotonic 64 bit address into the log: the partition id in the high 32
/// bits, the byte offset inside that partition in the low 32 bits.
///
/// The partition id keeps growing as the buffer rotates, the buffer maps it to
/// a partition index with `id % partition_count`. Positions compare in log
/// order; any arithmetic goes through the two halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub const fn new(partition_id: u32, partition_offset: u32) -> Position {
        return Position(((partition_id as u64) << 32) | partition_offset as u64);
    }

    pub const fn from_raw(raw: u64) -> Position {
        return Position(raw);
    }

    pub const fn as_raw(self) -> u64 {
        return self.0;
    }

    pub const fn partition_id(self) -> u32 {
        return (self.0 >> 32) as u32;
    }

    pub const fn partition_offset(self) -> u32 {
        return self.0 as u32;
    }

    /// The position `window` bytes ahead of this one. A window that would
    /// reach the end of the partition lands `window` bytes into the next one
    /// instead.
    pub(crate) fn advance_window(self, window: u32, partition_size: u32) -> Position {
        let offset = self.partition_offset() as u64 + window as u64;
        if offset >= partition_size as u64 {
            return Position::new(self.partition_id() + 1, window);
        }
        return Position::new(self.partition_id(), offset as u32);
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition_id(), self.partition_offset())
    }
}
