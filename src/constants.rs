// The whole log buffer is one shared memory file. Partitions never move and
// never resize, so every offset below is fixed once the buffer is created.

// layout
//  0  -- u64 buffer_uid, random, identifies the mapping in logs
//  8  -- u32 partition count
// 12  -- u32 partition size
// 16  -- u32 active partition id (atomic)
// 20  -- u8[44] padding
// 64  -- end

// For each partition, starting at 64:
// ------ Repeat every 64 bytes ----
// u32  0 -- tail (atomic, may run past the partition size)
// u32  4 -- partition id (atomic)
// u32  8 -- status (atomic)
//     12 -- u8[52] padding, keeps tails of different partitions on their own line

// After 64 x N_PARTITIONS the rest of the memory is the partition data, one
// region of partition size bytes per partition.

pub const BUFFER_HEADER_SIZE: usize = 64;
pub const PARTITION_META_SIZE: usize = 64;

// Absolute positions of buffer header
pub const ABS_POS_BUFFER_UID: usize = 0;
pub const ABS_POS_PARTITION_COUNT: usize = 8;
pub const ABS_POS_PARTITION_SIZE: usize = 12;
pub const ABS_POS_ACTIVE_PARTITION_ID: usize = 16;

// Positions within a partition metadata section
pub const META_POS_TAIL: usize = 0;
pub const META_POS_PARTITION_ID: usize = 4;
pub const META_POS_STATUS: usize = 8;

// Partition status
pub const PARTITION_CLEAN: u32 = 0;
pub const PARTITION_NEEDS_CLEANING: u32 = 1;
pub const PARTITION_CLEANING: u32 = 2;

// Frame header, every frame starts on a FRAME_ALIGNMENT boundary
// u32  0 -- frame length (header + payload, not aligned)
// u32  4 -- stream id
// u8   8 -- state
// u8   9 -- flags
// u16 10 -- reserved
// u32 12 -- crc32 of payload
//     16 -- payload
pub const FRAME_HEADER_SIZE: usize = 16;
pub const FRAME_ALIGNMENT: usize = 16;

pub const FRAME_POS_LENGTH: usize = 0;
pub const FRAME_POS_STREAM_ID: usize = 4;
pub const FRAME_POS_STATE: usize = 8;
pub const FRAME_POS_FLAGS: usize = 9;
pub const FRAME_POS_CRC: usize = 12;

// Frame states, zeroed memory reads as EMPTY
pub const STATE_EMPTY: u8 = 0;
pub const STATE_CLAIMED: u8 = 1;
pub const STATE_COMMITTED: u8 = 2;
pub const STATE_PADDING: u8 = 3;

// Frame flags
pub const FLAG_FAILED: u8 = 0x01;
pub const FLAG_BATCH_BEGIN: u8 = 0x02;
pub const FLAG_BATCH_END: u8 = 0x04;

// The largest payload a single call may write is partition size / 16
pub const MAX_FRAME_LENGTH_DIVISOR: u32 = 16;

pub const MIN_PARTITION_COUNT: u32 = 3;
pub const DEFAULT_PARTITION_COUNT: u32 = 3;
pub const DEFAULT_PARTITION_SIZE: u32 = 256 * 1024;
// positions keep the offset in 32 bits, keep well clear of overflow when many
// producers push the tail past the end at once
pub const MAX_PARTITION_SIZE: u32 = 1 << 30;
