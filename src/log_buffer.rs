use crate::constants::{
    ABS_POS_ACTIVE_PARTITION_ID, ABS_POS_BUFFER_UID, ABS_POS_PARTITION_COUNT,
    ABS_POS_PARTITION_SIZE, BUFFER_HEADER_SIZE, PARTITION_META_SIZE,
};
use crate::error::Error;
use crate::mem_fd::MemFd;
use crate::partition::LogBufferPartition;
use log::{debug, info};
use rand::Rng;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A ring of equally sized partitions in one shared memory mapping, with
/// exactly one partition active for writes at a time.
pub struct LogBuffer {
    buffer_uid: u64,
    mem: Arc<MemFd>,
    partitions: Vec<LogBufferPartition>,
    partition_size: u32,
    released: AtomicBool,
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("buffer_uid", &self.buffer_uid)
            .field("partition_count", &self.partitions.len())
            .field("partition_size", &self.partition_size)
            .field("active_partition_id", &self.active_partition_id())
            .finish()
    }
}

impl LogBuffer {
    pub fn new(name: &str, partition_count: u32, partition_size: u32) -> Result<LogBuffer, Error> {
        let data_start = BUFFER_HEADER_SIZE + PARTITION_META_SIZE * partition_count as usize;
        let n_bytes = data_start + partition_size as usize * partition_count as usize;
        let mem = Arc::new(MemFd::new(name, n_bytes)?);

        let mut rng = rand::thread_rng();
        let buffer_uid: u64 = rng.gen();

        // write out header
        mem.atomic_u64_at(ABS_POS_BUFFER_UID)
            .store(buffer_uid, Ordering::Relaxed);
        mem.atomic_u32_at(ABS_POS_PARTITION_COUNT)
            .store(partition_count, Ordering::Relaxed);
        mem.atomic_u32_at(ABS_POS_PARTITION_SIZE)
            .store(partition_size, Ordering::Relaxed);
        mem.atomic_u32_at(ABS_POS_ACTIVE_PARTITION_ID)
            .store(0, Ordering::Release);

        let mut partitions = Vec::with_capacity(partition_count as usize);
        for i in 0..partition_count {
            let meta_position = BUFFER_HEADER_SIZE + PARTITION_META_SIZE * i as usize;
            let data_position = data_start + partition_size as usize * i as usize;
            let partition =
                LogBufferPartition::new(mem.clone(), i, meta_position, data_position, partition_size);
            // partition i serves id i on the first lap, tail and status start zeroed
            partition.init_partition_id(i);
            partitions.push(partition);
        }

        info!(
            "Created log buffer {} ({:#018x}): {} partitions of {} bytes",
            name, buffer_uid, partition_count, partition_size
        );

        return Ok(LogBuffer {
            buffer_uid,
            mem,
            partitions,
            partition_size,
            released: AtomicBool::new(false),
        });
    }

    fn active_counter(&self) -> &AtomicU32 {
        return self.mem.atomic_u32_at(ABS_POS_ACTIVE_PARTITION_ID);
    }

    pub fn buffer_uid(&self) -> u64 {
        return self.buffer_uid;
    }

    pub fn partition_count(&self) -> u32 {
        return self.partitions.len() as u32;
    }

    pub fn partition_size(&self) -> u32 {
        return self.partition_size;
    }

    pub fn active_partition_id(&self) -> u32 {
        return self.active_counter().load(Ordering::Acquire);
    }

    /// The partition serving `partition_id`, i.e. index `id % count`.
    pub fn partition(&self, partition_id: u32) -> &LogBufferPartition {
        return &self.partitions[(partition_id % self.partition_count()) as usize];
    }

    pub fn active_partition(&self) -> (u32, &LogBufferPartition) {
        let partition_id = self.active_partition_id();
        return (partition_id, self.partition(partition_id));
    }

    /// Called by whoever got `EndOfPartition` out of partition `filled_id`.
    /// Only the first caller moves the active id on; the rest (and callers
    /// holding an outdated id) return false. The rotation is held back while
    /// the next partition still carries data from its previous lap.
    pub fn on_partition_filled(&self, filled_id: u32) -> bool {
        let next_id = filled_id.wrapping_add(1);
        let next = self.partition(next_id);

        if next.partition_id() != next_id || !next.is_clean() {
            // the conductor normally cleans well ahead, help out if it has not
            next.try_clean(self.partition_count());
            if next.partition_id() != next_id || !next.is_clean() {
                debug!(
                    "Partition {} is not ready for id {}, holding rotation",
                    next.index(),
                    next_id
                );
                return false;
            }
        }

        if self
            .active_counter()
            .compare_exchange(filled_id, next_id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // the partition after the new active one is the oldest in the ring,
        // every subscription has left it by now
        let following_id = next_id.wrapping_add(1);
        let following = self.partition(following_id);
        if following.partition_id() != following_id {
            following.mark_needs_cleaning();
        }
        debug!("Rotated active partition {} -> {}", filled_id, next_id);
        return true;
    }

    /// Cleans every partition marked for cleaning. Returns how many were
    /// cleaned.
    pub fn clean_partitions(&self) -> usize {
        let mut work_count = 0;
        for partition in &self.partitions {
            if partition.try_clean(self.partition_count()) {
                work_count += 1;
            }
        }
        return work_count;
    }

    pub fn is_released(&self) -> bool {
        return self.released.load(Ordering::Acquire);
    }

    /// Stops readers from seeing anything further. The mapping itself goes
    /// away when the last owner drops the buffer.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            info!("Released log buffer {:#018x}", self.buffer_uid);
        }
    }

    /// A handle on the underlying memfd, e.g. to map it from another process.
    pub fn to_owned_fd(&self) -> Result<OwnedFd, Error> {
        return self.mem.to_owned_fd();
    }
}
