use crc::{Crc, CRC_32_CKSUM};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

pub fn compute_crc32(data: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(data);
    return digest.finalize();
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
pub fn align(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    return (value + alignment - 1) & !(alignment - 1);
}
