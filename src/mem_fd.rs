use crate::error::Error;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8};

/// A memfd mapped read/write into this process.
///
/// All shared state of the log buffer is reached through here: counters are
/// handed out as atomics living inside the mapping, payload bytes as raw
/// slices whose exclusivity is guaranteed by the tail reservations.
pub struct MemFd {
    file_fd: OwnedFd,
    addr: *mut u8,
    n_bytes: usize,
}

// The mapping is never remapped or resized while the MemFd lives, every
// concurrent access goes through atomics or through ranges owned by a single
// writer.
unsafe impl Send for MemFd {}
unsafe impl Sync for MemFd {}

impl MemFd {
    pub fn new(name: &str, n_bytes: usize) -> Result<MemFd, Error> {
        let c_name = CString::new(name).map_err(|_| Error::InvalidConfig {
            reason: format!("name '{}' contains a nul byte", name.escape_default()),
        })?;
        if n_bytes == 0 {
            return Err(Error::InvalidConfig {
                reason: "cannot map an empty buffer".to_string(),
            });
        }

        unsafe {
            let raw_file_fd = libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC);
            if raw_file_fd < 0 {
                return Err(Error::memory("Failed to construct memfd"));
            }
            let file_fd = OwnedFd::from_raw_fd(raw_file_fd);

            // ftruncate zero fills, which is what makes every frame start EMPTY
            if libc::ftruncate(file_fd.as_raw_fd(), n_bytes as libc::off_t) < 0 {
                return Err(Error::memory("Failed to resize memfd"));
            }

            let hint: *mut libc::c_void = std::ptr::null_mut();
            let addr = libc::mmap(
                hint,
                n_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file_fd.as_raw_fd(),
                0,
            );

            if addr == libc::MAP_FAILED {
                return Err(Error::memory("Failed to map memory"));
            }

            assert!(!addr.is_null());
            return Ok(MemFd {
                addr: addr as *mut u8,
                file_fd: file_fd,
                n_bytes: n_bytes,
            });
        }
    }

    pub fn len(&self) -> usize {
        return self.n_bytes;
    }

    pub fn atomic_u8_at(&self, pos: usize) -> &AtomicU8 {
        assert!(pos < self.n_bytes);
        unsafe {
            return &*(self.addr.add(pos) as *const AtomicU8);
        }
    }

    pub fn atomic_u32_at(&self, start: usize) -> &AtomicU32 {
        assert!(start + 4 <= self.n_bytes);
        assert!(start % 4 == 0, "unaligned u32 at {}", start);
        unsafe {
            return &*(self.addr.add(start) as *const AtomicU32);
        }
    }

    pub fn atomic_u64_at(&self, start: usize) -> &AtomicU64 {
        assert!(start + 8 <= self.n_bytes);
        assert!(start % 8 == 0, "unaligned u64 at {}", start);
        unsafe {
            return &*(self.addr.add(start) as *const AtomicU64);
        }
    }

    /// # Safety
    /// No one may be writing to `[start, start + len)` for the lifetime of the
    /// returned slice.
    pub unsafe fn slice(&self, start: usize, len: usize) -> &[u8] {
        assert!(start + len <= self.n_bytes);
        return std::slice::from_raw_parts(self.addr.add(start), len);
    }

    /// # Safety
    /// The caller must own `[start, start + len)` exclusively for the lifetime
    /// of the returned slice, i.e. it reserved the range through a tail.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn mut_slice(&self, start: usize, len: usize) -> &mut [u8] {
        assert!(start + len <= self.n_bytes);
        return std::slice::from_raw_parts_mut(self.addr.add(start), len);
    }

    /// # Safety
    /// Same contract as [`MemFd::mut_slice`].
    pub unsafe fn zero(&self, start: usize, len: usize) {
        assert!(start + len <= self.n_bytes);
        std::ptr::write_bytes(self.addr.add(start), 0, len);
    }

    pub fn to_owned_fd(&self) -> Result<OwnedFd, Error> {
        return Ok(self.file_fd.try_clone()?);
    }
}

impl Drop for MemFd {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.n_bytes);
        }
    }
}
