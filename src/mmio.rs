//! Owned virtual-memory mappings of device register regions.

use std::io::Error;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::{BusError, BusResult};

/// System page size.
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned shared read-write mapping of one device memory region.
///
/// The region is unmapped when the handle drops. Register access is
/// volatile and bounds-asserted against the mapped length.
#[derive(Debug)]
pub struct MmioRegion {
    base: *mut u8,
    len: usize,
}

// The handle is the sole owner of its address range; volatile register
// access holds no shared state.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Starting virtual address of the mapping.
    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        if ret != 0 {
            error!(
                "cannot munmap({:p}, {:#x}): {}",
                self.base,
                self.len,
                Error::last_os_error()
            );
        } else {
            debug!("platform memory unmapped at {:p}", self.base);
        }
    }
}

/// Map `size` bytes of `fd` shared read-write near `requested_addr`.
///
/// The requested address is a hint only; the returned region records
/// where the kernel actually placed the mapping.
pub(crate) fn map_shared(
    requested_addr: usize,
    fd: RawFd,
    offset: i64,
    size: usize,
) -> BusResult<MmioRegion> {
    let mapaddr = unsafe {
        libc::mmap(
            requested_addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if mapaddr == libc::MAP_FAILED {
        error!(
            "cannot map resource({}, {:#x}, {:#x}): {}",
            fd,
            requested_addr,
            size,
            Error::last_os_error()
        );
        return Err(BusError::ResourceMapFailed);
    }
    debug!("platform memory mapped at {:p}", mapaddr);
    Ok(MmioRegion {
        base: mapaddr as *mut u8,
        len: size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn maps_and_accesses_registers() {
        let file = tempfile::tempfile().unwrap();
        let len = page_size();
        file.set_len(len as u64).unwrap();

        let region = map_shared(0, file.as_raw_fd(), 0, len).unwrap();
        assert_eq!(region.len(), len);
        assert!(!region.is_empty());
        assert_ne!(region.base(), 0);

        region.write_u32(0, 0xdead_beef);
        region.write_u32(len - 4, 0x1234_5678);
        assert_eq!(region.read_u32(0), 0xdead_beef);
        assert_eq!(region.read_u32(len - 4), 0x1234_5678);
    }

    #[test]
    fn mapping_bad_fd_fails() {
        assert_eq!(
            map_shared(0, -1, 0, page_size()).unwrap_err(),
            BusError::ResourceMapFailed
        );
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_access_asserts() {
        let file = tempfile::tempfile().unwrap();
        let len = page_size();
        file.set_len(len as u64).unwrap();
        let region = map_shared(0, file.as_raw_fd(), 0, len).unwrap();
        region.read_u32(len);
    }
}
