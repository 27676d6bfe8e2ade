//! Mapping UIO-managed platform devices into the process.
//!
//! The kernel-side `uio_pdrv_genirq` driver exposes a platform device as a
//! `/dev/uioN` character device; a shared mapping of that node yields the
//! device's register regions. Completed mappings are recorded in a
//! process-wide list so cooperating processes can reproduce them without
//! repeating the scan.

use std::fs::{self, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::device::{PlatformAddr, PlatformDevice, PLATFORM_MAX_RESOURCE};
use crate::mmio;
use crate::{BusError, BusResult};

/// One reproduced mapping of a device resource.
#[derive(Clone, Debug)]
pub struct PlatformMap {
    pub phys_addr: u64,
    pub size: u64,
    pub addr: usize,
}

/// Mapping record of one device, kept for cooperating processes.
#[derive(Clone, Debug)]
pub struct MappedResource {
    pub platform_addr: PlatformAddr,
    pub path: PathBuf,
    pub maps: Vec<PlatformMap>,
}

lazy_static! {
    static ref UIO_RES_LIST: Mutex<Vec<MappedResource>> = Mutex::new(Vec::new());
    /// Next mapping hint; zero means "not seeded yet".
    static ref PLATFORM_MAP_ADDR: Mutex<usize> = Mutex::new(0);
}

/// Snapshot of the process-wide mapping records.
pub fn mapped_resources() -> Vec<MappedResource> {
    UIO_RES_LIST.lock().unwrap().clone()
}

/// Parse `uioN` or `uio:uioN` into the index.
fn parse_uio_name(name: &str) -> Option<u32> {
    let rest = name
        .strip_prefix("uio:uio")
        .or_else(|| name.strip_prefix("uio"))?;
    rest.parse().ok()
}

/// Resolve the UIO index of a platform device.
///
/// Depending on the kernel version the entry is `<device>/uio/uioN` or
/// `<device>/uio:uioN`.
fn find_uio_index(sysfs_path: &Path) -> BusResult<u32> {
    if let Ok(entries) = fs::read_dir(sysfs_path.join("uio")) {
        for entry in entries.flatten() {
            if let Some(num) = parse_uio_name(&entry.file_name().to_string_lossy()) {
                return Ok(num);
            }
        }
    }
    if let Ok(entries) = fs::read_dir(sysfs_path) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(num) = name
                .to_string_lossy()
                .strip_prefix("uio:uio")
                .and_then(|rest| rest.parse().ok())
            {
                return Ok(num);
            }
        }
    }
    Err(BusError::NoUioEntry)
}

/// Highest end address among the process's current mappings, skipping the
/// fixed kernel `[vsyscall]` region.
fn find_max_end_va() -> usize {
    let maps = match fs::read_to_string("/proc/self/maps") {
        Ok(maps) => maps,
        Err(err) => {
            warn!("cannot read /proc/self/maps: {}", err);
            return 0;
        }
    };
    let mut max_va = 0;
    for line in maps.lines() {
        if line.ends_with("[vsyscall]") {
            continue;
        }
        let end = line
            .split_whitespace()
            .next()
            .and_then(|range| range.split_once('-'))
            .and_then(|(_, end)| usize::from_str_radix(end, 16).ok());
        if let Some(end) = end {
            if end > max_va {
                max_va = end;
            }
        }
    }
    max_va
}

/// Current mapping hint, seeded on first use so hardware mappings land
/// above general-purpose memory.
fn next_map_hint() -> usize {
    let mut hint = PLATFORM_MAP_ADDR.lock().unwrap();
    if *hint == 0 {
        *hint = find_max_end_va();
    }
    *hint
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Advance the hint past `end`, rounded up to the page size, so the next
/// resource maps contiguously above it.
fn advance_map_hint(end: usize) {
    *PLATFORM_MAP_ADDR.lock().unwrap() = align_up(end, mmio::page_size());
}

fn map_resource_by_index(
    dev: &mut PlatformDevice,
    idx: usize,
    uio_res: &mut MappedResource,
) -> BusResult {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&uio_res.path)
        .map_err(|err| {
            error!("cannot open {}: {}", uio_res.path.display(), err);
            BusError::OpenFailed
        })?;

    let len = dev.mem_resource[idx].len as usize;
    let region = mmio::map_shared(next_map_hint(), fd.as_raw_fd(), 0, len)?;
    advance_map_hint(region.base() + len);

    uio_res.maps.push(PlatformMap {
        phys_addr: dev.mem_resource[idx].phys_addr,
        size: dev.mem_resource[idx].len,
        addr: region.base(),
    });
    dev.mem_resource[idx].mapping = Some(region);
    Ok(())
}

/// Map every non-zero-length resource of a UIO-generic device.
///
/// The opened `/dev/uioN` becomes the device's interrupt file descriptor.
/// On a mid-device failure, regions mapped so far stay with their slots;
/// the caller owns cleanup.
pub(crate) fn map_resources(dev: &mut PlatformDevice, dev_root: &Path) -> BusResult {
    if let Some(handle) = dev.intr_handle.as_mut() {
        handle.release();
    }

    let uio_num = find_uio_index(dev.sysfs_path()).map_err(|err| {
        warn!("{} is not managed by the UIO driver, skipping", dev.name());
        err
    })?;
    let devname = dev_root.join(format!("uio{}", uio_num));

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&devname)
        .map_err(|err| {
            error!("cannot open {}: {}", devname.display(), err);
            BusError::OpenFailed
        })?;
    if let Some(handle) = dev.intr_handle.as_mut() {
        handle.set_fd(fd);
    }

    let mut uio_res = MappedResource {
        platform_addr: dev.addr().clone(),
        path: devname,
        maps: Vec::new(),
    };

    for idx in 0..PLATFORM_MAX_RESOURCE {
        // skip mapping zero-length reg
        if dev.mem_resource[idx].len == 0 {
            continue;
        }
        map_resource_by_index(dev, idx, &mut uio_res)?;
    }

    let mut list = UIO_RES_LIST.lock().unwrap();
    list.try_reserve(1).map_err(|_| {
        error!("cannot store uio mmap details for {}", dev.name());
        BusError::AllocationFailed
    })?;
    list.push(uio_res);
    Ok(())
}

/// Drop the mapping record published for `addr`. Called whenever the
/// regions the record describes are released; a stale record would have
/// cooperating processes reproduce mappings the primary no longer holds.
pub(crate) fn release_record(addr: &PlatformAddr) {
    UIO_RES_LIST
        .lock()
        .unwrap()
        .retain(|res| &res.platform_addr != addr);
}

/// Drop every mapped region of the device, release its mapping record and
/// close its interrupt file descriptors.
pub(crate) fn unmap_resources(dev: &mut PlatformDevice) {
    for res in dev.mem_resource.iter_mut() {
        res.mapping = None;
    }
    release_record(dev.addr());
    if let Some(handle) = dev.intr_handle.as_mut() {
        handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn parses_both_uio_name_conventions() {
        assert_eq!(parse_uio_name("uio0"), Some(0));
        assert_eq!(parse_uio_name("uio12"), Some(12));
        assert_eq!(parse_uio_name("uio:uio3"), Some(3));
        assert_eq!(parse_uio_name("uio"), None);
        assert_eq!(parse_uio_name("uevent"), None);
    }

    #[test]
    fn finds_index_in_uio_subdirectory() {
        let dev = tempdir().unwrap();
        fs::create_dir_all(dev.path().join("uio/uio5")).unwrap();
        assert_eq!(find_uio_index(dev.path()).unwrap(), 5);
    }

    #[test]
    fn finds_index_in_flattened_entry() {
        let dev = tempdir().unwrap();
        fs::create_dir_all(dev.path().join("uio:uio7")).unwrap();
        assert_eq!(find_uio_index(dev.path()).unwrap(), 7);
    }

    #[test]
    fn missing_uio_entry_is_reported() {
        let dev = tempdir().unwrap();
        File::create(dev.path().join("uevent")).unwrap();
        assert_eq!(find_uio_index(dev.path()), Err(BusError::NoUioEntry));
    }

    #[test]
    fn hint_advances_page_aligned() {
        let page = mmio::page_size();
        assert_eq!(align_up(3 * page + 1, page), 4 * page);
        assert_eq!(align_up(4 * page, page), 4 * page);
        assert_eq!(align_up(1, page), page);
    }

    #[test]
    fn max_end_va_is_nonzero_and_page_aligned() {
        let max_va = find_max_end_va();
        assert!(max_va != 0);
        assert_eq!(max_va % mmio::page_size(), 0);
    }

    #[test]
    fn seeded_hint_is_nonzero() {
        assert!(next_map_hint() != 0);
    }
}
