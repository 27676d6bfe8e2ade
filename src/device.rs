use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::driver::PlatformDriver;
use crate::mmio::MmioRegion;
use crate::BusResult;

/// Maximum number of memory resources per platform device.
pub const PLATFORM_MAX_RESOURCE: usize = 6;

/// Maximum number of compatible strings per platform device.
pub const PLATFORM_MAX_COMPATIBLE: usize = 4;

/// Canonical firmware path of a platform device, e.g. `/soc/ethernet@1b000000`.
///
/// The path doubles as the device's external name and as the registry sort
/// key; ordering is plain lexicographic string ordering.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlatformAddr(String);

impl PlatformAddr {
    pub fn new(dts_path: impl Into<String>) -> Self {
        PlatformAddr(dts_path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare two devices by canonical firmware path.
pub fn device_cmp(a: &PlatformDevice, b: &PlatformDevice) -> Ordering {
    a.addr.cmp(&b.addr)
}

/// Kernel-side driver a device is bound to, from the `DRIVER` uevent key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelDriver {
    Unknown,
    UioGeneric,
}

impl Default for KernelDriver {
    fn default() -> Self {
        KernelDriver::Unknown
    }
}

/// One memory-mapped register region of a device.
///
/// A resource with `len == 0` is absent and is never mapped. Slots keep the
/// firmware `reg` ordering by index and are never reordered after decode.
#[derive(Debug, Default)]
pub struct MemResource {
    pub phys_addr: u64,
    pub len: u64,
    pub mapping: Option<MmioRegion>,
}

/// Probe progress of a single device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    Unprobed,
    Probing,
    Bound,
    Failed,
}

/// Interrupt handle of a probed device.
///
/// For UIO devices the interrupt file descriptor is the opened `/dev/uioN`
/// node itself; the resource mapper installs it and `release` closes it.
#[derive(Debug, Default)]
pub struct IrqHandle {
    fd: Option<File>,
}

impl IrqHandle {
    pub(crate) fn alloc() -> BusResult<Self> {
        Ok(IrqHandle::default())
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    pub(crate) fn set_fd(&mut self, fd: File) {
        self.fd = Some(fd);
    }

    pub(crate) fn release(&mut self) {
        self.fd = None;
    }
}

/// A platform device discovered on the sysfs bus.
///
/// Devices are owned by the bus registry; a bound driver works on them
/// through the references the bus hands out and never outlives them.
pub struct PlatformDevice {
    pub(crate) addr: PlatformAddr,
    pub(crate) sysfs_path: PathBuf,
    pub(crate) compatibles: Vec<String>,
    pub(crate) kdrv: KernelDriver,
    pub(crate) mem_resource: [MemResource; PLATFORM_MAX_RESOURCE],
    pub(crate) driver: Option<Arc<dyn PlatformDriver>>,
    pub(crate) intr_handle: Option<IrqHandle>,
    pub(crate) state: ProbeState,
}

impl PlatformDevice {
    pub(crate) fn new(addr: PlatformAddr, sysfs_path: PathBuf) -> Self {
        PlatformDevice {
            addr,
            sysfs_path,
            compatibles: Vec::new(),
            kdrv: KernelDriver::Unknown,
            mem_resource: Default::default(),
            driver: None,
            intr_handle: None,
            state: ProbeState::Unprobed,
        }
    }

    /// External device name: the canonical firmware path.
    pub fn name(&self) -> &str {
        self.addr.as_str()
    }

    pub fn addr(&self) -> &PlatformAddr {
        &self.addr
    }

    /// Directory of the device under the sysfs bus root.
    pub fn sysfs_path(&self) -> &Path {
        &self.sysfs_path
    }

    /// Compatible strings in firmware order; index 0 is the most specific.
    pub fn compatibles(&self) -> &[String] {
        &self.compatibles
    }

    pub fn kernel_driver(&self) -> KernelDriver {
        self.kdrv
    }

    /// Memory resources in firmware `reg` order.
    pub fn resources(&self) -> &[MemResource] {
        &self.mem_resource
    }

    /// Mapped register region of resource `idx`, if it has been mapped.
    pub fn mmio(&self, idx: usize) -> Option<&MmioRegion> {
        self.mem_resource.get(idx).and_then(|res| res.mapping.as_ref())
    }

    pub fn driver(&self) -> Option<&Arc<dyn PlatformDriver>> {
        self.driver.as_ref()
    }

    pub fn irq_handle(&self) -> Option<&IrqHandle> {
        self.intr_handle.as_ref()
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }
}

impl fmt::Debug for PlatformDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformDevice")
            .field("addr", &self.addr)
            .field("kdrv", &self.kdrv)
            .field("compatibles", &self.compatibles)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_ordering_is_lexicographic() {
        let a = PlatformAddr::new("/soc/eth@0");
        let b = PlatformAddr::new("/soc/eth@1");
        let c = PlatformAddr::new("/soc/uart@0");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, PlatformAddr::new("/soc/eth@0"));
    }

    #[test]
    fn device_cmp_follows_addr() {
        let a = PlatformDevice::new(PlatformAddr::new("/soc/a"), PathBuf::new());
        let b = PlatformDevice::new(PlatformAddr::new("/soc/b"), PathBuf::new());
        assert_eq!(device_cmp(&a, &b), Ordering::Less);
        assert_eq!(device_cmp(&b, &a), Ordering::Greater);
        assert_eq!(device_cmp(&a, &a), Ordering::Equal);
    }

    #[test]
    fn fresh_device_is_unprobed() {
        let dev = PlatformDevice::new(PlatformAddr::new("/soc/a"), PathBuf::new());
        assert_eq!(dev.state(), ProbeState::Unprobed);
        assert!(dev.driver().is_none());
        assert!(dev.irq_handle().is_none());
        assert!(dev.resources().iter().all(|res| res.len == 0));
        assert!(dev.mmio(0).is_none());
    }
}
