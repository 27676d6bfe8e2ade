//! Platform device discovery and UIO resource mapping over Linux sysfs.
//!
//! Memory-mapped devices described by the firmware device tree show up
//! under the kernel's platform bus in sysfs. This crate scans that
//! directory, decodes each device's `reg` property into physical memory
//! resources, matches devices against registered drivers and, for devices
//! handled by the generic UIO kernel driver, maps their register regions
//! into the process so a driver's probe can reach them.

#[macro_use]
extern crate log;

mod bus;
mod device;
mod driver;

pub mod devicetree;
pub mod mmio;
pub mod sysfs;
pub mod uio;

pub use bus::{PlatformBus, PLATFORM_BUS};
pub use device::{
    device_cmp, IrqHandle, KernelDriver, MemResource, PlatformAddr, PlatformDevice, ProbeState,
    PLATFORM_MAX_COMPATIBLE, PLATFORM_MAX_RESOURCE,
};
pub use driver::{platform_match, DriverFlags, PlatformDriver};
pub use mmio::MmioRegion;
pub use uio::{MappedResource, PlatformMap};

/// Errors reported while scanning, probing or mapping platform devices.
///
/// Nothing here is globally fatal: scan and probe contain per-device
/// failures and only report an aggregate error when every device failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// A sysfs or device file cannot be opened or read.
    Unreadable,
    /// The requested key is absent from a `uevent` file.
    NotFound,
    /// A `uevent` value does not fit the fixed value buffer.
    ValueTooLong,
    /// A parsed value is out of its permitted range.
    InvalidParam,
    /// `#address-cells` or `#size-cells` is wider than two cells.
    UnsupportedCellWidth,
    /// The device already has a bound driver.
    AlreadyBound,
    /// No registered driver matched the device's compatible strings.
    NoMatchingDriver,
    /// The driver or kernel driver kind does not support the operation.
    NotSupported,
    /// No UIO entry exists below the device's sysfs directory.
    NoUioEntry,
    /// The UIO character device cannot be opened.
    OpenFailed,
    /// A memory resource cannot be mapped.
    ResourceMapFailed,
    /// A tracking record or interrupt handle cannot be allocated.
    AllocationFailed,
    /// Every device on the bus failed to probe.
    ProbeFailed,
}

pub type BusResult<T = ()> = core::result::Result<T, BusError>;
