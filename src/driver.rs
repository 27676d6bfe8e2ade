use bitflags::bitflags;

use crate::device::PlatformDevice;
use crate::{BusError, BusResult};

bitflags! {
    /// Capability flags declared by a platform driver.
    pub struct DriverFlags: u32 {
        /// Memory resources must be mapped before `probe` runs.
        const NEED_MAPPING = 0x0001;
    }
}

/// A driver attachable to platform devices.
///
/// Drivers are registered once at process start and stay registered for the
/// process lifetime. The id table is an ordered list of compatible strings;
/// an empty string terminates it early.
pub trait PlatformDriver: Send + Sync {
    /// Driver name used in logs.
    fn name(&self) -> &str;

    /// Compatible strings this driver claims.
    fn id_table(&self) -> &[&str];

    fn flags(&self) -> DriverFlags {
        DriverFlags::empty()
    }

    /// Called once a device matched and its resources are ready.
    fn probe(&self, dev: &mut PlatformDevice) -> BusResult;

    /// Called on explicit teardown; the bus never hot-removes devices.
    fn remove(&self, _dev: &mut PlatformDevice) -> BusResult {
        Ok(())
    }

    /// Driver-specific DMA mapping of a memory segment.
    fn dma_map(&self, _dev: &mut PlatformDevice, _addr: usize, _iova: u64, _len: usize) -> BusResult {
        Err(BusError::NotSupported)
    }

    /// Driver-specific DMA unmapping of a memory segment.
    fn dma_unmap(
        &self,
        _dev: &mut PlatformDevice,
        _addr: usize,
        _iova: u64,
        _len: usize,
    ) -> BusResult {
        Err(BusError::NotSupported)
    }
}

/// Check whether any of the device's compatible strings appears in the
/// driver's id table. The first hit wins; `""` terminates the table.
pub fn platform_match(drv: &dyn PlatformDriver, dev: &PlatformDevice) -> bool {
    for comp in dev.compatibles() {
        for id in drv.id_table() {
            if id.is_empty() {
                break;
            }
            if *id == comp.as_str() {
                return true;
            }
        }
    }
    false
}
