//! The platform bus: scanning, the ordered device registry and probing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::device::{
    IrqHandle, KernelDriver, PlatformAddr, PlatformDevice, ProbeState, PLATFORM_MAX_COMPATIBLE,
};
use crate::driver::{platform_match, DriverFlags, PlatformDriver};
use crate::{devicetree, sysfs, uio};
use crate::{BusError, BusResult};

lazy_static! {
    /// Process-wide platform bus over the standard kernel paths.
    pub static ref PLATFORM_BUS: Mutex<PlatformBus> = Mutex::new(PlatformBus::from_env());
}

/// The platform bus: discovered devices in firmware-path order plus the
/// registered drivers.
pub struct PlatformBus {
    devices: Vec<PlatformDevice>,
    drivers: Vec<Arc<dyn PlatformDriver>>,
    sysfs_root: PathBuf,
    firmware_root: PathBuf,
    dev_root: PathBuf,
}

impl PlatformBus {
    /// Bus over the standard kernel paths, honoring the
    /// `SYSFS_PLATFORM_DEVICES` environment override for the bus root.
    pub fn from_env() -> Self {
        Self::with_paths(
            sysfs::platform_devices_path(),
            sysfs::SYSFS_DEVICETREE_BASE,
            "/dev",
        )
    }

    /// Bus over explicit roots: the platform device directory, the
    /// firmware-tree mirror and the character-device directory.
    pub fn with_paths(
        sysfs_root: impl Into<PathBuf>,
        firmware_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        PlatformBus {
            devices: Vec::new(),
            drivers: Vec::new(),
            sysfs_root: sysfs_root.into(),
            firmware_root: firmware_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Register a driver. Drivers stay registered for the process lifetime.
    pub fn register(&mut self, drv: Arc<dyn PlatformDriver>) {
        debug!("register driver {}", drv.name());
        self.drivers.push(drv);
    }

    /// Unregister the driver with the given name.
    pub fn unregister(&mut self, name: &str) {
        self.drivers.retain(|drv| drv.name() != name);
    }

    /// Devices in non-decreasing firmware-path order.
    pub fn devices(&self) -> &[PlatformDevice] {
        &self.devices
    }

    /// First device satisfying `pred`, in registry order.
    pub fn find_device<F>(&self, pred: F) -> Option<&PlatformDevice>
    where
        F: Fn(&PlatformDevice) -> bool,
    {
        self.devices.iter().find(|dev| pred(dev))
    }

    fn index_of(&self, addr: &PlatformAddr) -> Option<usize> {
        self.devices
            .binary_search_by(|dev| dev.addr().cmp(addr))
            .ok()
    }

    /// Scan the bus directory and merge every readable entry into the
    /// registry. A single bad entry is logged and skipped; the scan fails
    /// only if the directory itself cannot be read.
    pub fn scan(&mut self) -> BusResult {
        let entries = fs::read_dir(&self.sysfs_root).map_err(|err| {
            error!("cannot open {}: {}", self.sysfs_root.display(), err);
            BusError::Unreadable
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let dirname = entry.path();
            debug!("scanning {}", dirname.display());
            if let Err(err) = self.scan_one(&dirname) {
                warn!("skipping {}: {:?}", dirname.display(), err);
            }
        }
        Ok(())
    }

    /// Build one candidate device from its sysfs directory and merge it.
    fn scan_one(&mut self, dirname: &Path) -> BusResult {
        let uevent = dirname.join("uevent");

        let count = sysfs::uevent_find_entry(&uevent, "OF_COMPATIBLE_N")?;
        let count = count.trim().parse::<usize>().unwrap_or(0);
        if count < 1 || count > PLATFORM_MAX_COMPATIBLE {
            warn!("{}: bad compatible count {}", dirname.display(), count);
            return Err(BusError::InvalidParam);
        }

        let dts_path = sysfs::uevent_find_entry(&uevent, "OF_FULLNAME")?;
        let mut dev = PlatformDevice::new(PlatformAddr::new(dts_path), dirname.to_path_buf());

        self.parse_dts_resources(&mut dev);

        for i in 0..count {
            let key = format!("OF_COMPATIBLE_{}=", i);
            match sysfs::uevent_find_entry(&uevent, &key) {
                Ok(value) => {
                    debug!("{}: compatible{} = {}", dev.name(), i, value);
                    dev.compatibles.push(value);
                }
                // a missing indexed key is skipped, not fatal
                Err(_) => continue,
            }
        }

        dev.kdrv = match sysfs::uevent_find_entry(&uevent, "DRIVER") {
            Ok(value) if value == "uio_pdrv_genirq" => KernelDriver::UioGeneric,
            _ => KernelDriver::Unknown,
        };

        self.merge(dev);
        Ok(())
    }

    /// Decode the device's `reg` property from the firmware-tree mirror.
    /// Failures leave the slots zeroed; the candidate survives.
    fn parse_dts_resources(&self, dev: &mut PlatformDevice) {
        let widths = devicetree::discover_cell_widths(&self.firmware_root, dev.name());
        let reg_path = self
            .firmware_root
            .join(dev.name().trim_start_matches('/'))
            .join("reg");
        let reg = match fs::File::open(&reg_path) {
            Ok(file) => file,
            Err(err) => {
                warn!("cannot open {}: {}", reg_path.display(), err);
                return;
            }
        };
        if let Err(err) = devicetree::parse_reg(reg, widths, &mut dev.mem_resource) {
            warn!("{}: cannot decode reg: {:?}", dev.name(), err);
        }
    }

    /// Merge a candidate into the ordered registry: insert at its sort
    /// position, or refresh the mutable fields of the entry already
    /// registered at the same address, keeping that entry's identity and
    /// any bound driver.
    pub(crate) fn merge(&mut self, candidate: PlatformDevice) {
        match self
            .devices
            .binary_search_by(|dev| dev.addr().cmp(candidate.addr()))
        {
            Ok(idx) => {
                let existing = &mut self.devices[idx];
                // replacing the slots drops any mapped regions; the stale
                // mapping record must not outlive them
                if existing.mem_resource.iter().any(|res| res.mapping.is_some()) {
                    uio::release_record(&existing.addr);
                }
                existing.kdrv = candidate.kdrv;
                existing.compatibles = candidate.compatibles;
                existing.mem_resource = candidate.mem_resource;
                existing.sysfs_path = candidate.sysfs_path;
            }
            Err(idx) => self.devices.insert(idx, candidate),
        }
    }

    /// Probe every device against every registered driver.
    ///
    /// Fails only if at least one device exists and every device failed;
    /// unmatched and already-bound devices are not failures.
    pub fn probe(&mut self) -> BusResult {
        let drivers = self.drivers.clone();
        let mut probed = 0usize;
        let mut failed = 0usize;

        for idx in 0..self.devices.len() {
            probed += 1;
            match self.probe_all_drivers(idx, &drivers) {
                Ok(()) => {}
                Err(BusError::NoMatchingDriver) | Err(BusError::AlreadyBound) => {}
                Err(err) => {
                    error!(
                        "requested device {} cannot be used: {:?}",
                        self.devices[idx].name(),
                        err
                    );
                    failed += 1;
                }
            }
        }

        if probed > 0 && probed == failed {
            return Err(BusError::ProbeFailed);
        }
        Ok(())
    }

    /// Try every driver in registration order until one binds the device.
    fn probe_all_drivers(&mut self, idx: usize, drivers: &[Arc<dyn PlatformDriver>]) -> BusResult {
        let mut last_err = None;

        for drv in drivers {
            match self.probe_one_driver(drv, idx) {
                Ok(()) => return Ok(()),
                // this driver does not claim the device
                Err(BusError::NoMatchingDriver) | Err(BusError::NotSupported) => continue,
                Err(BusError::AlreadyBound) => return Err(BusError::AlreadyBound),
                Err(err) => {
                    warn!(
                        "driver {} failed for {}: {:?}",
                        drv.name(),
                        self.devices[idx].name(),
                        err
                    );
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) => {
                self.devices[idx].state = ProbeState::Failed;
                Err(err)
            }
            None => Err(BusError::NoMatchingDriver),
        }
    }

    fn probe_one_driver(&mut self, drv: &Arc<dyn PlatformDriver>, idx: usize) -> BusResult {
        {
            let dev = &self.devices[idx];
            if !platform_match(drv.as_ref(), dev) {
                return Err(BusError::NoMatchingDriver);
            }
            if dev.driver.is_some() {
                debug!("device {} is already probed", dev.name());
                return Err(BusError::AlreadyBound);
            }
        }

        let dev = &mut self.devices[idx];
        dev.state = ProbeState::Probing;
        dev.intr_handle = Some(IrqHandle::alloc()?);

        if drv.flags().contains(DriverFlags::NEED_MAPPING) {
            if let Err(err) = self.map_device_at(idx) {
                let dev = &mut self.devices[idx];
                dev.intr_handle = None;
                // a skipped driver leaves no probe trace on the device
                if err == BusError::NotSupported {
                    dev.state = ProbeState::Unprobed;
                }
                return Err(err);
            }
        }

        let dev = &mut self.devices[idx];
        dev.driver = Some(drv.clone());
        debug!("probe driver {} for {}", drv.name(), dev.name());
        if let Err(err) = drv.probe(dev) {
            dev.driver = None;
            dev.intr_handle = None;
            return Err(err);
        }
        dev.state = ProbeState::Bound;
        Ok(())
    }

    fn map_device_at(&mut self, idx: usize) -> BusResult {
        let dev_root = self.dev_root.clone();
        let dev = &mut self.devices[idx];
        match dev.kdrv {
            KernelDriver::UioGeneric => uio::map_resources(dev, &dev_root),
            KernelDriver::Unknown => {
                debug!(
                    "{}: not managed by a supported kernel driver, skipped",
                    dev.name()
                );
                Err(BusError::NotSupported)
            }
        }
    }

    /// Map a device's memory resources on request, outside the probe path.
    ///
    /// Drivers that do not declare [`DriverFlags::NEED_MAPPING`] call this
    /// themselves once probed.
    pub fn map_device(&mut self, addr: &PlatformAddr) -> BusResult {
        let idx = self.index_of(addr).ok_or(BusError::NotFound)?;
        if self.devices[idx].intr_handle.is_none() {
            self.devices[idx].intr_handle = Some(IrqHandle::alloc()?);
        }
        self.map_device_at(idx)
    }

    /// Tear down a device's mappings: drop every mapped region, release
    /// the process-wide mapping record and close the interrupt file
    /// descriptors.
    pub fn unmap_device(&mut self, addr: &PlatformAddr) -> BusResult {
        let idx = self.index_of(addr).ok_or(BusError::NotFound)?;
        uio::unmap_resources(&mut self.devices[idx]);
        Ok(())
    }
}
