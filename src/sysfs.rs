//! Key/value extraction from kernel-generated sysfs descriptor files.

use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::{BusError, BusResult};

/// Size of the fixed uevent value buffer, terminator included.
pub const UEVENT_VALUE_LEN_MAX: usize = 100;

/// Default sysfs directory listing platform devices.
pub const SYSFS_PLATFORM_DEVICES: &str = "/sys/bus/platform/devices";

/// Default sysfs mirror of the firmware device tree.
pub const SYSFS_DEVICETREE_BASE: &str = "/sys/firmware/devicetree/base";

/// Platform bus directory, honoring the `SYSFS_PLATFORM_DEVICES`
/// environment override.
pub fn platform_devices_path() -> PathBuf {
    match env::var_os("SYSFS_PLATFORM_DEVICES") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(SYSFS_PLATFORM_DEVICES),
    }
}

/// Extract the value of `key` from a `key=value` descriptor file.
///
/// The first line containing `key` is split at its first `=`; the rest of
/// the line, line terminator stripped, is the value. Keys never span lines.
pub fn uevent_find_entry(filename: &Path, key: &str) -> BusResult<String> {
    let file = File::open(filename).map_err(|err| {
        error!("cannot open uevent file {}: {}", filename.display(), err);
        BusError::Unreadable
    })?;

    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| {
            error!("cannot read uevent file {}: {}", filename.display(), err);
            BusError::Unreadable
        })?;
        if !line.contains(key) {
            continue;
        }
        let value = match line.split_once('=') {
            Some((_, value)) => value,
            None => "",
        };
        if value.len() >= UEVENT_VALUE_LEN_MAX {
            error!("value of {} in {} is too long", key, filename.display());
            return Err(BusError::ValueTooLong);
        }
        return Ok(value.to_string());
    }

    warn!("cannot parse {:?} in {}", key, filename.display());
    Err(BusError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn uevent_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uevent");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn finds_value_by_key() {
        let (_dir, path) = uevent_file("DRIVER=uio_pdrv_genirq\nOF_FULLNAME=/soc/eth@0\n");
        assert_eq!(
            uevent_find_entry(&path, "DRIVER").unwrap(),
            "uio_pdrv_genirq"
        );
        assert_eq!(uevent_find_entry(&path, "OF_FULLNAME").unwrap(), "/soc/eth@0");
    }

    #[test]
    fn indexed_key_with_separator_is_exact() {
        let (_dir, path) = uevent_file("OF_COMPATIBLE_N=2\nOF_COMPATIBLE_0=a\nOF_COMPATIBLE_1=b\n");
        assert_eq!(uevent_find_entry(&path, "OF_COMPATIBLE_1=").unwrap(), "b");
        assert_eq!(uevent_find_entry(&path, "OF_COMPATIBLE_N").unwrap(), "2");
    }

    #[test]
    fn missing_key_is_not_found() {
        let (_dir, path) = uevent_file("DRIVER=foo\n");
        assert_eq!(
            uevent_find_entry(&path, "OF_FULLNAME"),
            Err(BusError::NotFound)
        );
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempdir().unwrap();
        assert_eq!(
            uevent_find_entry(&dir.path().join("uevent"), "DRIVER"),
            Err(BusError::Unreadable)
        );
    }

    #[test]
    fn oversized_value_is_rejected() {
        let long = "x".repeat(UEVENT_VALUE_LEN_MAX);
        let (_dir, path) = uevent_file(&format!("KEY={}\n", long));
        assert_eq!(uevent_find_entry(&path, "KEY"), Err(BusError::ValueTooLong));

        let fits = "x".repeat(UEVENT_VALUE_LEN_MAX - 1);
        let (_dir, path) = uevent_file(&format!("KEY={}\n", fits));
        assert_eq!(uevent_find_entry(&path, "KEY").unwrap(), fits);
    }

    #[test]
    fn env_override_changes_bus_root() {
        env::set_var("SYSFS_PLATFORM_DEVICES", "/tmp/fake-bus");
        assert_eq!(platform_devices_path(), PathBuf::from("/tmp/fake-bus"));
        env::remove_var("SYSFS_PLATFORM_DEVICES");
        assert_eq!(platform_devices_path(), PathBuf::from(SYSFS_PLATFORM_DEVICES));
    }
}
