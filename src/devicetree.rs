//! Device-tree `reg` decoding scoped by `#address-cells`/`#size-cells`.
//!
//! Only the subset needed for resource extraction is implemented: cell
//! widths discovered along the firmware path (last definition wins, as in
//! device-tree inheritance) and the flat big-endian cell stream of a `reg`
//! property. General tree parsing is out of scope.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::device::MemResource;
use crate::{BusError, BusResult};

/// Cell counts in force for a device node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellWidths {
    pub address: u32,
    pub size: u32,
}

impl Default for CellWidths {
    fn default() -> Self {
        CellWidths { address: 1, size: 1 }
    }
}

fn read_cell(path: &Path) -> Option<u32> {
    let mut cell = [0u8; 4];
    let mut file = File::open(path).ok()?;
    file.read_exact(&mut cell).ok()?;
    Some(u32::from_be_bytes(cell))
}

/// Walk the firmware path from the tree root and pick up the last
/// `#address-cells`/`#size-cells` definition seen on the way down.
pub fn discover_cell_widths(base: &Path, dts_path: &str) -> CellWidths {
    let mut widths = CellWidths::default();
    let mut dir = base.to_path_buf();
    for component in dts_path.split('/').filter(|c| !c.is_empty()) {
        dir.push(component);
        if let Some(cells) = read_cell(&dir.join("#address-cells")) {
            widths.address = cells;
        }
        if let Some(cells) = read_cell(&dir.join("#size-cells")) {
            widths.size = cells;
        }
    }
    widths
}

/// Decode a `reg` cell stream into the resource slots.
///
/// Each slot takes `address` cells (most significant first) and then
/// `size` cells. Slots are zeroed first and decoding stops quietly once
/// the stream runs out; firmware may describe fewer resources than there
/// are slots.
pub fn parse_reg<R: Read>(
    mut reg: R,
    widths: CellWidths,
    resources: &mut [MemResource],
) -> BusResult {
    if widths.address > 2 || widths.size > 2 {
        error!(
            "#address-cells or #size-cells is too large: {}/{}",
            widths.address, widths.size
        );
        return Err(BusError::UnsupportedCellWidth);
    }

    let mut cell = [0u8; 4];
    for res in resources.iter_mut() {
        res.phys_addr = 0;
        res.len = 0;
        res.mapping = None;
        for j in 0..widths.address {
            if reg.read_exact(&mut cell).is_err() {
                return Ok(());
            }
            res.phys_addr +=
                u64::from(u32::from_be_bytes(cell)) << (32 * (widths.address - j - 1));
        }
        for j in 0..widths.size {
            if reg.read_exact(&mut cell).is_err() {
                return Ok(());
            }
            res.len += u64::from(u32::from_be_bytes(cell)) << (32 * (widths.size - j - 1));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PLATFORM_MAX_RESOURCE;
    use std::fs;
    use tempfile::tempdir;

    fn cells(words: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn decodes_single_narrow_resource() {
        let stream = cells(&[0x1000, 0x100]);
        let mut res: [MemResource; PLATFORM_MAX_RESOURCE] = Default::default();
        parse_reg(stream.as_slice(), CellWidths::default(), &mut res).unwrap();
        assert_eq!(res[0].phys_addr, 0x1000);
        assert_eq!(res[0].len, 0x100);
        assert!(res[1..].iter().all(|r| r.len == 0 && r.phys_addr == 0));
    }

    #[test]
    fn round_trips_wide_addresses() {
        let widths = CellWidths { address: 2, size: 1 };
        let pairs: &[(u64, u64)] = &[
            (0x8_0000_0000, 0x1000),
            (0x1b00_0000, 0x200),
            (0xffff_ffff_0000_0000, 0x40),
        ];
        let mut stream = Vec::new();
        for (addr, len) in pairs {
            stream.extend_from_slice(&cells(&[(addr >> 32) as u32, *addr as u32, *len as u32]));
        }
        let mut res: [MemResource; PLATFORM_MAX_RESOURCE] = Default::default();
        parse_reg(stream.as_slice(), widths, &mut res).unwrap();
        for (i, (addr, len)) in pairs.iter().enumerate() {
            assert_eq!(res[i].phys_addr, *addr);
            assert_eq!(res[i].len, *len);
        }
        assert_eq!(res[pairs.len()].len, 0);
    }

    #[test]
    fn truncated_stream_leaves_absent_slots() {
        // one full pair, then a lone address cell
        let stream = cells(&[0x1000, 0x100, 0x2000]);
        let mut res: [MemResource; PLATFORM_MAX_RESOURCE] = Default::default();
        parse_reg(stream.as_slice(), CellWidths::default(), &mut res).unwrap();
        assert_eq!(res[0].len, 0x100);
        assert_eq!(res[1].len, 0);
        assert!(res[1].mapping.is_none());
    }

    #[test]
    fn rejects_wide_cell_counts() {
        let mut res: [MemResource; PLATFORM_MAX_RESOURCE] = Default::default();
        let widths = CellWidths { address: 3, size: 1 };
        assert_eq!(
            parse_reg(&[][..], widths, &mut res),
            Err(BusError::UnsupportedCellWidth)
        );
        let widths = CellWidths { address: 1, size: 3 };
        assert_eq!(
            parse_reg(&[][..], widths, &mut res),
            Err(BusError::UnsupportedCellWidth)
        );
    }

    #[test]
    fn widths_use_last_definition_on_path() {
        let root = tempdir().unwrap();
        let soc = root.path().join("soc");
        let eth = soc.join("eth@0");
        fs::create_dir_all(&eth).unwrap();
        fs::write(soc.join("#address-cells"), 2u32.to_be_bytes()).unwrap();
        fs::write(soc.join("#size-cells"), 2u32.to_be_bytes()).unwrap();
        assert_eq!(
            discover_cell_widths(root.path(), "/soc/eth@0"),
            CellWidths { address: 2, size: 2 }
        );

        // a deeper definition overrides one branch only
        fs::write(eth.join("#size-cells"), 1u32.to_be_bytes()).unwrap();
        assert_eq!(
            discover_cell_widths(root.path(), "/soc/eth@0"),
            CellWidths { address: 2, size: 1 }
        );
    }

    #[test]
    fn widths_default_to_one_cell() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("soc/eth@0")).unwrap();
        assert_eq!(
            discover_cell_widths(root.path(), "/soc/eth@0"),
            CellWidths::default()
        );
    }
}
