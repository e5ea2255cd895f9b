use core::convert::TryFrom;

use crate::config::{BLOCK_SIZE, PAGE_SIZE, SECTOR_SIZE};

/// Memory layout of an initialised flash device.
///
/// All sizes are in bytes. Page, sector and block sizes are powers of two
/// and each divides the next, so conversions between units are exact when
/// going to a smaller unit and round down when going to a larger one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: u32,
    pub sector_size: u32,
    pub block_size: u32,
    pub page_count: u32,
    pub sector_count: u32,
    pub block_count: u32,
    pub total_size: u32,
}

impl Geometry {
    /// Compute the full layout of a device with `block_count` 64kB blocks.
    ///
    /// Returns None if the total size does not fit in 32 bits.
    pub fn from_block_count(block_count: u32) -> Option<Self> {
        let sector_count = block_count.checked_mul(BLOCK_SIZE / SECTOR_SIZE)?;
        let total_size = sector_count.checked_mul(SECTOR_SIZE)?;
        Some(Geometry {
            page_size: PAGE_SIZE,
            sector_size: SECTOR_SIZE,
            block_size: BLOCK_SIZE,
            page_count: total_size / PAGE_SIZE,
            sector_count,
            block_count,
            total_size,
        })
    }

    pub fn page_to_sector(&self, page: u32) -> u32 {
        Self::convert(page, self.page_size, self.sector_size)
    }

    pub fn page_to_block(&self, page: u32) -> u32 {
        Self::convert(page, self.page_size, self.block_size)
    }

    pub fn sector_to_block(&self, sector: u32) -> u32 {
        Self::convert(sector, self.sector_size, self.block_size)
    }

    pub fn sector_to_page(&self, sector: u32) -> u32 {
        Self::convert(sector, self.sector_size, self.page_size)
    }

    pub fn block_to_page(&self, block: u32) -> u32 {
        Self::convert(block, self.block_size, self.page_size)
    }

    pub fn block_to_sector(&self, block: u32) -> u32 {
        Self::convert(block, self.block_size, self.sector_size)
    }

    /// `index * from / to`, saturating at `u32::MAX`.
    fn convert(index: u32, from: u32, to: u32) -> u32 {
        let units = index as u64 * from as u64 / to as u64;
        u32::try_from(units).unwrap_or(u32::MAX)
    }

    /// Byte address of `offset` bytes into unit `index` of `unit_size` bytes.
    ///
    /// Offsets past the end of the unit continue into the following units.
    /// Returns None if the address does not fit in 32 bits.
    pub fn unit_address(index: u32, unit_size: u32, offset: u32) -> Option<u32> {
        index.checked_mul(unit_size)?.checked_add(offset)
    }

    /// True if `length` bytes starting at `address` lie within the device.
    pub fn contains(&self, address: u32, length: usize) -> bool {
        (address as u64) + (length as u64) <= self.total_size as u64
    }
}

#[test]
fn test_geometry_from_blocks() {
    let g = Geometry::from_block_count(128).unwrap();
    assert_eq!(g.sector_count, 2048);
    assert_eq!(g.page_count, 32768);
    assert_eq!(g.total_size, 8 * 1024 * 1024);
    assert_eq!(g.sector_count, g.block_count * (g.block_size / g.sector_size));
    assert_eq!(g.page_count, g.sector_count * g.sector_size / g.page_size);
}

#[test]
fn test_unit_conversions() {
    let g = Geometry::from_block_count(64).unwrap();
    assert_eq!(g.page_to_sector(17), 1);
    assert_eq!(g.page_to_block(257), 1);
    assert_eq!(g.sector_to_block(31), 1);
    assert_eq!(g.sector_to_page(3), 48);
    assert_eq!(g.block_to_page(2), 512);
    assert_eq!(g.block_to_sector(2), 32);

    // Round trips through the larger unit hold for aligned indices.
    for sector in 0..g.sector_count {
        assert_eq!(g.page_to_sector(g.sector_to_page(sector)), sector);
    }
    for page in (0..g.page_count).step_by(16) {
        assert_eq!(g.sector_to_page(g.page_to_sector(page)), page);
    }
    for page in (0..g.page_count).step_by(256) {
        assert_eq!(g.block_to_page(g.page_to_block(page)), page);
    }
    for sector in (0..g.sector_count).step_by(16) {
        assert_eq!(g.block_to_sector(g.sector_to_block(sector)), sector);
    }
}

#[test]
fn test_unit_address() {
    assert_eq!(Geometry::unit_address(2, 256, 10), Some(522));
    // Offset rolls into the next page.
    assert_eq!(Geometry::unit_address(2, 256, 300), Some(812));
    assert_eq!(Geometry::unit_address(u32::MAX, 256, 0), None);
}

#[test]
fn test_contains() {
    let g = Geometry::from_block_count(2).unwrap();
    assert!(g.contains(0, g.total_size as usize));
    assert!(g.contains(g.total_size - 1, 1));
    assert!(!g.contains(g.total_size - 1, 2));
    assert!(!g.contains(u32::MAX, 2));
}

#[test]
fn test_geometry_too_large() {
    // 65535 blocks is the largest layout whose size fits in 32 bits.
    let g = Geometry::from_block_count(0xFFFF).unwrap();
    assert_eq!(g.total_size, 0xFFFF_0000);
    assert_eq!(Geometry::from_block_count(0x1_0000), None);
    assert_eq!(Geometry::from_block_count(u32::MAX), None);
}

#[test]
fn test_conversions_saturate() {
    let g = Geometry::from_block_count(2).unwrap();
    assert_eq!(g.page_to_sector(u32::MAX), u32::MAX / 16);
    assert_eq!(g.block_to_page(u32::MAX), u32::MAX);
}
