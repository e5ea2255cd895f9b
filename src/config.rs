//! Fixed protocol constants and per-instance configuration.

/// Page program granularity in bytes.
pub const PAGE_SIZE: u32 = 0x100;
/// Smallest erase unit (4kB sector) in bytes.
pub const SECTOR_SIZE: u32 = 0x1000;
/// Half block (32kB) erase unit in bytes.
pub const BLOCK_32K_SIZE: u32 = 0x8000;
/// Block (64kB) erase unit in bytes.
pub const BLOCK_SIZE: u32 = 0x10000;

/// Bytes reachable with 3-byte addressing.
pub const ADDRESS_SPACE: u64 = 1 << 24;

/// Value of every byte in an erased region.
pub const ERASED_VALUE: u8 = 0xFF;

/// Delay between status register polls while waiting for BUSY to clear.
pub const POLL_INTERVAL_US: u32 = 100;
/// Delay after forcing chip-select inactive during initialisation.
pub const BUS_SETTLE_US: u64 = 100;

/// Maximum time allowed for each class of internal write cycle, in milliseconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub sector_erase_ms: u32,
    pub block_erase_32k_ms: u32,
    pub block_erase_64k_ms: u32,
    pub chip_erase_ms: u32,
    pub page_program_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            sector_erase_ms: 10_000,
            block_erase_32k_ms: 16_000,
            block_erase_64k_ms: 25_000,
            chip_erase_ms: 160_000,
            page_program_ms: 500,
        }
    }
}

/// Driver configuration, fixed for the lifetime of a `Nor` instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Busy-wait budgets used after each mutating command.
    pub timeouts: Timeouts,

    /// Size of each probe read when checking a region is erased.
    pub empty_check_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeouts: Timeouts::default(),
            empty_check_len: 64,
        }
    }
}
