use alloc::vec::Vec;

use crate::config::{Timeouts, BLOCK_32K_SIZE, BLOCK_SIZE, SECTOR_SIZE};
use crate::Command;

/// Erase granularities supported by the chip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EraseSize {
    /// 4kB sector erase, opcode 0x20.
    Sector4K,
    /// 32kB block erase, opcode 0x52.
    Block32K,
    /// 64kB block erase, opcode 0xD8.
    Block64K,
}

impl EraseSize {
    pub const ALL: [EraseSize; 3] = [EraseSize::Sector4K, EraseSize::Block32K, EraseSize::Block64K];

    pub fn size(&self) -> u32 {
        match self {
            EraseSize::Sector4K => SECTOR_SIZE,
            EraseSize::Block32K => BLOCK_32K_SIZE,
            EraseSize::Block64K => BLOCK_SIZE,
        }
    }

    pub fn opcode(&self) -> u8 {
        let command = match self {
            EraseSize::Sector4K => Command::SectorErase,
            EraseSize::Block32K => Command::BlockErase32K,
            EraseSize::Block64K => Command::BlockErase64K,
        };
        command.into()
    }

    /// Busy-wait budget for this erase, in milliseconds.
    pub fn timeout_ms(&self, timeouts: &Timeouts) -> u32 {
        match self {
            EraseSize::Sector4K => timeouts.sector_erase_ms,
            EraseSize::Block32K => timeouts.block_erase_32k_ms,
            EraseSize::Block64K => timeouts.block_erase_64k_ms,
        }
    }

    /// Round `address` down to the start of the unit containing it.
    pub fn align(&self, address: u32) -> u32 {
        address & !(self.size() - 1)
    }
}

/// Erase plan of (erase size, base address) to erase a range of memory.
#[derive(Clone, Debug)]
pub(crate) struct ErasePlan(pub Vec<(EraseSize, u32)>);

impl ErasePlan {
    pub fn new(start: u32, length: u32) -> Self {
        log::trace!("Creating erase plan, start={} length={}", start, length);
        let mut plan = Vec::new();

        // For each position we pick the erase covering the most useful bytes,
        // preferring the smallest operation among equals, until all bytes are covered.
        let end = start as u64 + length as u64;
        let mut pos = start as u64;
        while pos < end {
            log::trace!("Evaluating candidates, pos={} end={}", pos, end);
            // Current candidate, (useful bytes, erase size, base).
            let mut candidate: Option<(u64, EraseSize, u64)> = None;
            for erase in EraseSize::ALL.iter() {
                let size = erase.size() as u64;
                let base = pos - (pos % size);
                let bytes = u64::min(base + size, end) - pos;
                log::trace!("  Candidate 0x{:02X} ({} bytes): base={} bytes={}",
                            erase.opcode(), size, base, bytes);
                match candidate {
                    Some((best, _, _)) if bytes <= best => (),
                    _ => candidate = Some((bytes, *erase, base)),
                }
            }

            if let Some((bytes, erase, base)) = candidate {
                log::trace!("Candidate selected: {:?} at {}", erase, base);
                pos += bytes;
                plan.push((erase, base as u32));
            }
        }

        log::debug!("Erase plan: {:?}", plan);

        ErasePlan(plan)
    }

    /// First address touched by the plan.
    pub fn start(&self) -> Option<u32> {
        self.0.first().map(|(_, base)| *base)
    }

    /// One past the last address touched by the plan.
    pub fn end(&self) -> Option<u64> {
        self.0.last().map(|(erase, base)| *base as u64 + erase.size() as u64)
    }

    #[cfg(feature = "std")]
    pub fn total_size(&self) -> u64 {
        self.0.iter().map(|(erase, _)| erase.size() as u64).sum()
    }
}

#[test]
fn test_erase_plan() {
    use EraseSize::*;
    const K: u32 = 1024;
    // Use a single 4kB erase to erase an aligned 4kB sector.
    assert_eq!(ErasePlan::new(0, 4 * K).0, alloc::vec![(Sector4K, 0)]);
    // Use a single 64kB erase to erase an aligned 64kB block.
    assert_eq!(ErasePlan::new(0, 64 * K).0, alloc::vec![(Block64K, 0)]);
    // Use three 64kB erases to erase an aligned 192kB region.
    assert_eq!(
        ErasePlan::new(0, 192 * K).0,
        alloc::vec![(Block64K, 0), (Block64K, 64 * K), (Block64K, 128 * K)]
    );
    // Use 64kB followed by 32kB to erase an aligned 96kB region.
    assert_eq!(
        ErasePlan::new(0, 96 * K).0,
        alloc::vec![(Block64K, 0), (Block32K, 64 * K)]
    );
    // Use 64kB followed by 4kB to erase an aligned 66kB region.
    assert_eq!(
        ErasePlan::new(0, 66 * K).0,
        alloc::vec![(Block64K, 0), (Sector4K, 64 * K)]
    );
    // Use 4kB followed by 64kB to erase a misaligned 64kB region.
    assert_eq!(
        ErasePlan::new(62 * K, 64 * K).0,
        alloc::vec![(Sector4K, 60 * K), (Block64K, 64 * K)]
    );
    // Use a 4kB, 64kB, 4kB to erase a misaligned 68kB region.
    assert_eq!(
        ErasePlan::new(62 * K, 68 * K).0,
        alloc::vec![(Sector4K, 60 * K), (Block64K, 64 * K), (Sector4K, 128 * K)]
    );
    // A single byte still needs a whole sector.
    let plan = ErasePlan::new(5000, 1);
    assert_eq!(plan.0, alloc::vec![(Sector4K, 4 * K)]);
    assert_eq!(plan.start(), Some(4 * K));
    assert_eq!(plan.end(), Some(8 * 1024));
    assert!(ErasePlan::new(0, 0).0.is_empty());
}

#[test]
fn test_erase_align() {
    assert_eq!(EraseSize::Sector4K.align(0x1234), 0x1000);
    assert_eq!(EraseSize::Block32K.align(0x1_9000), 0x1_8000);
    assert_eq!(EraseSize::Block64K.align(0x1_FFFF), 0x1_0000);
}
