// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! spi-nor
//!
//! This crate drives SPI NOR flash memories through their command protocol:
//! identification, reading, page programming, erasing, status registers,
//! and deep power-down. Every program and erase is preceded by its own
//! write-enable and followed by a bounded busy-wait.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;
use alloc::vec::Vec;

use core::time::Duration;
#[cfg(feature = "std")]
use indicatif::{ProgressBar, ProgressStyle};

pub mod config;
pub mod erase_plan;
pub mod geometry;
pub mod id;
pub mod sreg;
mod split;

#[cfg(all(test, feature = "std"))]
mod mock;

pub use config::{Config, Timeouts};
pub use erase_plan::EraseSize;
pub use geometry::Geometry;
pub use id::{FlashId, JedecId, Manufacturer, Model};
pub use sreg::{StatusRegister1, StatusRegister2, StatusRegister3};

use config::{ADDRESS_SPACE, BUS_SETTLE_US, ERASED_VALUE, POLL_INTERVAL_US};
use erase_plan::ErasePlan;
use split::PageChunks;

#[cfg(feature = "std")]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Flash still busy after {timeout_ms} ms.")]
    Timeout { timeout_ms: u32 },
    #[error("Invalid parameters.")]
    InvalidParameters,
    #[error("No flash memory found, JEDEC ID read as 0x{jedec_id:06X}.")]
    NoMemoryFound { jedec_id: u32 },
    #[error("Unrecognised flash model, JEDEC ID 0x{jedec_id:06X}.")]
    UnknownDevice { jedec_id: u32 },
    #[error("Access of {length} bytes at 0x{address:08X} is out of range for memory.")]
    OutOfRange { address: u32, length: usize },
    #[error("Flash has not been initialised.")]
    NotInitialized,
    #[error("Region is not empty at 0x{address:08X}.")]
    RegionIsNotEmpty { address: u32 },
    #[error("Region is locked.")]
    IsLocked,
    #[error("Mismatch during flash readback verification.")]
    ReadbackError { address: u32, wrote: u8, read: u8 },

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}
#[cfg(not(feature = "std"))]
#[derive(Debug)]
pub enum Error<E> {
    Timeout { timeout_ms: u32 },
    InvalidParameters,
    NoMemoryFound { jedec_id: u32 },
    UnknownDevice { jedec_id: u32 },
    OutOfRange { address: u32, length: usize },
    NotInitialized,
    RegionIsNotEmpty { address: u32 },
    IsLocked,
    ReadbackError { address: u32, wrote: u8, read: u8 },

    Access(E),
}

#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, Error>;
#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, Error<()>>;

#[cfg(feature = "std")]
pub type AnyhowResult<T> = anyhow::Result<T>;
#[cfg(not(feature = "std"))]
pub type AnyhowResult<T> = Result<T>;

/// Trait for objects which provide access to the SPI bus a flash is attached to.
///
/// Bytes are only transmitted or received between `select()` and `deselect()`.
/// `lock()` and `unlock()` are optional; when implemented they are held around
/// every multi-step operation so one instance can be shared between threads.
pub trait FlashAccess {
    /// Drive chip-select active.
    fn select(&mut self) -> AnyhowResult<()>;

    /// Drive chip-select inactive.
    fn deselect(&mut self) -> AnyhowResult<()>;

    /// Clock out all bytes in `data`.
    fn transmit(&mut self, data: &[u8]) -> AnyhowResult<()>;

    /// Clock in `buf.len()` bytes.
    fn receive(&mut self, buf: &mut [u8]) -> AnyhowResult<()>;

    /// Block for at least `dur`.
    fn sleep(&mut self, dur: Duration);

    fn lock(&mut self) {}

    fn unlock(&mut self) {}
}

/// Power state of the flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerMode {
    Idle,
    DeepPowerDown,
}

/// SPI NOR Flash.
///
/// Wraps a borrowed `FlashAccess` provider and sequences the flash command
/// protocol on top of it. Call `init()` before any other operation; until
/// then every operation fails with `Error::NotInitialized` without touching
/// the bus.
pub struct Nor<'a, A: FlashAccess> {
    access: &'a mut A,
    config: Config,

    /// Identity and layout, both set only once initialisation succeeds.
    id: Option<FlashId>,
    geometry: Option<Geometry>,

    /// Last values read from or written to each status register.
    status1: StatusRegister1,
    status2: StatusRegister2,
    status3: StatusRegister3,

    /// Number of outstanding `enter_power_down()` requests.
    power_down_count: u32,
    power_mode: PowerMode,
}

impl<'a, A: FlashAccess> Nor<'a, A> {
    #[cfg(feature = "std")]
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    #[cfg(feature = "std")]
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    #[cfg(feature = "std")]
    fn progress_bar(length: u64, message: &str) -> ProgressBar {
        let style = ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL)
            .progress_chars(Self::DATA_PROGRESS_CHARS);
        let pb = ProgressBar::new(length).with_style(style);
        pb.set_message(message);
        pb
    }

    /// Create a new, uninitialised Nor instance using the given FlashAccess provider.
    pub fn new(access: &'a mut A) -> Self {
        Self::with_config(access, Config::default())
    }

    /// Create a new, uninitialised Nor instance with explicit timeouts and settings.
    pub fn with_config(access: &'a mut A, config: Config) -> Self {
        Nor {
            access,
            config,
            id: None,
            geometry: None,
            status1: StatusRegister1::default(),
            status2: StatusRegister2::default(),
            status3: StatusRegister3::default(),
            power_down_count: 0,
            power_mode: PowerMode::Idle,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.geometry.is_some()
    }

    /// Get the flash identity, if initialised.
    pub fn get_id(&self) -> Option<FlashId> {
        self.id
    }

    /// Get the flash memory layout, if initialised.
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    pub fn power_down_count(&self) -> u32 {
        self.power_down_count
    }

    pub fn cached_status1(&self) -> StatusRegister1 {
        self.status1
    }

    pub fn cached_status2(&self) -> StatusRegister2 {
        self.status2
    }

    pub fn cached_status3(&self) -> StatusRegister3 {
        self.status3
    }

    /// Identify the attached flash and work out its layout.
    ///
    /// The flash is first woken from deep power-down, then its JEDEC ID is
    /// read and decoded. Unknown models are rejected with `UnknownDevice`;
    /// use `init_without_id()` to drive them with a known block count.
    ///
    /// Calling this on an initialised instance does nothing.
    pub fn init(&mut self) -> Result<FlashId> {
        if let (Some(id), true) = (self.id, self.is_initialized()) {
            log::warn!("Flash is already initialised");
            return Ok(id);
        }

        self.wake_bus()?;

        let jedec_id = self.fetch_jedec_id()?;
        if jedec_id.is_bus_fault() {
            log::error!("No flash found, JEDEC ID read as 0x{:06X}", jedec_id.0);
            return Err(Error::NoMemoryFound { jedec_id: jedec_id.0 });
        }
        let model = jedec_id.model();
        if model == Model::Unknown {
            log::error!("Flash model with JEDEC ID 0x{:06X} not recognised", jedec_id.0);
            log::error!("Use `Nor::init_without_id()` to supply the block count directly.");
            return Err(Error::UnknownDevice { jedec_id: jedec_id.0 });
        }

        let geometry = match Geometry::from_block_count(jedec_id.block_count()) {
            Some(geometry) => geometry,
            None => return Err(Error::UnknownDevice { jedec_id: jedec_id.0 }),
        };
        let unique_id = self.fetch_unique_id()?;
        self.finish_init(FlashId::new(jedec_id, unique_id), geometry)
    }

    /// Initialise without relying on the JEDEC ID, for a flash with `block_count` 64kB blocks.
    ///
    /// The IDs are still read and stored, but are not checked. A block count
    /// of zero, or one whose capacity does not fit in 32 bits, is rejected with
    /// `InvalidParameters` before touching the bus.
    pub fn init_without_id(&mut self, block_count: u32) -> Result<FlashId> {
        let geometry = match Geometry::from_block_count(block_count) {
            Some(geometry) if block_count > 0 => geometry,
            _ => {
                log::error!("Invalid block count {} to initialise without ID", block_count);
                return Err(Error::InvalidParameters);
            }
        };
        if let (Some(id), true) = (self.id, self.is_initialized()) {
            log::warn!("Flash is already initialised");
            return Ok(id);
        }

        self.wake_bus()?;
        let jedec_id = self.fetch_jedec_id()?;
        let unique_id = self.fetch_unique_id()?;
        self.finish_init(FlashId::new(jedec_id, unique_id), geometry)
    }

    /// Put the flash into deep power-down.
    ///
    /// Requests nest: the command is only sent for the first request, and the
    /// flash stays powered down until `exit_power_down()` is called as many times.
    pub fn enter_power_down(&mut self) -> Result<()> {
        self.initialized()?;
        if self.power_down_count == 0 {
            log::debug!("Entering deep power-down");
            self.locked(|nor| nor.command(Command::Powerdown))?;
            self.power_mode = PowerMode::DeepPowerDown;
        }
        self.power_down_count = self.power_down_count.saturating_add(1);
        Ok(())
    }

    /// Release one deep power-down request, waking the flash when none remain.
    pub fn exit_power_down(&mut self) -> Result<()> {
        self.initialized()?;
        match self.power_down_count {
            0 => (),
            1 => {
                log::debug!("Exiting deep power-down");
                self.locked(|nor| nor.command(Command::ReleasePowerdown))?;
                self.power_down_count = 0;
                self.power_mode = PowerMode::Idle;
            }
            _ => self.power_down_count -= 1,
        }
        Ok(())
    }

    /// Erase entire flash chip.
    ///
    /// Returns only after the erase operation is complete.
    pub fn erase_chip(&mut self) -> Result<()> {
        self.initialized()?;
        self.chip_erase(|| {})
    }

    /// Erase entire flash chip, drawing a spinner to the terminal.
    #[cfg(feature = "std")]
    pub fn erase_chip_progress(&mut self) -> Result<()> {
        self.initialized()?;
        let pb = ProgressBar::new_spinner();
        pb.set_message("Erasing");
        let mut polls = 0u32;
        let result = self.chip_erase(|| {
            // Redraw every 100ms of polling.
            if polls % 1000 == 0 {
                pb.tick();
            }
            polls = polls.wrapping_add(1);
        });
        pb.finish();
        result
    }

    /// Erase the `size` unit containing `address`.
    ///
    /// Addresses are rounded down to the start of their unit.
    pub fn erase(&mut self, address: u32, size: EraseSize) -> Result<()> {
        let geometry = self.initialized()?;
        let base = size.align(address);
        if base != address {
            log::warn!("Erase address 0x{:08X} not aligned to {} bytes, erasing from 0x{:08X}",
                       address, size.size(), base);
        }
        Self::check_range(&geometry, base, size.size() as usize)?;
        self.locked(|nor| nor.erase_unit(size, base))
    }

    /// Erase 4kB sector number `sector`.
    pub fn erase_sector(&mut self, sector: u32) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(sector, geometry.sector_size, 0)?;
        self.erase(address, EraseSize::Sector4K)
    }

    /// Erase 64kB block number `block`.
    pub fn erase_block(&mut self, block: u32) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(block, geometry.block_size, 0)?;
        self.erase(address, EraseSize::Block64K)
    }

    /// Erase every unit overlapping `length` bytes from `address`,
    /// using the largest erase commands which fit.
    pub fn erase_range(&mut self, address: u32, length: usize) -> Result<()> {
        let geometry = self.initialized()?;
        Self::check_length(length)?;
        Self::check_range(&geometry, address, length)?;
        let plan = ErasePlan::new(address, length as u32);
        self.locked(|nor| nor.run_erase_plan(&plan, |_| {}))
    }

    /// Sector containing page `page`.
    pub fn page_to_sector(&self, page: u32) -> Result<u32> {
        Ok(self.initialized()?.page_to_sector(page))
    }

    pub fn page_to_block(&self, page: u32) -> Result<u32> {
        Ok(self.initialized()?.page_to_block(page))
    }

    pub fn sector_to_block(&self, sector: u32) -> Result<u32> {
        Ok(self.initialized()?.sector_to_block(sector))
    }

    pub fn sector_to_page(&self, sector: u32) -> Result<u32> {
        Ok(self.initialized()?.sector_to_page(sector))
    }

    pub fn block_to_page(&self, block: u32) -> Result<u32> {
        Ok(self.initialized()?.block_to_page(block))
    }

    pub fn block_to_sector(&self, block: u32) -> Result<u32> {
        Ok(self.initialized()?.block_to_sector(block))
    }

    /// Check `length` bytes from `address` are all erased.
    ///
    /// The region is read in probes of `Config::empty_check_len` bytes and the
    /// check stops at the first probe containing a programmed byte, returning
    /// `RegionIsNotEmpty` with that byte's address.
    pub fn verify_empty(&mut self, address: u32, length: usize) -> Result<()> {
        let geometry = self.initialized()?;
        Self::check_length(length)?;
        Self::check_range(&geometry, address, length)?;
        log::debug!("Checking {} bytes at 0x{:08X} are empty", length, address);

        let mut probe = alloc::vec![0u8; usize::max(1, self.config.empty_check_len)];
        let mut pos = address;
        let mut remaining = length;
        while remaining > 0 {
            let n = usize::min(remaining, probe.len());
            let buf = &mut probe[..n];
            self.locked(|nor| nor.fast_read(pos, buf))?;
            if let Some(idx) = buf.iter().position(|b| *b != ERASED_VALUE) {
                let address = pos + idx as u32;
                log::warn!("Region not empty at 0x{:08X}", address);
                return Err(Error::RegionIsNotEmpty { address });
            }
            pos += buf.len() as u32;
            remaining -= buf.len();
        }
        log::debug!("Region is empty");
        Ok(())
    }

    pub fn verify_empty_page(&mut self, page: u32, offset: u32, length: usize) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(page, geometry.page_size, offset)?;
        self.verify_empty(address, length)
    }

    pub fn verify_empty_sector(&mut self, sector: u32, offset: u32, length: usize) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(sector, geometry.sector_size, offset)?;
        self.verify_empty(address, length)
    }

    pub fn verify_empty_block(&mut self, block: u32, offset: u32, length: usize) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(block, geometry.block_size, offset)?;
        self.verify_empty(address, length)
    }

    /// Read `buf.len()` bytes from the flash, starting at `address`.
    ///
    /// This method uses the FastRead instruction, after waiting for any
    /// program or erase still in progress.
    pub fn read_into(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let geometry = self.initialized()?;
        Self::check_length(buf.len())?;
        Self::check_range(&geometry, address, buf.len())?;
        log::debug!("Reading {} bytes from 0x{:08X}", buf.len(), address);
        self.locked(|nor| nor.fast_read(address, buf))
    }

    /// Read `length` bytes of data from the flash, starting at `address`.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut data = alloc::vec![0u8; length];
        self.read_into(address, &mut data)?;
        Ok(data)
    }

    pub fn read_byte(&mut self, address: u32) -> Result<u8> {
        let mut data = [0u8];
        self.read_into(address, &mut data)?;
        Ok(data[0])
    }

    /// Read into `buf` starting `offset` bytes into page `page`.
    ///
    /// Offsets larger than a page continue into the following pages.
    pub fn read_page(&mut self, page: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(page, geometry.page_size, offset)?;
        self.read_into(address, buf)
    }

    pub fn read_sector(&mut self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(sector, geometry.sector_size, offset)?;
        self.read_into(address, buf)
    }

    pub fn read_block(&mut self, block: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(block, geometry.block_size, offset)?;
        self.read_into(address, buf)
    }

    /// Read `length` bytes from `address` in chunks of at least 1kB,
    /// calling `cb` with the running byte count before the first chunk and
    /// after each one.
    pub fn read_cb<F: Fn(usize)>(&mut self, address: u32, length: usize, cb: F)
        -> Result<Vec<u8>>
    {
        let geometry = self.initialized()?;
        Self::check_length(length)?;
        Self::check_range(&geometry, address, length)?;
        let chunk_size = usize::max(1024, length / 128);
        let mut data = alloc::vec![0u8; length];
        cb(0);
        let mut done = 0;
        for chunk in data.chunks_mut(chunk_size) {
            self.read_into(address + done as u32, chunk)?;
            done += chunk.len();
            cb(done);
        }
        Ok(data)
    }

    /// Read `length` bytes of data from the flash, starting at `address`,
    /// rendering a progress bar to the terminal during the read.
    #[cfg(feature = "std")]
    pub fn read_progress(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let pb = Self::progress_bar(length as u64, "Reading");
        let result = self.read_cb(address, length, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Write `data` to `address`, split into one page program per page touched.
    ///
    /// Note that this does *not* erase the flash beforehand; use `program()` for a
    /// higher-level erase-program-verify interface.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.program_data_cb(address, data, |_| {})
    }

    pub fn write_byte(&mut self, address: u32, value: u8) -> Result<()> {
        self.write(address, &[value])
    }

    /// Write `data` starting `offset` bytes into page `page`.
    ///
    /// Offsets larger than a page continue into the following pages.
    pub fn write_page(&mut self, page: u32, offset: u32, data: &[u8]) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(page, geometry.page_size, offset)?;
        self.write(address, data)
    }

    pub fn write_sector(&mut self, sector: u32, offset: u32, data: &[u8]) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(sector, geometry.sector_size, offset)?;
        self.write(address, data)
    }

    pub fn write_block(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<()> {
        let geometry = self.initialized()?;
        let address = Self::unit_address(block, geometry.block_size, offset)?;
        self.write(address, data)
    }

    /// Write `data` to `address`, and draw a progress bar to the terminal.
    #[cfg(feature = "std")]
    pub fn program_data_progress(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let pb = Self::progress_bar(data.len() as u64, "Writing");
        let result = self.program_data_cb(address, data, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Write `data` to `address`, split into one page program per page touched.
    ///
    /// Each page program sets the write enable latch and waits for the
    /// program to complete; `cb` is then called with the number of bytes
    /// written so far. The lock is held for the whole sequence.
    pub fn program_data_cb<F: Fn(usize)>(&mut self, address: u32, data: &[u8], cb: F)
        -> Result<()>
    {
        let geometry = self.initialized()?;
        Self::check_length(data.len())?;
        Self::check_range(&geometry, address, data.len())?;
        log::debug!("Writing {} bytes to 0x{:08X}", data.len(), address);

        self.locked(|nor| {
            let mut total_bytes = 0;
            cb(total_bytes);
            for (page_address, page_data) in PageChunks::new(address, data, geometry.page_size) {
                nor.page_program(page_address, page_data)?;
                total_bytes += page_data.len();
                cb(total_bytes);
            }
            // Only return once the last program cycle has finished.
            nor.wait_busy(nor.config.timeouts.page_program_ms)?;
            Ok(())
        })
    }

    /// Erase, program and optionally verify `data` at `address`.
    ///
    /// The smallest set of sectors and blocks covering `data` is erased
    /// first. Bytes inside those units but outside `data` are saved
    /// beforehand and programmed back. With `verify`, everything written is
    /// read back and the first difference is reported as `ReadbackError`.
    pub fn program(&mut self, address: u32, data: &[u8], verify: bool) -> Result<()> {
        let (plan, start, full_data) = self.prepare_program(address, data)?;
        self.locked(|nor| nor.run_erase_plan(&plan, |_| {}))?;
        self.write(start, &full_data)?;
        if verify {
            let programmed = self.read(start, full_data.len())?;
            self.verify_readback(start, &full_data, &programmed)?;
        }
        Ok(())
    }

    /// Program the flash with `data` starting at `address`.
    ///
    /// As `program()`, with terminal progress bars for each phase.
    #[cfg(feature = "std")]
    pub fn program_progress(&mut self, address: u32, data: &[u8], verify: bool) -> Result<()> {
        let (plan, start, full_data) = self.prepare_program(address, data)?;
        self.run_erase_plan_progress(&plan)?;
        self.program_data_progress(start, &full_data)?;
        if verify {
            let programmed = self.read_progress(start, full_data.len())?;
            self.verify_readback(start, &full_data, &programmed)?;
        }
        Ok(())
    }

    /// Read status register 1, updating its cached value.
    pub fn read_status1(&mut self) -> Result<StatusRegister1> {
        self.initialized()?;
        self.poll_status1()
    }

    /// Read status register 2, updating its cached value.
    pub fn read_status2(&mut self) -> Result<StatusRegister2> {
        self.initialized()?;
        let mut data = [0u8];
        self.exchange(Command::ReadStatusRegister2, &[], &mut data)?;
        self.status2 = StatusRegister2(data[0]);
        Ok(self.status2)
    }

    /// Read status register 3, updating its cached value.
    pub fn read_status3(&mut self) -> Result<StatusRegister3> {
        self.initialized()?;
        let mut data = [0u8];
        self.exchange(Command::ReadStatusRegister3, &[], &mut data)?;
        self.status3 = StatusRegister3(data[0]);
        Ok(self.status3)
    }

    /// Write status register 1.
    ///
    /// This method sets the write enable latch itself and
    /// returns once the register write cycle has completed.
    pub fn write_status1(&mut self, status1: StatusRegister1) -> Result<()> {
        self.initialized()?;
        self.write_status(Command::WriteStatusRegister1, status1.0)?;
        self.status1 = status1;
        Ok(())
    }

    /// Write status register 2.
    pub fn write_status2(&mut self, status2: StatusRegister2) -> Result<()> {
        self.initialized()?;
        self.write_status(Command::WriteStatusRegister2, status2.0)?;
        self.status2 = status2;
        Ok(())
    }

    /// Write status register 3.
    pub fn write_status3(&mut self, status3: StatusRegister3) -> Result<()> {
        self.initialized()?;
        self.write_status(Command::WriteStatusRegister3, status3.0)?;
        self.status3 = status3;
        Ok(())
    }

    /// Check if the device is currently busy performing an operation.
    pub fn is_busy(&mut self) -> Result<bool> {
        Ok(self.read_status1()?.get_busy())
    }

    /// Poll until the BUSY bit clears, for at most `timeout_ms` milliseconds.
    ///
    /// Returns the unused part of the budget in milliseconds.
    pub fn wait_while_busy(&mut self, timeout_ms: u32) -> Result<u32> {
        self.initialized()?;
        self.locked(|nor| nor.wait_busy(timeout_ms))
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    pub fn write_enable(&mut self) -> Result<()> {
        self.initialized()?;
        self.write_enable_unchecked()
    }

    /// Send the WriteDisable command, clearing the WEL in the status register.
    pub fn write_disable(&mut self) -> Result<()> {
        self.initialized()?;
        self.command(Command::WriteDisable)
    }

    /// Check if any block protect bits are set in status register 1.
    pub fn is_protected(&mut self) -> Result<bool> {
        let bp = self.read_status1()?.get_block_protect();
        log::debug!("Block protect (BP0, BP1, BP2) = {:?}", bp);
        Ok(bp != (false, false, false))
    }

    /// Clear any block protect bits that are set in status register 1.
    pub fn unprotect(&mut self) -> Result<()> {
        let mut status1 = self.read_status1()?;
        if status1.get_block_protect() == (false, false, false) {
            return Ok(());
        }
        log::debug!("Clearing block protect bits");
        status1.set_block_protect(false, false, false);
        self.write_status1(status1)
    }

    /// Returns the layout if initialised, or `NotInitialized`.
    fn initialized(&self) -> Result<Geometry> {
        self.geometry.ok_or(Error::NotInitialized)
    }

    /// Run `f` while holding the access provider's lock.
    fn locked<T, F>(&mut self, f: F) -> Result<T>
        where F: FnOnce(&mut Self) -> Result<T>
    {
        self.access.lock();
        let result = f(self);
        self.access.unlock();
        result
    }

    /// Force the bus into a known state and release any deep power-down.
    fn wake_bus(&mut self) -> Result<()> {
        self.access.deselect()?;
        self.access.sleep(Duration::from_micros(BUS_SETTLE_US));
        self.power_down_count = 0;
        self.power_mode = PowerMode::Idle;
        log::debug!("Sending Release Powerdown command");
        self.command(Command::ReleasePowerdown)
    }

    fn fetch_jedec_id(&mut self) -> Result<JedecId> {
        let mut data = [0u8; 3];
        self.exchange(Command::ReadJEDECID, &[], &mut data)?;
        Ok(JedecId::from_bytes(data))
    }

    fn fetch_unique_id(&mut self) -> Result<u64> {
        let mut data = [0u8; 8];
        self.exchange(Command::ReadUniqueID, &[0, 0, 0, 0], &mut data)?;
        Ok(u64::from_be_bytes(data))
    }

    fn finish_init(&mut self, id: FlashId, geometry: Geometry) -> Result<FlashId> {
        self.poll_status1()?;
        let mut data = [0u8];
        self.exchange(Command::ReadStatusRegister2, &[], &mut data)?;
        self.status2 = StatusRegister2(data[0]);
        self.exchange(Command::ReadStatusRegister3, &[], &mut data)?;
        self.status3 = StatusRegister3(data[0]);

        self.id = Some(id);
        self.geometry = Some(geometry);

        log::info!("JEDEC ID:     0x{:06X}", id.jedec_id.0);
        log::info!("Unique ID:    0x{:016X}", id.unique_id);
        log::info!("Model:        {:?} ({:?})", id.model, id.manufacturer);
        log::info!("Page size:    {} bytes, {} pages", geometry.page_size, geometry.page_count);
        log::info!("Sector size:  {} bytes, {} sectors",
                   geometry.sector_size, geometry.sector_count);
        log::info!("Block size:   {} bytes, {} blocks", geometry.block_size, geometry.block_count);
        log::info!("Capacity:     {} KB", geometry.total_size / 1024);
        Ok(id)
    }

    fn write_enable_unchecked(&mut self) -> Result<()> {
        self.command(Command::WriteEnable)
    }

    fn poll_status1(&mut self) -> Result<StatusRegister1> {
        let mut data = [0u8];
        self.exchange(Command::ReadStatusRegister1, &[], &mut data)?;
        self.status1 = StatusRegister1(data[0]);
        Ok(self.status1)
    }

    fn write_status(&mut self, command: Command, value: u8) -> Result<()> {
        log::debug!("Writing {:?} = 0x{:02X}", command, value);
        let timeout_ms = self.config.timeouts.page_program_ms;
        self.locked(|nor| {
            nor.write_enable_unchecked()?;
            nor.write_command(command, &[value])?;
            nor.wait_busy(timeout_ms)?;
            Ok(())
        })
    }

    /// Send ChipErase and wait for it with the chip erase budget, calling
    /// `on_poll` after every status poll.
    fn chip_erase<F: FnMut()>(&mut self, on_poll: F) -> Result<()> {
        log::debug!("Starting chip erase");
        let timeout_ms = self.config.timeouts.chip_erase_ms;
        let remaining = self.locked(|nor| {
            nor.write_enable_unchecked()?;
            nor.command(Command::ChipErase)?;
            nor.wait_busy_cb(timeout_ms, on_poll)
        })?;
        log::debug!("Chip erase done in {} ms", timeout_ms - remaining);
        Ok(())
    }

    fn wait_busy(&mut self, timeout_ms: u32) -> Result<u32> {
        self.wait_busy_cb(timeout_ms, || {})
    }

    /// Poll status register 1 within a single transaction until BUSY clears.
    ///
    /// The budget is spent in `POLL_INTERVAL_US` steps, and `on_poll` is called
    /// after each one. Fails with `Timeout` if the budget runs out while BUSY
    /// is still set; the command that started the write cycle is not retried.
    /// Returns the remaining budget in ms.
    fn wait_busy_cb<F: FnMut()>(&mut self, timeout_ms: u32, mut on_poll: F) -> Result<u32> {
        let mut budget_us = timeout_ms.saturating_mul(1000);
        let opcode: u8 = Command::ReadStatusRegister1.into();
        let status = self.frame(|access| {
            let mut status = [0u8];
            access.transmit(&[opcode])?;
            // Discard the first byte clocked out after the opcode.
            access.receive(&mut status)?;
            loop {
                access.receive(&mut status)?;
                access.sleep(Duration::from_micros(POLL_INTERVAL_US as u64));
                budget_us = budget_us.saturating_sub(POLL_INTERVAL_US);
                on_poll();
                if status[0] & StatusRegister1::BUSY == 0 || budget_us == 0 {
                    break;
                }
            }
            Ok(status[0])
        })?;
        self.status1 = StatusRegister1(status);

        if self.status1.get_busy() {
            log::error!("Flash still busy after {} ms", timeout_ms);
            return Err(Error::Timeout { timeout_ms });
        }
        let remaining = budget_us / 1000;
        log::trace!("Flash ready with {} of {} ms remaining", remaining, timeout_ms);
        Ok(remaining)
    }

    fn fast_read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.wait_busy(self.config.timeouts.page_program_ms)?;
        let addr = make_address(address);
        // Dummy byte after address.
        self.exchange(Command::FastRead, &[addr[0], addr[1], addr[2], 0], buf)
    }

    /// Program up to one page of data, which must not cross a page boundary.
    ///
    /// Sets the write enable latch first and waits for programming to complete.
    fn page_program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let addr = make_address(address);
        let header = [Command::PageProgram.into(), addr[0], addr[1], addr[2]];
        self.write_enable_unchecked()?;
        log::trace!("SPI page program: write {:02X?} + {} bytes", &header, data.len());
        self.frame(|access| {
            access.transmit(&header)?;
            access.transmit(data)
        })?;
        self.wait_busy(self.config.timeouts.page_program_ms)?;
        Ok(())
    }

    fn erase_unit(&mut self, size: EraseSize, base: u32) -> Result<()> {
        let timeout_ms = size.timeout_ms(&self.config.timeouts);
        log::debug!("Erasing {} bytes at 0x{:08X}", size.size(), base);
        self.write_enable_unchecked()?;
        self.write_command(size.opcode(), &make_address(base))?;
        let remaining = self.wait_busy(timeout_ms)?;
        log::debug!("Erase done in {} ms", timeout_ms - remaining);
        Ok(())
    }

    /// Execute the sequence of erase operations from `plan`.
    ///
    /// `cb` is called with the number of bytes erased so far.
    fn run_erase_plan<F: Fn(u64)>(&mut self, plan: &ErasePlan, cb: F) -> Result<()> {
        let mut total_erased = 0;
        cb(total_erased);
        for (size, base) in plan.0.iter() {
            log::trace!("Executing erase plan: Erase 0x{:02X} ({} bytes) from 0x{:08X}",
                        size.opcode(), size.size(), base);
            self.erase_unit(*size, *base)?;
            total_erased += size.size() as u64;
            cb(total_erased);
        }
        Ok(())
    }

    /// Execute the sequence of erase operations from `plan`, and draw a progress bar
    /// to the terminal.
    #[cfg(feature = "std")]
    fn run_erase_plan_progress(&mut self, plan: &ErasePlan) -> Result<()> {
        let pb = Self::progress_bar(plan.total_size(), "Erasing");
        let result = self.locked(|nor| nor.run_erase_plan(plan, |n| pb.set_position(n)));
        pb.finish();
        result
    }

    /// Validate a `program()` request and build the data to write after erasing:
    /// `data` plus any existing bytes before and after it that the erase plan clobbers.
    ///
    /// Returns the erase plan, the address to start writing from and the data to write.
    fn prepare_program(&mut self, address: u32, data: &[u8])
        -> Result<(ErasePlan, u32, Vec<u8>)>
    {
        let geometry = self.initialized()?;
        Self::check_length(data.len())?;
        Self::check_range(&geometry, address, data.len())?;
        let plan = ErasePlan::new(address, data.len() as u32);
        let (start, end) = match (plan.start(), plan.end()) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(Error::InvalidParameters),
        };

        let mut full_data = Vec::with_capacity((end - start as u64) as usize);
        if address > start {
            log::debug!("Reading erase preamble: base={} len={}", start, address - start);
            full_data.extend(self.read(start, (address - start) as usize)?);
        }
        full_data.extend_from_slice(data);

        let data_end = address as u64 + data.len() as u64;
        if end > data_end {
            let len = (end - data_end) as usize;
            log::debug!("Reading erase postamble: addr={} len={}", data_end, len);
            let postamble = self.read(data_end as u32, len)?;
            // If all the postamble is already erased, there's no point reprogramming it.
            if postamble.iter().any(|x| *x != ERASED_VALUE) {
                full_data.extend(postamble);
            }
        }
        Ok((plan, start, full_data))
    }

    /// Compare `expected` against what was read back from `address`.
    fn verify_readback(&mut self, address: u32, expected: &[u8], read: &[u8]) -> Result<()> {
        let idx = match expected.iter().zip(read).position(|(a, b)| a != b) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let (wrote, read) = (expected[idx], read[idx]);
        let address = address + idx as u32;
        log::error!("Readback mismatch at 0x{:08X}: wrote 0x{:02X}, read 0x{:02X}",
                    address, wrote, read);
        if self.is_protected()? {
            log::error!("Block protect bits are set, call `unprotect()` before programming.");
        }
        Err(Error::ReadbackError { address, wrote, read })
    }

    /// Assert CS, run `f` against the bus, then de-assert CS even if `f` failed.
    fn frame<T, F>(&mut self, f: F) -> Result<T>
        where F: FnOnce(&mut A) -> AnyhowResult<T>
    {
        self.access.select()?;
        let result = f(&mut *self.access);
        let deselect = self.access.deselect();
        let value = result?;
        deselect?;
        Ok(value)
    }

    /// Writes `command` and `data` to the flash memory, then reads `rx.len()` bytes of response.
    fn exchange<C: Into<u8>>(&mut self, command: C, data: &[u8], rx: &mut [u8]) -> Result<()> {
        let mut tx = alloc::vec![command.into()];
        tx.extend_from_slice(data);
        log::trace!("SPI exchange: write {:02X?}, read {} bytes", &tx, rx.len());
        self.frame(|access| {
            access.transmit(&tx)?;
            access.receive(rx)
        })?;
        log::trace!("SPI exchange: read {:02X?}", rx);
        Ok(())
    }

    /// Writes `command` and `data` to the flash memory, without reading the response.
    fn write_command<C: Into<u8>>(&mut self, command: C, data: &[u8]) -> Result<()> {
        let mut tx = alloc::vec![command.into()];
        tx.extend_from_slice(data);
        log::trace!("SPI write: {:02X?}", &tx);
        self.frame(|access| access.transmit(&tx))
    }

    /// Convenience method for issuing a single command and not caring about the returned data
    fn command<C: Into<u8>>(&mut self, command: C) -> Result<()> {
        self.write_command(command, &[])
    }

    fn check_length(length: usize) -> Result<()> {
        if length == 0 {
            log::error!("Zero-length access requested");
            Err(Error::InvalidParameters)
        } else {
            Ok(())
        }
    }

    /// Checks `length` bytes from `address` lie within the flash memory
    /// and within reach of a 3-byte address.
    fn check_range(geometry: &Geometry, address: u32, length: usize) -> Result<()> {
        log::trace!("Checking address={:08X} length={}", address, length);
        let end = address as u64 + length as u64;
        if geometry.contains(address, length) && end <= ADDRESS_SPACE {
            Ok(())
        } else {
            log::error!("Operation would exceed flash capacity");
            Err(Error::OutOfRange { address, length })
        }
    }

    fn unit_address(index: u32, unit_size: u32, offset: u32) -> Result<u32> {
        Geometry::unit_address(index, unit_size, offset)
            .ok_or(Error::OutOfRange { address: u32::MAX, length: 0 })
    }
}

/// Big-endian 3-byte address.
fn make_address(addr: u32) -> [u8; 3] {
    let bytes = addr.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

/// Standard SPI NOR flash command opcodes.
///
/// These are taken from the Winbond W25Q series datasheets, but are
/// shared by the other supported families. Only single I/O commands are listed.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
pub(crate) enum Command {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    PageProgram = 0x02,
    FastRead = 0x0B,
    ReadStatusRegister1 = 0x05,
    ReadStatusRegister2 = 0x35,
    ReadStatusRegister3 = 0x15,
    WriteStatusRegister1 = 0x01,
    WriteStatusRegister2 = 0x31,
    WriteStatusRegister3 = 0x11,

    ReadJEDECID = 0x9F,
    ReadUniqueID = 0x4B,
    Powerdown = 0xB9,
    ReleasePowerdown = 0xAB,

    // Erase instructions.
    SectorErase = 0x20,
    BlockErase32K = 0x52,
    BlockErase64K = 0xD8,
    ChipErase = 0xC7,
}
