//! Simulated NOR flash on the far side of a `FlashAccess` provider.
//!
//! Records every chip-select frame so tests can check the exact command
//! sequence, and models the parts of the chip the driver depends on:
//! the memory array, write enable latch, BUSY countdown, status registers
//! and deep power-down.

use core::time::Duration;

use crate::{AnyhowResult, FlashAccess};

/// One chip-select transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub tx: Vec<u8>,
    pub rx: Vec<u8>,
}

impl Frame {
    pub fn opcode(&self) -> u8 {
        self.tx.first().copied().unwrap_or(0)
    }

    pub fn address(&self) -> u32 {
        u32::from_be_bytes([0, self.tx[1], self.tx[2], self.tx[3]])
    }

    /// Data bytes of a page program frame.
    pub fn payload(&self) -> &[u8] {
        &self.tx[4..]
    }
}

pub struct MockFlash {
    pub memory: Vec<u8>,
    pub jedec_id: [u8; 3],
    pub unique_id: [u8; 8],
    pub status: [u8; 3],
    pub wel: bool,
    pub powered_down: bool,

    /// Status reads reporting BUSY after each program or erase.
    pub busy_polls: usize,
    /// Status reads left before BUSY clears.
    pub busy_remaining: usize,
    /// Never clear BUSY once set.
    pub stuck_busy: bool,

    pub frames: Vec<Frame>,
    current: Option<Frame>,
    pub idle_deselects: usize,
    pub slept: Duration,
    pub locks: usize,
    pub unlocks: usize,
}

impl MockFlash {
    /// A 1Mbit Winbond W25X10 compatible part.
    pub fn new() -> Self {
        Self::with_id([0xEF, 0x40, 0x11], 128 * 1024)
    }

    pub fn with_id(jedec_id: [u8; 3], size: usize) -> Self {
        MockFlash {
            memory: vec![0xFF; size],
            jedec_id,
            unique_id: [0xD2, 0x63, 0x8C, 0x11, 0x53, 0x2A, 0x44, 0x2F],
            status: [0; 3],
            wel: false,
            powered_down: true,
            busy_polls: 2,
            busy_remaining: 0,
            stuck_busy: false,
            frames: Vec::new(),
            current: None,
            idle_deselects: 0,
            slept: Duration::from_secs(0),
            locks: 0,
            unlocks: 0,
        }
    }

    /// Opcodes of all frames so far, in order.
    pub fn opcodes(&self) -> Vec<u8> {
        self.frames.iter().map(|f| f.opcode()).collect()
    }

    /// All frames with the given opcode.
    pub fn frames_with(&self, opcode: u8) -> Vec<&Frame> {
        self.frames.iter().filter(|f| f.opcode() == opcode).collect()
    }

    fn status1(&self) -> u8 {
        let mut status = self.status[0] & !0b11;
        if self.busy_remaining > 0 || self.stuck_busy {
            status |= 0b01;
        }
        if self.wel {
            status |= 0b10;
        }
        status
    }

    fn start_busy(&mut self) {
        self.wel = false;
        self.busy_remaining = self.busy_polls;
    }

    fn next_byte(&mut self, frame: &Frame) -> u8 {
        let pos = frame.rx.len();
        if self.powered_down {
            return 0xFF;
        }
        match frame.opcode() {
            0x9F => self.jedec_id.get(pos).copied().unwrap_or(0xFF),
            0x4B => self.unique_id.get(pos).copied().unwrap_or(0xFF),
            0x05 => {
                let status = self.status1();
                if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                }
                status
            }
            0x35 => self.status[1],
            0x15 => self.status[2],
            0x0B => {
                let address = frame.address() as usize + pos;
                self.memory[address % self.memory.len()]
            }
            _ => 0xFF,
        }
    }

    /// Apply the command in a completed frame.
    fn execute(&mut self, frame: &Frame) {
        if self.powered_down {
            if frame.opcode() == 0xAB {
                self.powered_down = false;
            }
            return;
        }
        let protected = self.status[0] & 0b0001_1100 != 0;
        match frame.opcode() {
            0x06 => self.wel = true,
            0x04 => self.wel = false,
            0xB9 => self.powered_down = true,
            0x02 | 0x20 | 0x52 | 0xD8 | 0xC7 if self.wel && protected => self.start_busy(),
            0x02 if self.wel => {
                let address = frame.address() as usize;
                let page = address & !0xFF;
                for (i, byte) in frame.payload().iter().enumerate() {
                    // Page program wraps within the page rather than crossing it.
                    let offset = (address + i) & 0xFF;
                    self.memory[page + offset] &= byte;
                }
                self.start_busy();
            }
            op @ 0x20 | op @ 0x52 | op @ 0xD8 if self.wel => {
                let size = match op {
                    0x20 => 0x1000,
                    0x52 => 0x8000,
                    _ => 0x10000,
                };
                let base = frame.address() as usize & !(size - 1);
                for byte in &mut self.memory[base..base + size] {
                    *byte = 0xFF;
                }
                self.start_busy();
            }
            0xC7 if self.wel => {
                for byte in self.memory.iter_mut() {
                    *byte = 0xFF;
                }
                self.start_busy();
            }
            op @ 0x01 | op @ 0x31 | op @ 0x11 if self.wel => {
                let index = match op {
                    0x01 => 0,
                    0x31 => 1,
                    _ => 2,
                };
                self.status[index] = frame.tx[1];
                self.start_busy();
            }
            _ => (),
        }
    }
}

impl FlashAccess for MockFlash {
    fn select(&mut self) -> AnyhowResult<()> {
        if self.current.is_some() {
            anyhow::bail!("chip select asserted twice");
        }
        self.current = Some(Frame::default());
        Ok(())
    }

    fn deselect(&mut self) -> AnyhowResult<()> {
        match self.current.take() {
            Some(frame) => {
                self.execute(&frame);
                self.frames.push(frame);
            }
            None => self.idle_deselects += 1,
        }
        Ok(())
    }

    fn transmit(&mut self, data: &[u8]) -> AnyhowResult<()> {
        match self.current.as_mut() {
            Some(frame) => {
                frame.tx.extend_from_slice(data);
                Ok(())
            }
            None => anyhow::bail!("transmit without chip select"),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> AnyhowResult<()> {
        let mut frame = match self.current.take() {
            Some(frame) => frame,
            None => anyhow::bail!("receive without chip select"),
        };
        for byte in buf.iter_mut() {
            *byte = self.next_byte(&frame);
            frame.rx.push(*byte);
        }
        self.current = Some(frame);
        Ok(())
    }

    fn sleep(&mut self, dur: Duration) {
        self.slept += dur;
    }

    fn lock(&mut self) {
        self.locks += 1;
    }

    fn unlock(&mut self) {
        self.unlocks += 1;
    }
}
