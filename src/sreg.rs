//! Status register bit fields.
//!
//! Layouts follow the Winbond W25Q family; Macronix and Puya parts share
//! the register 1 layout, registers 2 and 3 vary more between vendors.

/// Status Register 1: BUSY, WEL, block protection and register protect.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusRegister1(pub u8);

impl StatusRegister1 {
    pub const BUSY: u8 = 1 << 0;
    pub const WEL: u8 = 1 << 1;
    const BP_SHIFT: u8 = 2;
    const BP_MASK: u8 = 0b111 << Self::BP_SHIFT;
    const TB: u8 = 1 << 5;
    const SEC: u8 = 1 << 6;
    const SRP: u8 = 1 << 7;

    /// Set while an internal program, erase or register write cycle runs.
    pub fn get_busy(&self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Write enable latch, cleared by the chip after every write cycle.
    pub fn get_wel(&self) -> bool {
        self.0 & Self::WEL != 0
    }

    /// Returns (BP0, BP1, BP2).
    pub fn get_block_protect(&self) -> (bool, bool, bool) {
        let bits = (self.0 & Self::BP_MASK) >> Self::BP_SHIFT;
        (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0)
    }

    pub fn set_block_protect(&mut self, bp0: bool, bp1: bool, bp2: bool) {
        let bits = bp0 as u8 | (bp1 as u8) << 1 | (bp2 as u8) << 2;
        self.0 = (self.0 & !Self::BP_MASK) | (bits << Self::BP_SHIFT);
    }

    /// Top/bottom protection select.
    pub fn get_tb(&self) -> bool {
        self.0 & Self::TB != 0
    }

    /// Sector/block protection granularity.
    pub fn get_sec(&self) -> bool {
        self.0 & Self::SEC != 0
    }

    pub fn get_srp(&self) -> bool {
        self.0 & Self::SRP != 0
    }
}

/// Status Register 2
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusRegister2(pub u8);

impl StatusRegister2 {
    const QE: u8 = 1 << 1;
    const CMP: u8 = 1 << 6;

    /// Quad enable.
    pub fn get_qe(&self) -> bool {
        self.0 & Self::QE != 0
    }

    /// Complement protect, inverts the meaning of the BP bits.
    pub fn get_cmp(&self) -> bool {
        self.0 & Self::CMP != 0
    }
}

/// Status Register 3
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusRegister3(pub u8);

impl StatusRegister3 {
    const WPS: u8 = 1 << 2;

    /// Write protect scheme select. Not present on every part.
    pub fn get_wps(&self) -> bool {
        self.0 & Self::WPS != 0
    }

    pub fn set_wps(&mut self, wps: bool) {
        self.0 = (self.0 & !Self::WPS) | if wps { Self::WPS } else { 0 };
    }
}

#[test]
fn test_status1_bits() {
    let mut s1 = StatusRegister1(0b0000_0011);
    assert!(s1.get_busy());
    assert!(s1.get_wel());
    assert_eq!(s1.get_block_protect(), (false, false, false));
    s1.set_block_protect(true, false, true);
    assert_eq!(s1.0, 0b0001_0111);
    assert_eq!(s1.get_block_protect(), (true, false, true));
    s1.set_block_protect(false, false, false);
    assert_eq!(s1.0, 0b0000_0011);
    assert!(!s1.get_tb() && !s1.get_sec() && !s1.get_srp());
}

#[test]
fn test_status2_status3_bits() {
    let s2 = StatusRegister2(0b0100_0010);
    assert!(s2.get_qe());
    assert!(s2.get_cmp());
    let mut s3 = StatusRegister3(0x60);
    assert!(!s3.get_wps());
    s3.set_wps(true);
    assert_eq!(s3.0, 0x64);
    s3.set_wps(false);
    assert_eq!(s3.0, 0x60);
}
