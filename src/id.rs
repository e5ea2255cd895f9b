use core::convert::TryFrom;

/// Raw 24-bit JEDEC ID as returned by the 0x9F command.
///
/// The three bytes are stored in the order they arrive on the bus, so the
/// manufacturer ID occupies bits 0-7, the memory type bits 8-15 and the
/// capacity code bits 16-23.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JedecId(pub u32);

impl JedecId {
    /// Capacity code of the smallest (1Mbit) part in the supported families.
    const DENSITY_BASE: u8 = 0x11;

    pub fn from_bytes(data: [u8; 3]) -> Self {
        JedecId(u32::from_le_bytes([data[0], data[1], data[2], 0]))
    }

    pub fn manufacturer_id(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn memory_type(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub fn capacity(&self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    /// True if the ID reads as all-0s or all-1s, as happens with nothing on the bus.
    pub fn is_bus_fault(&self) -> bool {
        self.0 == 0x00_0000 || self.0 == 0xFF_FFFF
    }

    pub fn manufacturer(&self) -> Manufacturer {
        Manufacturer::try_from(self.manufacturer_id()).unwrap_or(Manufacturer::Unknown)
    }

    /// Decode the part family from the manufacturer-specific ID bytes.
    pub fn model(&self) -> Model {
        let manufacturer = self.manufacturer();
        let code = match manufacturer {
            Manufacturer::Macronix => self.capacity() as u16,
            Manufacturer::Winbond => ((self.0 >> 8) & 0xFFFF) as u16,
            _ => return Model::Unknown,
        };
        match Model::try_from(code) {
            Ok(model) if model.manufacturer() == manufacturer => model,
            _ => Model::Unknown,
        }
    }

    /// Number of 64kB blocks implied by the capacity code.
    ///
    /// Returns 0 when the manufacturer's density scheme is not known,
    /// in which case the block count must be supplied by the caller.
    pub fn block_count(&self) -> u32 {
        match self.manufacturer() {
            Manufacturer::Macronix | Manufacturer::Winbond | Manufacturer::Puya => (),
            _ => return 0,
        }
        let index = match self.capacity().checked_sub(Self::DENSITY_BASE) {
            Some(index) => index,
            None => {
                log::warn!("Capacity code 0x{:02X} below known density range", self.capacity());
                return 0;
            }
        };

        // 1Mbit parts hold two blocks; each step up the code doubles that.
        let mut blocks: u32 = 2;
        for _ in 0..index {
            blocks = match blocks.checked_mul(2) {
                Some(blocks) => blocks,
                None => return 0,
            };
        }
        blocks
    }
}

/// Manufacturers with a known ID layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Manufacturer {
    Macronix = 0xC2,
    Adesto = 0x1F,
    Winbond = 0xEF,
    Puya = 0x85,
    Microchip = 0xBF,
    Xmc = 0x20,
    Unknown = 0xFF,
}

/// Recognised part families.
///
/// Macronix parts are identified by their capacity code alone,
/// Winbond parts by the capacity code and memory type together.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u16)]
pub enum Model {
    Mx25x10 = 0x11,
    Mx25x20 = 0x12,
    Mx25x40 = 0x13,
    Mx25x80 = 0x14,
    Mx25x16 = 0x15,
    Mx25x32 = 0x16,
    Mx25x64 = 0x17,
    Mx25x128 = 0x18,
    Mx25x256 = 0x19,

    W25x10 = 0x1140,
    W25x20 = 0x1240,
    W25x40 = 0x1340,
    W25x80 = 0x1440,
    W25x16 = 0x1540,
    W25x32 = 0x1640,
    W25x64 = 0x1740,
    W25x128 = 0x1840,
    W25x256 = 0x1940,

    Unknown = 0xFFFF,
}

impl Model {
    pub fn manufacturer(&self) -> Manufacturer {
        match *self as u16 {
            0x0000..=0x00FF => Manufacturer::Macronix,
            0xFFFF => Manufacturer::Unknown,
            _ => Manufacturer::Winbond,
        }
    }
}

/// Identity of an attached flash memory.
///
/// The JEDEC ID is read using the 0x9F command and the
/// 64-bit unique ID using the 0x4B command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashId {
    pub jedec_id: JedecId,
    pub unique_id: u64,
    pub manufacturer: Manufacturer,
    pub model: Model,
}

impl FlashId {
    pub fn new(jedec_id: JedecId, unique_id: u64) -> Self {
        FlashId {
            jedec_id,
            unique_id,
            manufacturer: jedec_id.manufacturer(),
            model: jedec_id.model(),
        }
    }

    /// Look up a manufacturer name from the JEDEC ID.
    #[cfg(feature = "std")]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let id = self.jedec_id.manufacturer_id() & 0x7F;
        match jep106::JEP106Code::new(0, id).get() {
            // Winbond acquired NEXCOM and so the ID 0xEF is commonly used for Winbond memory.
            Some(mfn) if mfn == "NEXCOM" => Some("Winbond/NEXCOM"),
            Some(mfn) => Some(mfn),
            None => None,
        }
    }
}

#[cfg(feature = "std")]
impl std::fmt::Display for FlashId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        let unique_id = match self.unique_id {
            0x0000_0000_0000_0000 | 0xFFFF_FFFF_FFFF_FFFF => "".to_string(),
            id => format!(", Unique ID: {:016X}", id),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Model {:?}, JEDEC ID 0x{:06X}{}",
               self.jedec_id.manufacturer_id(), mfn, self.model,
               self.jedec_id.0, unique_id)
    }
}

#[test]
fn test_decode_winbond() {
    let id = JedecId::from_bytes([0xEF, 0x40, 0x17]);
    assert_eq!(id.0, 0x17_40EF);
    assert_eq!(id.manufacturer(), Manufacturer::Winbond);
    assert_eq!(id.model(), Model::W25x64);
    assert_eq!(id.block_count(), 128);
}

#[test]
fn test_decode_macronix() {
    let id = JedecId::from_bytes([0xC2, 0x20, 0x16]);
    assert_eq!(id.manufacturer(), Manufacturer::Macronix);
    assert_eq!(id.model(), Model::Mx25x32);
    assert_eq!(id.block_count(), 64);
}

#[test]
fn test_decode_unknown() {
    // Winbond DTR parts use memory type 0x70, which is not in the model table.
    let id = JedecId::from_bytes([0xEF, 0x70, 0x18]);
    assert_eq!(id.model(), Model::Unknown);
    assert_eq!(id.block_count(), 256);

    // Puya has a density scheme but no model table.
    let id = JedecId::from_bytes([0x85, 0x60, 0x13]);
    assert_eq!(id.manufacturer(), Manufacturer::Puya);
    assert_eq!(id.model(), Model::Unknown);
    assert_eq!(id.block_count(), 8);

    let id = JedecId::from_bytes([0x1F, 0x84, 0x01]);
    assert_eq!(id.manufacturer(), Manufacturer::Adesto);
    assert_eq!(id.model(), Model::Unknown);
    assert_eq!(id.block_count(), 0);

    let id = JedecId::from_bytes([0x9D, 0x60, 0x16]);
    assert_eq!(id.manufacturer(), Manufacturer::Unknown);
    assert_eq!(id.block_count(), 0);
}

#[test]
fn test_block_count_density() {
    for capacity in 0x11..=0x19u8 {
        let id = JedecId::from_bytes([0xEF, 0x40, capacity]);
        assert_eq!(id.block_count(), 1 << (capacity - 0x11 + 1));
    }
    // Density index 5 gives 64 blocks.
    assert_eq!(JedecId::from_bytes([0xC2, 0x20, 0x16]).block_count(), 64);
    // Below the base code the density is unknown.
    assert_eq!(JedecId::from_bytes([0xEF, 0x40, 0x10]).block_count(), 0);
    // Codes large enough to overflow are rejected rather than wrapping.
    assert_eq!(JedecId::from_bytes([0xEF, 0x40, 0x40]).block_count(), 0);
}

#[test]
fn test_bus_fault() {
    assert!(JedecId::from_bytes([0xFF, 0xFF, 0xFF]).is_bus_fault());
    assert!(JedecId::from_bytes([0x00, 0x00, 0x00]).is_bus_fault());
    assert!(!JedecId::from_bytes([0xEF, 0x40, 0x17]).is_bus_fault());
}
