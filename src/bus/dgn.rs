//! Data group number classification

use std::fmt;

/// DC dimmer status (lights and switched water devices)
pub const DGN_DC_DIMMER_STATUS_3: u32 = 0x1FEDA;

/// Tank level status
pub const DGN_TANK_STATUS: u32 = 0x1FFB7;

/// Data group number: the 17 bits of a 29-bit id above the source address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dgn(pub u32);

impl Dgn {
    pub fn from_arbitration_id(id: u32) -> Self {
        Dgn((id >> 8) & 0x1FFFF)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Dgn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05X}", self.0)
    }
}
