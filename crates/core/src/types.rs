use std::fmt;

/// 32-bit device address, the top 7 bits carry the network identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevAddr(pub u32);

impl DevAddr {
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    pub fn nwk_id(&self) -> u8 {
        ((self.0 >> 25) & 0x7F) as u8
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// IEEE EUI-64 as carried in join frames (little-endian on the air)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Eui64(pub u64);

impl Eui64 {
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}
