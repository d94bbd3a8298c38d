//! Command byte of an RCT frame

use std::fmt;

/// Bit that turns a command into its plant (gateway) variant
const PLANT_BIT: u8 = 0x40;

/// Recognized command bytes
///
/// `0x04` and `0x07` are reserved by the device and rejected like any other
/// unknown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Read = 0x01,
    Write = 0x02,
    LongWrite = 0x03,
    Response = 0x05,
    LongResponse = 0x06,
    ReadPeriodically = 0x08,
    Extension = 0x3C,
    PlantRead = 0x41,
    PlantWrite = 0x42,
    PlantLongWrite = 0x43,
    PlantResponse = 0x45,
    PlantLongResponse = 0x46,
    PlantReadPeriodically = 0x48,
}

impl Command {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Long commands carry a two byte length field
    pub fn is_long(self) -> bool {
        matches!(
            self,
            Self::LongWrite | Self::LongResponse | Self::PlantLongWrite | Self::PlantLongResponse
        )
    }

    /// Plant frames carry a 4-byte device address in front of the identifier
    pub fn is_plant(self) -> bool {
        self.as_u8() & PLANT_BIT != 0
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::Response | Self::LongResponse | Self::PlantResponse | Self::PlantLongResponse
        )
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Read),
            0x02 => Ok(Self::Write),
            0x03 => Ok(Self::LongWrite),
            0x05 => Ok(Self::Response),
            0x06 => Ok(Self::LongResponse),
            0x08 => Ok(Self::ReadPeriodically),
            0x3C => Ok(Self::Extension),
            0x41 => Ok(Self::PlantRead),
            0x42 => Ok(Self::PlantWrite),
            0x43 => Ok(Self::PlantLongWrite),
            0x45 => Ok(Self::PlantResponse),
            0x46 => Ok(Self::PlantLongResponse),
            0x48 => Ok(Self::PlantReadPeriodically),
            other => Err(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.as_u8())
    }
}
