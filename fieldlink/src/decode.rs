#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Controls the decoding of transmitted and received data at the payload and physical layers
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct DecodeLevel {
    /// Controls the logging of request and response payloads handed to / returned by the codec
    pub payload: PayloadDecodeLevel,
    /// Controls the logging of physical layer read/write
    pub physical: PhysDecodeLevel,
}

/// Controls how request and response payloads are logged at the INFO level
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum PayloadDecodeLevel {
    /// Log nothing
    #[default]
    Nothing,
    /// Log the length of the payloads
    Length,
    /// Log the length and the payload bytes as hexadecimal
    Data,
}

/// Controls how data transmitted at the physical layer (TCP, serial, etc) is logged
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(rename_all = "snake_case"))]
pub enum PhysDecodeLevel {
    /// Log nothing
    #[default]
    Nothing,
    /// Log only the length of data that is sent and received
    Length,
    /// Log the length and the actual data that is sent and received
    Data,
}

impl DecodeLevel {
    /// construct a `DecodeLevel` with nothing enabled
    pub fn nothing() -> Self {
        Self::default()
    }

    /// construct a `DecodeLevel` from its fields
    pub fn new(payload: PayloadDecodeLevel, physical: PhysDecodeLevel) -> Self {
        DecodeLevel { payload, physical }
    }

    /// Change the payload decode level
    pub fn payload(self, payload: PayloadDecodeLevel) -> Self {
        Self { payload, ..self }
    }

    /// Change the physical decode level
    pub fn physical(self, physical: PhysDecodeLevel) -> Self {
        Self { physical, ..self }
    }
}

impl From<PhysDecodeLevel> for DecodeLevel {
    fn from(physical: PhysDecodeLevel) -> Self {
        Self {
            payload: PayloadDecodeLevel::Nothing,
            physical,
        }
    }
}

impl PayloadDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        match self {
            PayloadDecodeLevel::Nothing => false,
            PayloadDecodeLevel::Length => true,
            PayloadDecodeLevel::Data => true,
        }
    }

    pub(crate) fn data_enabled(&self) -> bool {
        match self {
            PayloadDecodeLevel::Nothing => false,
            PayloadDecodeLevel::Length => false,
            PayloadDecodeLevel::Data => true,
        }
    }
}

impl PhysDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        match self {
            PhysDecodeLevel::Nothing => false,
            PhysDecodeLevel::Length => true,
            PhysDecodeLevel::Data => true,
        }
    }

    pub(crate) fn data_enabled(&self) -> bool {
        match self {
            PhysDecodeLevel::Nothing => false,
            PhysDecodeLevel::Length => false,
            PhysDecodeLevel::Data => true,
        }
    }
}

/// Displays a byte slice as its length, optionally followed by a hex dump
pub(crate) struct BytesDisplay<'a> {
    data_enabled: bool,
    data: &'a [u8],
}

impl<'a> BytesDisplay<'a> {
    pub(crate) fn new(data_enabled: bool, data: &'a [u8]) -> Self {
        BytesDisplay { data_enabled, data }
    }
}

impl std::fmt::Display for BytesDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} bytes", self.data.len())?;
        if self.data_enabled {
            format_bytes(f, self.data)?;
        }
        Ok(())
    }
}

const BYTES_PER_DECODE_LINE: usize = 18;

pub(crate) fn format_bytes(f: &mut std::fmt::Formatter, bytes: &[u8]) -> std::fmt::Result {
    use std::fmt::Write;

    for chunk in bytes.chunks(BYTES_PER_DECODE_LINE) {
        writeln!(f)?;
        let mut first = true;
        for byte in chunk {
            if !first {
                f.write_char(' ')?;
            }
            first = false;
            write!(f, "{byte:02X?}")?;
        }
    }
    Ok(())
}
