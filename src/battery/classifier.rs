use std::fmt;

use crate::device::constants::{MAX_BATTERY_LEVEL, NULL_BATTERY_LEVEL};
use crate::error::ReadingError;

/// The physical half of the split keyboard that a battery level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Central,
    Peripheral,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            Slot::Central => "central",
            Slot::Peripheral => "peripheral",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedReading {
    pub slot: Slot,
    pub level: u8,
    /// Human readable name of the half, taken from the user description descriptor.
    pub label: Option<String>,
}

/// Assigns a battery level byte to a keyboard half.
///
/// The half that the host is connected to reports its own level without a user description descriptor; the
/// split link reports the other half's level and labels it with one. So the presence of a description, not
/// its content, selects [`Slot::Peripheral`]. This follows the behaviour of ZMK firmware and is not a general
/// Battery Service rule.
///
/// The "not sampled yet" sentinel is stored as 0. Any other byte above 100 is rejected.
pub fn classify(raw: u8, description: Option<&str>) -> Result<ClassifiedReading, ReadingError> {
    let level = match raw {
        NULL_BATTERY_LEVEL => 0,
        level if level > MAX_BATTERY_LEVEL => return Err(ReadingError::OutOfRange { raw }),
        level => level,
    };

    let slot = match description {
        Some(_) => Slot::Peripheral,
        None => Slot::Central,
    };

    Ok(ClassifiedReading {
        slot,
        level,
        label: description.map(str::to_string),
    })
}

/// Decodes the raw value of a characteristic user description descriptor.
pub fn decode_description(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

/// Battery level characteristics carry a single byte; an empty value reads as 0.
pub fn battery_level_byte(value: &[u8]) -> u8 {
    value.first().copied().unwrap_or(0)
}
