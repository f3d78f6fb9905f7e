use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::battery::classifier::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub timestamp: SystemTime,
    pub central: u8,
    pub peripheral: u8,
}

impl fmt::Display for BatteryReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} central {}% peripheral {}%",
            humantime::format_rfc3339_seconds(self.timestamp),
            self.central,
            self.peripheral,
        )
    }
}

pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Append-only log of battery levels of both halves.
///
/// Readings are stamped when they are appended, and never earlier than the previous reading, so the history
/// is always in non-decreasing timestamp order.
#[derive(Clone)]
pub struct BatteryHistory {
    central: u8,
    peripheral: u8,
    readings: Vec<BatteryReading>,
    clock: Clock,
}

impl BatteryHistory {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemTime::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        BatteryHistory {
            central: 0,
            peripheral: 0,
            readings: Vec::new(),
            clock,
        }
    }

    /// Starts a history that continues where `prior` left off.
    pub fn seed_from(prior: &BatteryHistory) -> Self {
        BatteryHistory {
            central: prior.central,
            peripheral: prior.peripheral,
            readings: prior.readings.clone(),
            clock: prior.clock.clone(),
        }
    }

    pub fn current_central_level(&self) -> u8 {
        self.central
    }

    pub fn current_peripheral_level(&self) -> u8 {
        self.peripheral
    }

    pub fn current_level(&self, slot: Slot) -> u8 {
        match slot {
            Slot::Central => self.central,
            Slot::Peripheral => self.peripheral,
        }
    }

    pub fn history(&self) -> &[BatteryReading] {
        &self.readings
    }

    pub fn latest(&self) -> Option<&BatteryReading> {
        self.readings.last()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Updates the level of one half. The resulting pair of levels is appended unless it equals the current
    /// levels, which start out at 0 for both halves.
    pub fn record(&mut self, slot: Slot, level: u8) -> Option<BatteryReading> {
        if self.current_level(slot) == level {
            return None;
        }

        let (central, peripheral) = match slot {
            Slot::Central => (level, self.peripheral),
            Slot::Peripheral => (self.central, level),
        };
        Some(self.append(central, peripheral))
    }

    pub fn append(&mut self, central: u8, peripheral: u8) -> BatteryReading {
        let mut timestamp = (self.clock)();
        if let Some(previous) = self.readings.last() {
            // wall clock may step backwards
            timestamp = timestamp.max(previous.timestamp);
        }

        let reading = BatteryReading { timestamp, central, peripheral };
        self.central = central;
        self.peripheral = peripheral;
        self.readings.push(reading);
        reading
    }
}

impl Default for BatteryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BatteryHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatteryHistory")
            .field("central", &self.central)
            .field("peripheral", &self.peripheral)
            .field("readings", &self.readings)
            .finish()
    }
}
