use log::info;

use crate::battery::classifier::ClassifiedReading;
use crate::battery::history::{BatteryHistory, BatteryReading};
use crate::device::types::DeviceIdentity;

/// One split keyboard that the monitor is (or was) connected to, together with everything observed about it.
#[derive(Debug, Clone)]
pub struct Pairing {
    identity: DeviceIdentity,
    history: BatteryHistory,
    peripheral_label: Option<String>,
}

impl Pairing {
    pub fn new(identity: DeviceIdentity) -> Self {
        Pairing {
            identity,
            history: BatteryHistory::new(),
            peripheral_label: None,
        }
    }

    /// Builds the pairing for a new connection. The history of `prior` is carried forward when it belongs to the
    /// same device, and discarded otherwise.
    pub fn resume(prior: Option<Pairing>, identity: DeviceIdentity) -> Self {
        match prior {
            Some(prior) if prior.identity.id == identity.id => {
                info!(
                    "Resuming history of {} with {} readings",
                    identity,
                    prior.history.len()
                );
                Pairing {
                    identity,
                    history: BatteryHistory::seed_from(&prior.history),
                    peripheral_label: prior.peripheral_label,
                }
            },
            Some(prior) => {
                info!("Connected to {} instead of {}; starting a new history", identity, prior.identity);
                Pairing::new(identity)
            },
            None => Pairing::new(identity),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn history(&self) -> &BatteryHistory {
        &self.history
    }

    pub fn peripheral_label(&self) -> Option<&str> {
        self.peripheral_label.as_deref()
    }

    pub fn record(&mut self, reading: ClassifiedReading) -> Option<BatteryReading> {
        if reading.label.is_some() {
            self.peripheral_label = reading.label;
        }
        self.history.record(reading.slot, reading.level)
    }
}
