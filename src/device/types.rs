use std::fmt;
use uuid::Uuid;

use crate::battery::history::BatteryReading;
use crate::device::constants::UNKNOWN_DEVICE_NAME;
use crate::error::DeviceError;

/// Opaque, platform assigned identifier of a bluetooth device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<DeviceId>, name: Option<String>) -> Self {
        DeviceIdentity { id: id.into(), name }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.id)
    }
}

/// Identifies a service, characteristic or descriptor within one connection. Allocated by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u64);

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub id: AttributeId,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub service: AttributeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorHandle {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub characteristic: CharacteristicHandle,
}

/// Outcome of a GATT request made for one connected device.
#[derive(Debug)]
pub enum GattEvent {
    ServicesFound(Result<Vec<ServiceHandle>, DeviceError>),
    CharacteristicsFound {
        service: ServiceHandle,
        result: Result<Vec<CharacteristicHandle>, DeviceError>,
    },
    DescriptorsFound {
        characteristic: CharacteristicHandle,
        result: Result<Vec<DescriptorHandle>, DeviceError>,
    },
    DescriptorValue {
        descriptor: DescriptorHandle,
        result: Result<Vec<u8>, DeviceError>,
    },
    /// Answer to a read, or a notification once subscribed.
    ValueUpdated {
        characteristic: CharacteristicHandle,
        result: Result<Vec<u8>, DeviceError>,
    },
    NotifyStateChanged {
        characteristic: CharacteristicHandle,
        result: Result<bool, DeviceError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Scanning,
    Connecting,
    Connected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            DeviceState::Idle => "Idle",
            DeviceState::Scanning => "Scanning",
            DeviceState::Connecting => "Connecting",
            DeviceState::Connected => "Connected",
        };

        write!(f, "{}", result)
    }
}

/// Delivered to observers of a [`crate::monitor::Monitor`].
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    StateChange(DeviceState),
    Reading(BatteryReading),
}
