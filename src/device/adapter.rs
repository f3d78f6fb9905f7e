//! The capabilities the monitor needs from a platform bluetooth stack.
//!
//! Every request is non-blocking. An `Err` means the request was rejected outright; otherwise its outcome
//! arrives later as an [`AdapterEvent`] on the adapter's event channel. All events are consumed by a single
//! task, so the core never sees two callbacks at the same time.

use uuid::Uuid;

use crate::device::types::{
    CharacteristicHandle, DescriptorHandle, DeviceId, DeviceIdentity, GattEvent, ServiceHandle,
};
use crate::error::DeviceError;

#[derive(Debug)]
pub enum AdapterEvent {
    /// The radio is powered on. Lists devices with the requested service that are already connected at the
    /// platform level. Also the answer to [`BleAdapter::retrieve_connected`].
    RadioReady { connected: Vec<DeviceIdentity> },
    DeviceDiscovered(DeviceIdentity),
    ScanFailed(DeviceError),
    Connected(DeviceIdentity),
    ConnectFailed { device: DeviceId, error: DeviceError },
    Disconnected(DeviceId),
    Gatt { device: DeviceId, event: GattEvent },
}

pub trait BleAdapter {
    fn retrieve_connected(&mut self, service: Uuid) -> Result<(), DeviceError>;

    /// Failures after the scan was requested are reported as [`AdapterEvent::ScanFailed`]. An `Err` here means
    /// the radio cannot scan at all; the caller then waits for the next [`AdapterEvent::RadioReady`].
    fn start_scan(&mut self, service: Uuid) -> Result<(), DeviceError>;

    fn stop_scan(&mut self) -> Result<(), DeviceError>;

    fn connect(&mut self, device: &DeviceId) -> Result<(), DeviceError>;

    fn discover_services(&mut self, device: &DeviceId, filter: &[Uuid]) -> Result<(), DeviceError>;

    fn discover_characteristics(
        &mut self,
        device: &DeviceId,
        service: &ServiceHandle,
        filter: &[Uuid],
    ) -> Result<(), DeviceError>;

    fn discover_descriptors(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), DeviceError>;

    fn read_characteristic(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), DeviceError>;

    fn read_descriptor(&mut self, device: &DeviceId, descriptor: &DescriptorHandle) -> Result<(), DeviceError>;

    /// Enabling notifications that are already enabled must be harmless.
    fn set_notify(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), DeviceError>;
}
