//! In-memory adapter that records requests instead of talking to a radio. Outcomes are delivered by feeding
//! [`crate::device::adapter::AdapterEvent`]s to the code under test.

use std::collections::HashSet;
use uuid::Uuid;

use crate::device::adapter::BleAdapter;
use crate::device::types::{CharacteristicHandle, DescriptorHandle, DeviceId, ServiceHandle};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RetrieveConnected(Uuid),
    StartScan(Uuid),
    StopScan,
    Connect(DeviceId),
    DiscoverServices { device: DeviceId, filter: Vec<Uuid> },
    DiscoverCharacteristics { device: DeviceId, service: ServiceHandle, filter: Vec<Uuid> },
    DiscoverDescriptors { device: DeviceId, characteristic: CharacteristicHandle },
    ReadCharacteristic { device: DeviceId, characteristic: CharacteristicHandle },
    ReadDescriptor { device: DeviceId, descriptor: DescriptorHandle },
    SetNotify { device: DeviceId, characteristic: CharacteristicHandle, enabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    RetrieveConnected,
    StartScan,
    StopScan,
    Connect,
    DiscoverServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    ReadCharacteristic,
    ReadDescriptor,
    SetNotify,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::RetrieveConnected(_) => RequestKind::RetrieveConnected,
            Request::StartScan(_) => RequestKind::StartScan,
            Request::StopScan => RequestKind::StopScan,
            Request::Connect(_) => RequestKind::Connect,
            Request::DiscoverServices { .. } => RequestKind::DiscoverServices,
            Request::DiscoverCharacteristics { .. } => RequestKind::DiscoverCharacteristics,
            Request::DiscoverDescriptors { .. } => RequestKind::DiscoverDescriptors,
            Request::ReadCharacteristic { .. } => RequestKind::ReadCharacteristic,
            Request::ReadDescriptor { .. } => RequestKind::ReadDescriptor,
            Request::SetNotify { .. } => RequestKind::SetNotify,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    requests: Vec<Request>,
    rejected: HashSet<RequestKind>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following request of `kind` fail immediately. Rejected requests are still recorded.
    pub fn reject(&mut self, kind: RequestKind) {
        self.rejected.insert(kind);
    }

    pub fn accept(&mut self, kind: RequestKind) {
        self.rejected.remove(&kind);
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn take_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    fn push(&mut self, request: Request) -> Result<(), DeviceError> {
        let kind = request.kind();
        self.requests.push(request);

        if self.rejected.contains(&kind) {
            return Err(DeviceError::Platform { message: format!("{:?} rejected by mock", kind) });
        }
        Ok(())
    }
}

impl BleAdapter for MockAdapter {
    fn retrieve_connected(&mut self, service: Uuid) -> Result<(), DeviceError> {
        self.push(Request::RetrieveConnected(service))
    }

    fn start_scan(&mut self, service: Uuid) -> Result<(), DeviceError> {
        self.push(Request::StartScan(service))
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.push(Request::StopScan)
    }

    fn connect(&mut self, device: &DeviceId) -> Result<(), DeviceError> {
        self.push(Request::Connect(device.clone()))
    }

    fn discover_services(&mut self, device: &DeviceId, filter: &[Uuid]) -> Result<(), DeviceError> {
        self.push(Request::DiscoverServices { device: device.clone(), filter: filter.to_vec() })
    }

    fn discover_characteristics(
        &mut self,
        device: &DeviceId,
        service: &ServiceHandle,
        filter: &[Uuid],
    ) -> Result<(), DeviceError> {
        self.push(Request::DiscoverCharacteristics {
            device: device.clone(),
            service: service.clone(),
            filter: filter.to_vec(),
        })
    }

    fn discover_descriptors(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), DeviceError> {
        self.push(Request::DiscoverDescriptors { device: device.clone(), characteristic: characteristic.clone() })
    }

    fn read_characteristic(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), DeviceError> {
        self.push(Request::ReadCharacteristic { device: device.clone(), characteristic: characteristic.clone() })
    }

    fn read_descriptor(&mut self, device: &DeviceId, descriptor: &DescriptorHandle) -> Result<(), DeviceError> {
        self.push(Request::ReadDescriptor { device: device.clone(), descriptor: descriptor.clone() })
    }

    fn set_notify(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), DeviceError> {
        self.push(Request::SetNotify {
            device: device.clone(),
            characteristic: characteristic.clone(),
            enabled,
        })
    }
}
