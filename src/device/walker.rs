//! Walks the GATT tree of a connected keyboard down to its battery level characteristics.
//!
//! Per characteristic the order is: discover descriptors, read the user description (if there is one), read
//! the value, enable notifications. Every battery level characteristic is its own branch with its own state,
//! so callbacks of the two halves may interleave freely. A failure abandons only the branch it happened in.

use std::collections::HashMap;
use std::fmt::Display;
use log::{debug, info, warn};

use crate::battery::classifier::{battery_level_byte, classify, decode_description};
use crate::battery::history::BatteryReading;
use crate::device::adapter::BleAdapter;
use crate::device::constants::{make_battery_level_uuid, make_battery_service_uuid, make_user_description_uuid};
use crate::device::pairing::Pairing;
use crate::device::types::{
    AttributeId, CharacteristicHandle, DescriptorHandle, DeviceId, GattEvent, ServiceHandle,
};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkPhase {
    Connected,
    ServicesDiscovered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    DiscoveringCharacteristics,
    CharacteristicsDiscovered,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    DiscoveringDescriptors,
    ReadingDescription { descriptor: AttributeId },
    ReadingValue,
    Subscribing,
    Subscribed,
    Abandoned,
}

#[derive(Debug)]
struct Branch {
    characteristic: CharacteristicHandle,
    // Some once a user description descriptor has been read
    description: Option<String>,
    state: BranchState,
}

#[derive(Debug)]
pub struct GattWalker {
    pairing: Pairing,
    phase: WalkPhase,
    services: HashMap<AttributeId, ServiceState>,
    branches: HashMap<AttributeId, Branch>,
}

impl GattWalker {
    /// Starts walking a freshly connected device by asking for its battery services.
    pub fn start(pairing: Pairing, adapter: &mut dyn BleAdapter) -> Self {
        let mut walker = GattWalker {
            pairing,
            phase: WalkPhase::Connected,
            services: HashMap::new(),
            branches: HashMap::new(),
        };

        info!("Discovering battery services of {}", walker.pairing.identity());
        let device = walker.device().clone();
        if let Err(err) = adapter.discover_services(&device, &[make_battery_service_uuid()]) {
            warn!("Service discovery request for {} failed: {}", device, err);
            walker.phase = WalkPhase::Failed;
        }

        walker
    }

    pub fn device(&self) -> &DeviceId {
        &self.pairing.identity().id
    }

    pub fn pairing(&self) -> &Pairing {
        &self.pairing
    }

    pub fn into_pairing(self) -> Pairing {
        self.pairing
    }

    pub fn phase(&self) -> WalkPhase {
        self.phase
    }

    pub fn service_state(&self, service: AttributeId) -> Option<ServiceState> {
        self.services.get(&service).copied()
    }

    pub fn branch_state(&self, characteristic: AttributeId) -> Option<BranchState> {
        self.branches.get(&characteristic).map(|branch| branch.state)
    }

    /// Advances the walk. Returns the reading that was appended to the history, if any.
    pub fn handle(&mut self, event: GattEvent, adapter: &mut dyn BleAdapter) -> Option<BatteryReading> {
        match event {
            GattEvent::ServicesFound(result) => {
                self.on_services(result, adapter);
                None
            },
            GattEvent::CharacteristicsFound { service, result } => {
                self.on_characteristics(service, result, adapter);
                None
            },
            GattEvent::DescriptorsFound { characteristic, result } => {
                self.on_descriptors(characteristic, result, adapter);
                None
            },
            GattEvent::DescriptorValue { descriptor, result } => {
                self.on_descriptor_value(descriptor, result, adapter);
                None
            },
            GattEvent::ValueUpdated { characteristic, result } => {
                self.on_value(characteristic, result, adapter)
            },
            GattEvent::NotifyStateChanged { characteristic, result } => {
                self.on_notify_state(characteristic, result);
                None
            },
        }
    }

    fn on_services(&mut self, result: Result<Vec<ServiceHandle>, DeviceError>, adapter: &mut dyn BleAdapter) {
        if self.phase != WalkPhase::Connected {
            debug!("Ignoring service discovery result of {} in phase {:?}", self.device(), self.phase);
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(err) => {
                warn!("Service discovery of {} failed: {}", self.device(), err);
                self.phase = WalkPhase::Failed;
                return;
            },
        };

        self.phase = WalkPhase::ServicesDiscovered;
        let device = self.device().clone();
        let battery_service_uuid = make_battery_service_uuid();

        // Some platforms ignore the filter
        let battery_services: Vec<ServiceHandle> = services
            .into_iter()
            .filter(|service| service.uuid == battery_service_uuid)
            .collect();

        if battery_services.is_empty() {
            warn!("{} does not expose a battery service", self.pairing.identity());
        }

        for service in battery_services {
            if self.services.contains_key(&service.id) {
                continue;
            }

            info!("Found battery service {} on {}", service.id, device);
            let state = match adapter.discover_characteristics(&device, &service, &[make_battery_level_uuid()]) {
                Ok(()) => ServiceState::DiscoveringCharacteristics,
                Err(err) => {
                    warn!("Characteristic discovery request for service {} failed: {}", service.id, err);
                    ServiceState::Abandoned
                },
            };
            self.services.insert(service.id, state);
        }
    }

    fn on_characteristics(
        &mut self,
        service: ServiceHandle,
        result: Result<Vec<CharacteristicHandle>, DeviceError>,
        adapter: &mut dyn BleAdapter,
    ) {
        if self.services.get(&service.id) != Some(&ServiceState::DiscoveringCharacteristics) {
            debug!("Ignoring characteristics of service {} that is not being discovered", service.id);
            return;
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(err) => {
                warn!("Characteristic discovery of service {} failed: {}", service.id, err);
                self.services.insert(service.id, ServiceState::Abandoned);
                return;
            },
        };
        self.services.insert(service.id, ServiceState::CharacteristicsDiscovered);

        let device = self.device().clone();
        let battery_level_uuid = make_battery_level_uuid();

        for characteristic in characteristics {
            if characteristic.uuid != battery_level_uuid || self.branches.contains_key(&characteristic.id) {
                continue;
            }

            info!("Found battery level characteristic {} in service {}", characteristic.id, service.id);

            // the descriptors decide how the value is classified, so they come before the value
            let state = match adapter.discover_descriptors(&device, &characteristic) {
                Ok(()) => BranchState::DiscoveringDescriptors,
                Err(err) => {
                    warn!("Descriptor discovery request for {} failed: {}", characteristic.id, err);
                    BranchState::Abandoned
                },
            };
            self.branches.insert(characteristic.id, Branch { characteristic, description: None, state });
        }
    }

    fn on_descriptors(
        &mut self,
        characteristic: CharacteristicHandle,
        result: Result<Vec<DescriptorHandle>, DeviceError>,
        adapter: &mut dyn BleAdapter,
    ) {
        let device = self.device().clone();
        let Some(branch) = self.branch_in(characteristic.id, |state| state == BranchState::DiscoveringDescriptors) else {
            return;
        };

        let descriptors = match result {
            Ok(descriptors) => descriptors,
            Err(err) => {
                abandon(branch, "descriptor discovery failed", err);
                return;
            },
        };

        let user_description_uuid = make_user_description_uuid();
        match descriptors.into_iter().find(|descriptor| descriptor.uuid == user_description_uuid) {
            Some(descriptor) => {
                debug!("Reading user description of {}", branch.characteristic.id);
                match adapter.read_descriptor(&device, &descriptor) {
                    Ok(()) => branch.state = BranchState::ReadingDescription { descriptor: descriptor.id },
                    Err(err) => abandon(branch, "user description read request failed", err),
                }
            },
            None => {
                debug!("{} has no user description; reading value", branch.characteristic.id);
                read_value(branch, &device, adapter);
            },
        }
    }

    fn on_descriptor_value(
        &mut self,
        descriptor: DescriptorHandle,
        result: Result<Vec<u8>, DeviceError>,
        adapter: &mut dyn BleAdapter,
    ) {
        let device = self.device().clone();
        let expected = BranchState::ReadingDescription { descriptor: descriptor.id };
        let Some(branch) = self.branch_in(descriptor.characteristic.id, |state| state == expected) else {
            return;
        };

        match result {
            Ok(value) => {
                let description = decode_description(&value);
                info!("{} is described as {:?}", branch.characteristic.id, description);
                branch.description = Some(description);
                read_value(branch, &device, adapter);
            },
            Err(err) => abandon(branch, "user description read failed", err),
        }
    }

    fn on_value(
        &mut self,
        characteristic: CharacteristicHandle,
        result: Result<Vec<u8>, DeviceError>,
        adapter: &mut dyn BleAdapter,
    ) -> Option<BatteryReading> {
        let device = self.device().clone();
        let branch = self.branches.get_mut(&characteristic.id);
        let Some(branch) = branch.filter(|branch| matches!(
            branch.state,
            BranchState::ReadingValue | BranchState::Subscribing | BranchState::Subscribed
        )) else {
            debug!("Ignoring value of {} outside of its reading state", characteristic.id);
            return None;
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                abandon(branch, "value read failed", err);
                return None;
            },
        };

        let raw = battery_level_byte(&value);
        let reading = match classify(raw, branch.description.as_deref()) {
            Ok(classified) => {
                info!("{} battery level {}% ({})", classified.slot, classified.level, branch.characteristic.id);
                self.pairing.record(classified)
            },
            Err(err) => {
                warn!("Discarding reading of {}: {}", branch.characteristic.id, err);
                None
            },
        };

        if branch.state == BranchState::ReadingValue {
            match adapter.set_notify(&device, &branch.characteristic, true) {
                Ok(()) => branch.state = BranchState::Subscribing,
                Err(err) => abandon(branch, "notification request failed", err),
            }
        }

        reading
    }

    fn on_notify_state(&mut self, characteristic: CharacteristicHandle, result: Result<bool, DeviceError>) {
        let Some(branch) = self.branch_in(characteristic.id, |state| {
            matches!(state, BranchState::Subscribing | BranchState::Subscribed)
        }) else {
            return;
        };

        match result {
            Ok(true) => {
                debug!("Notifications enabled for {}", branch.characteristic.id);
                branch.state = BranchState::Subscribed;
            },
            Ok(false) => {
                warn!("Notifications for {} were not enabled", branch.characteristic.id);
                branch.state = BranchState::Abandoned;
            },
            Err(err) => abandon(branch, "enabling notifications failed", err),
        }
    }

    fn branch_in(&mut self, characteristic: AttributeId, accept: impl Fn(BranchState) -> bool) -> Option<&mut Branch> {
        match self.branches.get_mut(&characteristic) {
            Some(branch) if accept(branch.state) => Some(branch),
            Some(branch) => {
                debug!("Ignoring stale event for {} in state {:?}", characteristic, branch.state);
                None
            },
            None => {
                debug!("Ignoring event for unknown characteristic {}", characteristic);
                None
            },
        }
    }
}

fn read_value(branch: &mut Branch, device: &DeviceId, adapter: &mut dyn BleAdapter) {
    match adapter.read_characteristic(device, &branch.characteristic) {
        Ok(()) => branch.state = BranchState::ReadingValue,
        Err(err) => abandon(branch, "value read request failed", err),
    }
}

fn abandon(branch: &mut Branch, what: &str, err: impl Display) {
    warn!("Abandoning {}: {}: {}", branch.characteristic.id, what, err);
    branch.state = BranchState::Abandoned;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::classifier::Slot;
    use crate::device::mock::{MockAdapter, Request, RequestKind};
    use crate::device::types::DeviceIdentity;

    fn device() -> DeviceId {
        DeviceId::from("AA:BB")
    }

    fn service(id: u64) -> ServiceHandle {
        ServiceHandle { id: AttributeId(id), uuid: make_battery_service_uuid() }
    }

    fn level(id: u64, service: u64) -> CharacteristicHandle {
        CharacteristicHandle { id: AttributeId(id), uuid: make_battery_level_uuid(), service: AttributeId(service) }
    }

    fn description(id: u64, characteristic: CharacteristicHandle) -> DescriptorHandle {
        DescriptorHandle { id: AttributeId(id), uuid: make_user_description_uuid(), characteristic }
    }

    fn start(adapter: &mut MockAdapter) -> GattWalker {
        let pairing = Pairing::new(DeviceIdentity::new("AA:BB", Some("Corne".to_string())));
        GattWalker::start(pairing, adapter)
    }

    /// Drives one characteristic from discovery up to its first value request.
    fn discover(walker: &mut GattWalker, adapter: &mut MockAdapter, characteristic: &CharacteristicHandle) {
        walker.handle(GattEvent::ServicesFound(Ok(vec![service(characteristic.service.0)])), adapter);
        walker.handle(GattEvent::CharacteristicsFound {
            service: service(characteristic.service.0),
            result: Ok(vec![characteristic.clone()]),
        }, adapter);
    }

    #[test]
    fn start_requests_only_battery_services() {
        let mut adapter = MockAdapter::new();
        let walker = start(&mut adapter);

        assert_eq!(walker.phase(), WalkPhase::Connected);
        assert_eq!(adapter.take_requests(), vec![Request::DiscoverServices {
            device: device(),
            filter: vec![make_battery_service_uuid()],
        }]);
    }

    #[test]
    fn non_battery_services_are_ignored() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        adapter.take_requests();

        let hid = ServiceHandle { id: AttributeId(1), uuid: crate::device::constants::make_hid_service_uuid() };
        walker.handle(GattEvent::ServicesFound(Ok(vec![hid, service(2)])), &mut adapter);

        assert_eq!(walker.phase(), WalkPhase::ServicesDiscovered);
        assert_eq!(walker.service_state(AttributeId(1)), None);
        assert_eq!(adapter.take_requests(), vec![Request::DiscoverCharacteristics {
            device: device(),
            service: service(2),
            filter: vec![make_battery_level_uuid()],
        }]);
    }

    #[test]
    fn described_characteristic_reads_description_before_value() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let characteristic = level(11, 10);
        discover(&mut walker, &mut adapter, &characteristic);
        adapter.take_requests();

        let descriptor = description(12, characteristic.clone());
        walker.handle(GattEvent::DescriptorsFound {
            characteristic: characteristic.clone(),
            result: Ok(vec![descriptor.clone()]),
        }, &mut adapter);
        assert_eq!(walker.branch_state(AttributeId(11)), Some(BranchState::ReadingDescription { descriptor: AttributeId(12) }));

        walker.handle(GattEvent::DescriptorValue {
            descriptor: descriptor.clone(),
            result: Ok(b"Peripheral 0".to_vec()),
        }, &mut adapter);
        assert_eq!(walker.branch_state(AttributeId(11)), Some(BranchState::ReadingValue));

        let reading = walker.handle(GattEvent::ValueUpdated {
            characteristic: characteristic.clone(),
            result: Ok(vec![80]),
        }, &mut adapter).unwrap();
        assert_eq!((reading.central, reading.peripheral), (0, 80));
        assert_eq!(walker.pairing().peripheral_label(), Some("Peripheral 0"));
        assert_eq!(walker.branch_state(AttributeId(11)), Some(BranchState::Subscribing));

        assert_eq!(adapter.take_requests(), vec![
            Request::ReadDescriptor { device: device(), descriptor },
            Request::ReadCharacteristic { device: device(), characteristic: characteristic.clone() },
            Request::SetNotify { device: device(), characteristic, enabled: true },
        ]);
    }

    #[test]
    fn undescribed_characteristic_is_central() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let characteristic = level(21, 20);
        discover(&mut walker, &mut adapter, &characteristic);

        walker.handle(GattEvent::DescriptorsFound { characteristic: characteristic.clone(), result: Ok(vec![]) }, &mut adapter);
        let reading = walker.handle(GattEvent::ValueUpdated {
            characteristic: characteristic.clone(),
            result: Ok(vec![60]),
        }, &mut adapter).unwrap();

        assert_eq!((reading.central, reading.peripheral), (60, 0));
        assert_eq!(walker.pairing().history().current_level(Slot::Central), 60);
        assert_eq!(walker.pairing().history().len(), 1);
    }

    #[test]
    fn unsampled_level_matches_the_defaults() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let characteristic = level(21, 20);
        discover(&mut walker, &mut adapter, &characteristic);

        walker.handle(GattEvent::DescriptorsFound { characteristic: characteristic.clone(), result: Ok(vec![]) }, &mut adapter);
        let reading = walker.handle(GattEvent::ValueUpdated {
            characteristic: characteristic.clone(),
            result: Ok(vec![0xFF]),
        }, &mut adapter);

        assert_eq!(reading, None);
        assert_eq!(walker.pairing().history().current_level(Slot::Central), 0);
        assert!(walker.pairing().history().is_empty());
        assert_eq!(walker.branch_state(AttributeId(21)), Some(BranchState::Subscribing));
    }

    #[test]
    fn second_service_discovery_result_is_ignored() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        walker.handle(GattEvent::ServicesFound(Ok(vec![service(10), service(20)])), &mut adapter);
        adapter.take_requests();

        // same services under the ids of another connection
        walker.handle(GattEvent::ServicesFound(Ok(vec![service(30), service(40)])), &mut adapter);

        assert!(adapter.requests().is_empty());
        assert_eq!(walker.service_state(AttributeId(30)), None);
        assert_eq!(walker.service_state(AttributeId(10)), Some(ServiceState::DiscoveringCharacteristics));
    }

    #[test]
    fn notifications_are_enabled_once_and_keep_recording() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let characteristic = level(21, 20);
        discover(&mut walker, &mut adapter, &characteristic);
        walker.handle(GattEvent::DescriptorsFound { characteristic: characteristic.clone(), result: Ok(vec![]) }, &mut adapter);
        walker.handle(GattEvent::ValueUpdated { characteristic: characteristic.clone(), result: Ok(vec![50]) }, &mut adapter);
        walker.handle(GattEvent::NotifyStateChanged { characteristic: characteristic.clone(), result: Ok(true) }, &mut adapter);
        assert_eq!(walker.branch_state(AttributeId(21)), Some(BranchState::Subscribed));
        adapter.take_requests();

        let reading = walker.handle(GattEvent::ValueUpdated {
            characteristic: characteristic.clone(),
            result: Ok(vec![0x4B]),
        }, &mut adapter).unwrap();

        assert_eq!(reading.central, 75);
        assert_eq!(walker.pairing().history().len(), 2);
        assert!(adapter.requests().is_empty());
    }

    #[test]
    fn failed_branch_does_not_stop_its_sibling() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let broken = level(11, 10);
        let healthy = level(21, 20);
        walker.handle(GattEvent::ServicesFound(Ok(vec![service(10), service(20)])), &mut adapter);
        walker.handle(GattEvent::CharacteristicsFound { service: service(10), result: Ok(vec![broken.clone()]) }, &mut adapter);
        walker.handle(GattEvent::CharacteristicsFound { service: service(20), result: Ok(vec![healthy.clone()]) }, &mut adapter);

        walker.handle(GattEvent::DescriptorsFound {
            characteristic: broken.clone(),
            result: Err(DeviceError::Platform { message: "gatt error".to_string() }),
        }, &mut adapter);
        walker.handle(GattEvent::DescriptorsFound { characteristic: healthy.clone(), result: Ok(vec![]) }, &mut adapter);
        let reading = walker.handle(GattEvent::ValueUpdated { characteristic: healthy, result: Ok(vec![60]) }, &mut adapter);

        assert_eq!(walker.branch_state(AttributeId(11)), Some(BranchState::Abandoned));
        assert_eq!(reading.map(|r| r.central), Some(60));

        // a late value for the abandoned branch is never reported
        let late = walker.handle(GattEvent::ValueUpdated { characteristic: broken, result: Ok(vec![10]) }, &mut adapter);
        assert_eq!(late, None);
    }

    #[test]
    fn rejected_request_abandons_the_branch() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let characteristic = level(21, 20);
        discover(&mut walker, &mut adapter, &characteristic);

        adapter.reject(RequestKind::ReadCharacteristic);
        walker.handle(GattEvent::DescriptorsFound { characteristic, result: Ok(vec![]) }, &mut adapter);

        assert_eq!(walker.branch_state(AttributeId(21)), Some(BranchState::Abandoned));
    }

    #[test]
    fn value_before_descriptors_is_ignored() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let characteristic = level(21, 20);
        discover(&mut walker, &mut adapter, &characteristic);

        let reading = walker.handle(GattEvent::ValueUpdated { characteristic, result: Ok(vec![50]) }, &mut adapter);

        assert_eq!(reading, None);
        assert!(walker.pairing().history().is_empty());
        assert_eq!(walker.branch_state(AttributeId(21)), Some(BranchState::DiscoveringDescriptors));
    }

    #[test]
    fn out_of_range_value_is_not_stored_but_still_subscribed() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);
        let characteristic = level(21, 20);
        discover(&mut walker, &mut adapter, &characteristic);
        walker.handle(GattEvent::DescriptorsFound { characteristic: characteristic.clone(), result: Ok(vec![]) }, &mut adapter);

        let reading = walker.handle(GattEvent::ValueUpdated { characteristic, result: Ok(vec![0x96]) }, &mut adapter);

        assert_eq!(reading, None);
        assert!(walker.pairing().history().is_empty());
        assert_eq!(walker.branch_state(AttributeId(21)), Some(BranchState::Subscribing));
    }

    #[test]
    fn failed_service_discovery_marks_the_walk_failed() {
        let mut adapter = MockAdapter::new();
        let mut walker = start(&mut adapter);

        walker.handle(GattEvent::ServicesFound(Err(DeviceError::Platform { message: "timeout".to_string() })), &mut adapter);

        assert_eq!(walker.phase(), WalkPhase::Failed);
    }
}
