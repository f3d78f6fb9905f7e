//! Finds the keyboard, connects to it and hands the connection to a [`GattWalker`].
//!
//! The connector owns the authoritative "current device": GATT events of any other device are stale and are
//! dropped. There is no retry timer; scanning resumes after a failure or disconnect and the next advertisement
//! drives the reconnect.

use log::{debug, info, warn};

use crate::battery::history::BatteryReading;
use crate::device::adapter::{AdapterEvent, BleAdapter};
use crate::device::constants::make_hid_service_uuid;
use crate::device::pairing::Pairing;
use crate::device::types::{DeviceId, DeviceIdentity, DeviceState, GattEvent};
use crate::device::walker::GattWalker;
use crate::error::DeviceError;

#[derive(Debug, Default)]
pub struct Connector {
    // only accept devices whose name contains this
    device_name: Option<String>,
    scanning: bool,
    candidate: Option<DeviceIdentity>,
    walker: Option<GattWalker>,
    // pairing of the last connection, kept while disconnected
    retired: Option<Pairing>,
}

impl Connector {
    pub fn new(device_name: Option<String>) -> Self {
        Connector {
            device_name,
            ..Default::default()
        }
    }

    pub fn state(&self) -> DeviceState {
        if self.walker.is_some() {
            DeviceState::Connected
        } else if self.candidate.is_some() {
            DeviceState::Connecting
        } else if self.scanning {
            DeviceState::Scanning
        } else {
            DeviceState::Idle
        }
    }

    pub fn candidate(&self) -> Option<&DeviceIdentity> {
        self.candidate.as_ref()
    }

    pub fn walker(&self) -> Option<&GattWalker> {
        self.walker.as_ref()
    }

    /// The pairing of the current connection, or of the last one while disconnected.
    pub fn pairing(&self) -> Option<&Pairing> {
        match &self.walker {
            Some(walker) => Some(walker.pairing()),
            None => self.retired.as_ref(),
        }
    }

    /// Prefers a keyboard that is already connected at the platform level; the answer arrives as
    /// [`AdapterEvent::RadioReady`].
    pub fn start(&mut self, adapter: &mut dyn BleAdapter) {
        info!("Looking for connected keyboards...");
        if let Err(err) = adapter.retrieve_connected(make_hid_service_uuid()) {
            warn!("Could not list connected keyboards: {}", err);
            self.start_scanning(adapter);
        }
    }

    pub fn handle(&mut self, event: AdapterEvent, adapter: &mut dyn BleAdapter) -> Option<BatteryReading> {
        match event {
            AdapterEvent::RadioReady { connected } => self.on_radio_ready(connected, adapter),
            AdapterEvent::DeviceDiscovered(identity) => self.on_discovered(identity, adapter),
            AdapterEvent::ScanFailed(err) => self.on_scan_failed(err, adapter),
            AdapterEvent::Connected(identity) => self.on_connected(identity, adapter),
            AdapterEvent::ConnectFailed { device, error } => self.on_connect_failed(device, error, adapter),
            AdapterEvent::Disconnected(device) => self.on_disconnected(device, adapter),
            AdapterEvent::Gatt { device, event } => return self.on_gatt(device, event, adapter),
        }
        None
    }

    fn accepts(&self, identity: &DeviceIdentity) -> bool {
        match &self.device_name {
            None => true,
            Some(wanted) => identity.name.as_deref().is_some_and(|name| name.contains(wanted.as_str())),
        }
    }

    fn start_scanning(&mut self, adapter: &mut dyn BleAdapter) {
        info!("Scanning for keyboards...");
        match adapter.start_scan(make_hid_service_uuid()) {
            Ok(()) => self.scanning = true,
            Err(err) => {
                // retrying right away would spin; the next radio power-on starts over
                warn!("Scanning failed {}; waiting for the radio", err);
                self.scanning = false;
            },
        }
    }

    fn connect(&mut self, identity: DeviceIdentity, adapter: &mut dyn BleAdapter) {
        info!("Connecting to {}...", identity);
        match adapter.connect(&identity.id) {
            Ok(()) => self.candidate = Some(identity),
            Err(err) => {
                warn!("Connecting to {} failed: {}", identity, err);
                self.candidate = None;
                self.start_scanning(adapter);
            },
        }
    }

    fn on_radio_ready(&mut self, connected: Vec<DeviceIdentity>, adapter: &mut dyn BleAdapter) {
        if self.walker.is_some() || self.candidate.is_some() {
            debug!("Radio ready while already tracking a keyboard");
            return;
        }

        let connected: Vec<DeviceIdentity> = connected.into_iter().filter(|identity| self.accepts(identity)).collect();
        if connected.is_empty() {
            self.start_scanning(adapter);
            return;
        }

        // in practice there is exactly one
        for identity in connected {
            self.connect(identity, adapter);
        }
    }

    fn on_discovered(&mut self, identity: DeviceIdentity, adapter: &mut dyn BleAdapter) {
        if self.walker.is_some() || self.candidate.is_some() {
            debug!("Ignoring {}; already tracking a keyboard", identity);
            return;
        }
        if !self.accepts(&identity) {
            debug!("Ignoring {}; name does not match", identity);
            return;
        }

        info!("Discovered {}", identity);
        if let Err(err) = adapter.stop_scan() {
            warn!("Failed to stop scanning: {}", err);
        }
        self.scanning = false;
        self.connect(identity, adapter);
    }

    fn on_scan_failed(&mut self, err: DeviceError, adapter: &mut dyn BleAdapter) {
        warn!("Scanning failed {}", err);
        self.scanning = false;
        if self.walker.is_none() && self.candidate.is_none() {
            self.start_scanning(adapter);
        }
    }

    fn on_connected(&mut self, identity: DeviceIdentity, adapter: &mut dyn BleAdapter) {
        match &self.candidate {
            Some(candidate) if candidate.id != identity.id => {
                debug!("Ignoring connection to {}; waiting for {}", identity, candidate);
                return;
            },
            _ => {},
        }

        info!("Connected to {}", identity);
        if self.scanning {
            if let Err(err) = adapter.stop_scan() {
                warn!("Failed to stop scanning: {}", err);
            }
            self.scanning = false;
        }

        let prior = match self.walker.take() {
            Some(walker) => Some(walker.into_pairing()),
            None => self.retired.take(),
        };
        let pairing = Pairing::resume(prior, identity.clone());

        self.candidate = Some(identity);
        self.walker = Some(GattWalker::start(pairing, adapter));
    }

    fn on_connect_failed(&mut self, device: DeviceId, err: DeviceError, adapter: &mut dyn BleAdapter) {
        warn!("Connecting to peripheral {} failed: {}", device, err);
        if self.candidate.as_ref().is_some_and(|candidate| candidate.id == device) && self.walker.is_none() {
            self.candidate = None;
            self.start_scanning(adapter);
        }
    }

    fn on_disconnected(&mut self, device: DeviceId, adapter: &mut dyn BleAdapter) {
        if !self.candidate.as_ref().is_some_and(|candidate| candidate.id == device) {
            debug!("Ignoring disconnect of {}", device);
            return;
        }

        warn!("Connection to {} lost", device);
        if let Some(walker) = self.walker.take() {
            // in-flight discovery of this connection is dropped along with the walker
            self.retired = Some(walker.into_pairing());
        }
        self.candidate = None;
        self.start_scanning(adapter);
    }

    fn on_gatt(&mut self, device: DeviceId, event: GattEvent, adapter: &mut dyn BleAdapter) -> Option<BatteryReading> {
        match &mut self.walker {
            Some(walker) if walker.device() == &device => walker.handle(event, adapter),
            _ => {
                debug!("Dropping stale GATT event of {}: {:?}", device, event);
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::make_battery_service_uuid;
    use crate::device::mock::{MockAdapter, Request, RequestKind};

    fn keyboard() -> DeviceIdentity {
        DeviceIdentity::new("AA:BB", Some("Corne".to_string()))
    }

    #[test]
    fn start_asks_for_connected_keyboards_first() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.start(&mut adapter);

        assert_eq!(adapter.take_requests(), vec![Request::RetrieveConnected(make_hid_service_uuid())]);
        assert_eq!(connector.state(), DeviceState::Idle);
    }

    #[test]
    fn start_falls_back_to_scanning() {
        let mut adapter = MockAdapter::new();
        adapter.reject(RequestKind::RetrieveConnected);
        let mut connector = Connector::new(None);
        connector.start(&mut adapter);

        assert_eq!(adapter.requests().last(), Some(&Request::StartScan(make_hid_service_uuid())));
        assert_eq!(connector.state(), DeviceState::Scanning);
    }

    #[test]
    fn rejected_scan_waits_for_the_radio() {
        let mut adapter = MockAdapter::new();
        adapter.reject(RequestKind::StartScan);
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::RadioReady { connected: vec![] }, &mut adapter);
        assert_eq!(connector.state(), DeviceState::Idle);

        adapter.accept(RequestKind::StartScan);
        connector.handle(AdapterEvent::RadioReady { connected: vec![] }, &mut adapter);

        assert_eq!(connector.state(), DeviceState::Scanning);
        assert_eq!(adapter.requests().last(), Some(&Request::StartScan(make_hid_service_uuid())));
    }

    #[test]
    fn radio_ready_without_connected_keyboards_scans() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::RadioReady { connected: vec![] }, &mut adapter);

        assert_eq!(adapter.take_requests(), vec![Request::StartScan(make_hid_service_uuid())]);
        assert_eq!(connector.state(), DeviceState::Scanning);
    }

    #[test]
    fn radio_ready_reuses_a_connected_keyboard() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::RadioReady { connected: vec![keyboard()] }, &mut adapter);

        assert_eq!(adapter.take_requests(), vec![Request::Connect(keyboard().id)]);
        assert_eq!(connector.state(), DeviceState::Connecting);
    }

    #[test]
    fn discovery_stops_scanning_and_connects() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::RadioReady { connected: vec![] }, &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::DeviceDiscovered(keyboard()), &mut adapter);
        connector.handle(AdapterEvent::DeviceDiscovered(DeviceIdentity::new("CC:DD", None)), &mut adapter);

        assert_eq!(adapter.take_requests(), vec![Request::StopScan, Request::Connect(keyboard().id)]);
        assert_eq!(connector.candidate(), Some(&keyboard()));
    }

    #[test]
    fn name_filter_skips_other_devices() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(Some("Corne".to_string()));
        connector.handle(AdapterEvent::RadioReady { connected: vec![] }, &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::DeviceDiscovered(DeviceIdentity::new("CC:DD", Some("MX Keys".to_string()))), &mut adapter);
        connector.handle(AdapterEvent::DeviceDiscovered(DeviceIdentity::new("EE:FF", None)), &mut adapter);
        assert!(adapter.requests().is_empty());
        assert_eq!(connector.state(), DeviceState::Scanning);

        connector.handle(AdapterEvent::DeviceDiscovered(keyboard()), &mut adapter);
        assert_eq!(connector.state(), DeviceState::Connecting);
    }

    #[test]
    fn connection_starts_the_walk() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::DeviceDiscovered(keyboard()), &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::Connected(keyboard()), &mut adapter);

        assert_eq!(connector.state(), DeviceState::Connected);
        assert_eq!(adapter.take_requests(), vec![Request::DiscoverServices {
            device: keyboard().id,
            filter: vec![make_battery_service_uuid()],
        }]);
    }

    #[test]
    fn connect_failure_resumes_scanning() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::DeviceDiscovered(keyboard()), &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::ConnectFailed {
            device: keyboard().id,
            error: DeviceError::Platform { message: "timeout".to_string() },
        }, &mut adapter);

        assert_eq!(connector.candidate(), None);
        assert_eq!(adapter.take_requests(), vec![Request::StartScan(make_hid_service_uuid())]);
    }

    #[test]
    fn disconnect_keeps_the_pairing_and_rescans() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::DeviceDiscovered(keyboard()), &mut adapter);
        connector.handle(AdapterEvent::Connected(keyboard()), &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::Disconnected(keyboard().id), &mut adapter);

        assert_eq!(connector.state(), DeviceState::Scanning);
        assert_eq!(connector.pairing().map(|p| p.identity().clone()), Some(keyboard()));
        assert_eq!(adapter.take_requests(), vec![Request::StartScan(make_hid_service_uuid())]);
    }

    #[test]
    fn disconnect_of_another_device_is_ignored() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::DeviceDiscovered(keyboard()), &mut adapter);
        connector.handle(AdapterEvent::Connected(keyboard()), &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::Disconnected(DeviceId::from("CC:DD")), &mut adapter);

        assert_eq!(connector.state(), DeviceState::Connected);
        assert!(adapter.requests().is_empty());
    }

    #[test]
    fn scan_failure_rescans() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::RadioReady { connected: vec![] }, &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::ScanFailed(DeviceError::NoAdapters), &mut adapter);

        assert_eq!(adapter.take_requests(), vec![Request::StartScan(make_hid_service_uuid())]);
    }

    #[test]
    fn gatt_events_after_disconnect_are_dropped() {
        let mut adapter = MockAdapter::new();
        let mut connector = Connector::new(None);
        connector.handle(AdapterEvent::DeviceDiscovered(keyboard()), &mut adapter);
        connector.handle(AdapterEvent::Connected(keyboard()), &mut adapter);
        connector.handle(AdapterEvent::Disconnected(keyboard().id), &mut adapter);
        adapter.take_requests();

        connector.handle(AdapterEvent::Gatt {
            device: keyboard().id,
            event: GattEvent::ServicesFound(Ok(vec![])),
        }, &mut adapter);

        assert!(adapter.requests().is_empty());
        assert!(connector.walker().is_none());
    }
}
