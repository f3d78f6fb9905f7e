//! [`BleAdapter`] backed by btleplug.
//!
//! Every request runs on its own tokio task and reports back on the event channel returned by
//! [`BtleAdapter::new`]. btleplug discovers the whole GATT tree of a peripheral at once, so the tree is fetched
//! on the first service discovery and the following levels are answered from it.
//!
//! Each connection gets a new generation. Results of requests made during an earlier connection of the same
//! device are dropped instead of being reported against the current one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, CentralState, Characteristic, Descriptor, Manager as _, Peripheral as _, ScanFilter, Service};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::select_all;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::adapter::{AdapterEvent, BleAdapter};
use crate::device::constants::{make_hid_service_uuid, CONNECT_DELAY};
use crate::device::types::{
    AttributeId, CharacteristicHandle, DescriptorHandle, DeviceId, DeviceIdentity, GattEvent, ServiceHandle,
};
use crate::error::DeviceError;

#[derive(Clone)]
enum Attribute {
    Service(Service),
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

struct Connection {
    generation: u64,
    cancel: CancellationToken,
    attributes: HashMap<AttributeId, Attribute>,
    subscribed: Vec<(CharacteristicHandle, Characteristic)>,
}

#[derive(Default)]
struct Shared {
    scanning: AtomicBool,
    next_attribute: AtomicU64,
    next_generation: AtomicU64,
    peripherals: Mutex<HashMap<DeviceId, Peripheral>>,
    connections: Mutex<HashMap<DeviceId, Connection>>,
}

impl Shared {
    fn peripheral(&self, device: &DeviceId) -> Result<Peripheral, DeviceError> {
        let peripherals = self.peripherals.lock().expect("Failed to lock peripherals");
        peripherals.get(device).cloned().ok_or_else(|| DeviceError::UnknownDevice(device.clone()))
    }

    fn remember(&self, device: DeviceId, peripheral: Peripheral) {
        let mut peripherals = self.peripherals.lock().expect("Failed to lock peripherals");
        peripherals.insert(device, peripheral);
    }

    fn open_connection(&self, device: DeviceId, cancel: CancellationToken) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.lock().expect("Failed to lock connections");
        let previous = connections.insert(device, Connection {
            generation,
            cancel,
            attributes: HashMap::new(),
            subscribed: Vec::new(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        generation
    }

    fn close_connection(&self, device: &DeviceId) {
        let mut connections = self.connections.lock().expect("Failed to lock connections");
        if let Some(connection) = connections.remove(device) {
            connection.cancel.cancel();
        }
    }

    fn generation(&self, device: &DeviceId) -> Result<u64, DeviceError> {
        let connections = self.connections.lock().expect("Failed to lock connections");
        connections
            .get(device)
            .map(|connection| connection.generation)
            .ok_or_else(|| DeviceError::UnknownDevice(device.clone()))
    }

    fn is_current(&self, device: &DeviceId, generation: u64) -> bool {
        let connections = self.connections.lock().expect("Failed to lock connections");
        connections.get(device).is_some_and(|connection| connection.generation == generation)
    }

    fn register(&self, device: &DeviceId, generation: u64, attribute: Attribute) -> Result<AttributeId, DeviceError> {
        let mut connections = self.connections.lock().expect("Failed to lock connections");
        let connection = connections
            .get_mut(device)
            .filter(|connection| connection.generation == generation)
            .ok_or_else(|| DeviceError::UnknownDevice(device.clone()))?;

        let id = AttributeId(self.next_attribute.fetch_add(1, Ordering::Relaxed));
        connection.attributes.insert(id, attribute);
        Ok(id)
    }

    fn attribute(&self, device: &DeviceId, id: AttributeId) -> Result<Attribute, DeviceError> {
        let connections = self.connections.lock().expect("Failed to lock connections");
        let connection = connections.get(device).ok_or_else(|| DeviceError::UnknownDevice(device.clone()))?;
        connection.attributes.get(&id).cloned().ok_or(DeviceError::UnknownAttribute(id))
    }

    fn characteristic(&self, device: &DeviceId, id: AttributeId) -> Result<Characteristic, DeviceError> {
        match self.attribute(device, id)? {
            Attribute::Characteristic(characteristic) => Ok(characteristic),
            _ => Err(DeviceError::UnknownAttribute(id)),
        }
    }

    fn set_subscribed(
        &self,
        device: &DeviceId,
        generation: u64,
        handle: &CharacteristicHandle,
        characteristic: Characteristic,
        enabled: bool,
    ) {
        let mut connections = self.connections.lock().expect("Failed to lock connections");
        if let Some(connection) = connections.get_mut(device).filter(|connection| connection.generation == generation) {
            connection.subscribed.retain(|(subscribed, _)| subscribed.id != handle.id);
            if enabled {
                connection.subscribed.push((handle.clone(), characteristic));
            }
        }
    }

    fn subscribed_with_uuid(&self, device: &DeviceId, uuid: Uuid) -> Vec<(CharacteristicHandle, Characteristic)> {
        let connections = self.connections.lock().expect("Failed to lock connections");
        connections
            .get(device)
            .map(|connection| {
                connection.subscribed
                    .iter()
                    .filter(|(handle, _)| handle.uuid == uuid)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn emit(sender: &UnboundedSender<AdapterEvent>, event: AdapterEvent) {
    if let Err(err) = sender.unbounded_send(event) {
        debug!("Dropping adapter event, nobody is listening: {:?}", err.into_inner());
    }
}

/// Reports a GATT result unless the connection it was requested on is gone.
fn emit_gatt(shared: &Shared, sender: &UnboundedSender<AdapterEvent>, device: DeviceId, generation: u64, event: GattEvent) {
    if shared.is_current(&device, generation) {
        emit(sender, AdapterEvent::Gatt { device, event });
    } else {
        debug!("Dropping result of an earlier connection to {}: {:?}", device, event);
    }
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId(id.to_string())
}

async fn identify(peripheral: &Peripheral) -> DeviceIdentity {
    let name = match peripheral.properties().await {
        Ok(Some(properties)) => properties.local_name,
        Ok(None) => None,
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
    };
    DeviceIdentity::new(device_id(&peripheral.id()), name)
}

async fn advertises(peripheral: &Peripheral, service: &Uuid) -> bool {
    match peripheral.properties().await {
        Ok(Some(properties)) => properties.services.contains(service),
        Ok(None) => false,
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            false
        },
    }
}

/// Peripherals that are connected at the platform level and expose `service`.
async fn connected_peripherals(adapters: &[Adapter], shared: &Shared, service: &Uuid) -> Vec<DeviceIdentity> {
    let mut connected = Vec::new();
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let has_service = advertises(&peripheral, service).await
                || peripheral.services().iter().any(|s| &s.uuid == service);
            if !has_service {
                continue;
            }

            let identity = identify(&peripheral).await;
            shared.remember(identity.id.clone(), peripheral);
            connected.push(identity);
        }
    }
    connected
}

async fn find_peripheral(adapters: &[Adapter], id: &PeripheralId) -> Option<Peripheral> {
    for adapter in adapters {
        if let Ok(peripheral) = adapter.peripheral(id).await {
            return Some(peripheral);
        }
    }
    None
}

fn spawn_notification_reader(
    shared: Arc<Shared>,
    sender: UnboundedSender<AdapterEvent>,
    device: DeviceId,
    generation: u64,
    peripheral: Peripheral,
    cancel: CancellationToken,
) {
    spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to listen for notifications of {}: {}", device, err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                notification = notifications.next() => {
                    let Some(notification) = notification else {
                        break 'mainloop;
                    };

                    let subscribed = shared.subscribed_with_uuid(&device, notification.uuid);
                    match subscribed.as_slice() {
                        [] => debug!("Notification for unsubscribed characteristic {}", notification.uuid),
                        [(handle, _)] => emit_gatt(&shared, &sender, device.clone(), generation, GattEvent::ValueUpdated {
                            characteristic: handle.clone(),
                            result: Ok(notification.value),
                        }),
                        // the notification does not tell which of them changed
                        several => for (handle, characteristic) in several {
                            let result = peripheral.read(characteristic).await.map_err(DeviceError::from);
                            emit_gatt(&shared, &sender, device.clone(), generation, GattEvent::ValueUpdated {
                                characteristic: handle.clone(),
                                result,
                            });
                        },
                    }
                },
            }
        }
        debug!("Notification reader of {} stopped", device);
    });
}

pub struct BtleAdapter {
    _manager: Manager,
    adapters: Vec<Adapter>,
    shared: Arc<Shared>,
    sender: UnboundedSender<AdapterEvent>,
    cancel: CancellationToken,
}

impl BtleAdapter {
    pub async fn new() -> Result<(Self, UnboundedReceiver<AdapterEvent>), DeviceError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(DeviceError::NoAdapters);
        }

        let mut central_events = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
            central_events.push(adapter.events().await?);
        }

        let (sender, receiver) = unbounded();
        let btle = BtleAdapter {
            _manager: manager,
            adapters,
            shared: Arc::new(Shared::default()),
            sender,
            cancel: CancellationToken::new(),
        };

        let shared = btle.shared.clone();
        let adapters = btle.adapters.clone();
        let sender = btle.sender.clone();
        let cancel = btle.cancel.clone();
        spawn(async move {
            let mut central_events = select_all(central_events);
            let hid_service_uuid = make_hid_service_uuid();

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    Some(event) = central_events.next() => match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            if !shared.scanning.load(Ordering::SeqCst) {
                                continue 'mainloop;
                            }
                            let Some(peripheral) = find_peripheral(&adapters, &id).await else {
                                continue 'mainloop;
                            };
                            // Some environments ignore the filter, so make sure to check the service uuid again
                            if !advertises(&peripheral, &hid_service_uuid).await {
                                continue 'mainloop;
                            }

                            let identity = identify(&peripheral).await;
                            shared.remember(identity.id.clone(), peripheral);
                            emit(&sender, AdapterEvent::DeviceDiscovered(identity));
                        },
                        CentralEvent::DeviceDisconnected(id) => {
                            let device = device_id(&id);
                            shared.close_connection(&device);
                            emit(&sender, AdapterEvent::Disconnected(device));
                        },
                        CentralEvent::StateUpdate(CentralState::PoweredOn) => {
                            info!("Bluetooth radio powered on");
                            let connected = connected_peripherals(&adapters, &shared, &hid_service_uuid).await;
                            emit(&sender, AdapterEvent::RadioReady { connected });
                        },
                        CentralEvent::StateUpdate(state) => debug!("Bluetooth radio state {:?}", state),
                        _ => {},
                    },
                }
            }
        });

        Ok((btle, receiver))
    }

    fn gatt(&self, device: &DeviceId, event: GattEvent) {
        emit(&self.sender, AdapterEvent::Gatt { device: device.clone(), event });
    }
}

impl Drop for BtleAdapter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl BleAdapter for BtleAdapter {
    fn retrieve_connected(&mut self, service: Uuid) -> Result<(), DeviceError> {
        let adapters = self.adapters.clone();
        let shared = self.shared.clone();
        let sender = self.sender.clone();

        spawn(async move {
            let connected = connected_peripherals(&adapters, &shared, &service).await;
            emit(&sender, AdapterEvent::RadioReady { connected });
        });
        Ok(())
    }

    fn start_scan(&mut self, service: Uuid) -> Result<(), DeviceError> {
        self.shared.scanning.store(true, Ordering::SeqCst);
        let adapters = self.adapters.clone();
        let shared = self.shared.clone();
        let sender = self.sender.clone();

        spawn(async move {
            let filter = ScanFilter { services: vec![service] };
            for adapter in &adapters {
                if let Err(err) = adapter.start_scan(filter.clone()).await {
                    shared.scanning.store(false, Ordering::SeqCst);
                    sleep(Duration::from_millis(CONNECT_DELAY)).await;
                    emit(&sender, AdapterEvent::ScanFailed(err.into()));
                    return;
                }
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        let adapters = self.adapters.clone();

        spawn(async move {
            for adapter in &adapters {
                if let Err(err) = adapter.stop_scan().await {
                    debug!("Failed to stop adapter scan cleanly: {:?}", err);
                }
            }
        });
        Ok(())
    }

    fn connect(&mut self, device: &DeviceId) -> Result<(), DeviceError> {
        let peripheral = self.shared.peripheral(device)?;
        let device = device.clone();
        let shared = self.shared.clone();
        let sender = self.sender.clone();
        let connection_cancel = self.cancel.child_token();

        spawn(async move {
            let result = async {
                if !peripheral.is_connected().await? {
                    peripheral.connect().await?;
                }
                Ok::<(), DeviceError>(())
            }.await;

            match result {
                Ok(()) => {
                    let identity = identify(&peripheral).await;
                    let generation = shared.open_connection(device.clone(), connection_cancel.clone());
                    spawn_notification_reader(shared, sender.clone(), device, generation, peripheral, connection_cancel);
                    emit(&sender, AdapterEvent::Connected(identity));
                },
                Err(error) => emit(&sender, AdapterEvent::ConnectFailed { device, error }),
            }
        });
        Ok(())
    }

    fn discover_services(&mut self, device: &DeviceId, filter: &[Uuid]) -> Result<(), DeviceError> {
        let peripheral = self.shared.peripheral(device)?;
        let generation = self.shared.generation(device)?;
        let device = device.clone();
        let filter = filter.to_vec();
        let shared = self.shared.clone();
        let sender = self.sender.clone();

        spawn(async move {
            let result = async {
                peripheral.discover_services().await?;

                let mut handles = Vec::new();
                for service in peripheral.services() {
                    if !filter.is_empty() && !filter.contains(&service.uuid) {
                        continue;
                    }
                    let uuid = service.uuid;
                    let id = shared.register(&device, generation, Attribute::Service(service))?;
                    handles.push(ServiceHandle { id, uuid });
                }
                Ok::<Vec<ServiceHandle>, DeviceError>(handles)
            }.await;

            emit_gatt(&shared, &sender, device, generation, GattEvent::ServicesFound(result));
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        device: &DeviceId,
        service: &ServiceHandle,
        filter: &[Uuid],
    ) -> Result<(), DeviceError> {
        let generation = self.shared.generation(device)?;
        let result: Result<Vec<CharacteristicHandle>, DeviceError> = match self.shared.attribute(device, service.id) {
            Ok(Attribute::Service(found)) => found.characteristics
                .into_iter()
                .filter(|characteristic| filter.is_empty() || filter.contains(&characteristic.uuid))
                .map(|characteristic| -> Result<CharacteristicHandle, DeviceError> {
                    let uuid = characteristic.uuid;
                    let id = self.shared.register(device, generation, Attribute::Characteristic(characteristic))?;
                    Ok(CharacteristicHandle { id, uuid, service: service.id })
                })
                .collect(),
            Ok(_) => Err(DeviceError::UnknownAttribute(service.id)),
            Err(err) => Err(err),
        };

        self.gatt(device, GattEvent::CharacteristicsFound { service: service.clone(), result });
        Ok(())
    }

    fn discover_descriptors(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), DeviceError> {
        let generation = self.shared.generation(device)?;
        let result: Result<Vec<DescriptorHandle>, DeviceError> = self.shared.characteristic(device, characteristic.id).and_then(|found| {
            found.descriptors
                .into_iter()
                .map(|descriptor| -> Result<DescriptorHandle, DeviceError> {
                    let uuid = descriptor.uuid;
                    let id = self.shared.register(device, generation, Attribute::Descriptor(descriptor))?;
                    Ok(DescriptorHandle { id, uuid, characteristic: characteristic.clone() })
                })
                .collect()
        });

        self.gatt(device, GattEvent::DescriptorsFound { characteristic: characteristic.clone(), result });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), DeviceError> {
        let peripheral = self.shared.peripheral(device)?;
        let found = self.shared.characteristic(device, characteristic.id)?;
        let generation = self.shared.generation(device)?;
        let device = device.clone();
        let handle = characteristic.clone();
        let shared = self.shared.clone();
        let sender = self.sender.clone();

        spawn(async move {
            let result = peripheral.read(&found).await.map_err(DeviceError::from);
            emit_gatt(&shared, &sender, device, generation, GattEvent::ValueUpdated { characteristic: handle, result });
        });
        Ok(())
    }

    fn read_descriptor(&mut self, device: &DeviceId, descriptor: &DescriptorHandle) -> Result<(), DeviceError> {
        let peripheral = self.shared.peripheral(device)?;
        let found = match self.shared.attribute(device, descriptor.id)? {
            Attribute::Descriptor(found) => found,
            _ => return Err(DeviceError::UnknownAttribute(descriptor.id)),
        };
        let generation = self.shared.generation(device)?;
        let device = device.clone();
        let handle = descriptor.clone();
        let shared = self.shared.clone();
        let sender = self.sender.clone();

        spawn(async move {
            let result = peripheral.read_descriptor(&found).await.map_err(DeviceError::from);
            emit_gatt(&shared, &sender, device, generation, GattEvent::DescriptorValue { descriptor: handle, result });
        });
        Ok(())
    }

    fn set_notify(
        &mut self,
        device: &DeviceId,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), DeviceError> {
        let peripheral = self.shared.peripheral(device)?;
        let found = self.shared.characteristic(device, characteristic.id)?;
        let generation = self.shared.generation(device)?;
        let device = device.clone();
        let handle = characteristic.clone();
        let shared = self.shared.clone();
        let sender = self.sender.clone();

        spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&found).await
            } else {
                peripheral.unsubscribe(&found).await
            };
            let result = result.map(|_| enabled).map_err(DeviceError::from);

            if result.is_ok() {
                shared.set_subscribed(&device, generation, &handle, found, enabled);
            }
            emit_gatt(&shared, &sender, device, generation, GattEvent::NotifyStateChanged { characteristic: handle, result });
        });
        Ok(())
    }
}
