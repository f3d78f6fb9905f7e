use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::battery::history::BatteryReading;
use crate::device::adapter::{AdapterEvent, BleAdapter};
use crate::device::connector::Connector;
use crate::device::types::{DeviceState, MonitorEvent};

/// Battery monitor of one split keyboard.
///
/// All adapter events must be fed from a single task, which is what [`Monitor::run`] does.
pub struct Monitor<A: BleAdapter> {
    adapter: A,
    connector: Connector,
    senders: Vec<UnboundedSender<MonitorEvent>>,
    previous_state: Option<DeviceState>,
}

impl<A: BleAdapter> Monitor<A> {
    pub fn new(adapter: A, device_name: Option<String>) -> Self {
        Monitor {
            adapter,
            connector: Connector::new(device_name),
            senders: Vec::new(),
            previous_state: None,
        }
    }

    /// Registers an observer. It receives every state change and every reading appended from now on.
    pub fn subscribe(&mut self) -> UnboundedReceiver<MonitorEvent> {
        let (sender, receiver) = unbounded();
        self.senders.push(sender);
        receiver
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn state(&self) -> DeviceState {
        self.connector.state()
    }

    pub fn current_central_level(&self) -> u8 {
        self.connector.pairing().map_or(0, |pairing| pairing.history().current_central_level())
    }

    pub fn current_peripheral_level(&self) -> u8 {
        self.connector.pairing().map_or(0, |pairing| pairing.history().current_peripheral_level())
    }

    pub fn history(&self) -> &[BatteryReading] {
        match self.connector.pairing() {
            Some(pairing) => pairing.history().history(),
            None => &[],
        }
    }

    pub fn peripheral_label(&self) -> Option<&str> {
        self.connector.pairing().and_then(|pairing| pairing.peripheral_label())
    }

    pub fn device_name(&self) -> Option<&str> {
        self.connector.pairing().map(|pairing| pairing.identity().display_name())
    }

    pub fn start(&mut self) {
        self.connector.start(&mut self.adapter);
        self.publish_state();
    }

    pub fn handle_event(&mut self, event: AdapterEvent) {
        debug!("Adapter event {:?}", event);
        if let Some(reading) = self.connector.handle(event, &mut self.adapter) {
            self.publish(MonitorEvent::Reading(reading));
        }
        self.publish_state();
    }

    /// Processes adapter events until `cancel` is cancelled or the event stream ends.
    pub async fn run<S>(mut self, mut events: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = AdapterEvent> + Unpin,
    {
        self.start();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.next() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Bluetooth adapter event stream ended");
                        break 'mainloop;
                    },
                },
            }
        }

        self
    }

    fn publish_state(&mut self) {
        let state = self.connector.state();
        if self.previous_state != Some(state) {
            info!("Keyboard state: {}", state);
            self.previous_state = Some(state);
            self.publish(MonitorEvent::StateChange(state));
        }
    }

    fn publish(&mut self, event: MonitorEvent) {
        // observers that went away are dropped
        self.senders.retain(|sender| sender.unbounded_send(event.clone()).is_ok());
    }
}
