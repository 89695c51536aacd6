//! # btleplug Transport
//!
//! [`Transport`] implementation over the host Bluetooth stack.
//!
//! Each request is spawned as its own task on the loop's runtime and reports
//! back through the event loop channel. The connected peripheral and its
//! notification pump live in a small shared slot; the lock is never held
//! across an await.

use crate::connection::LoopEvent;
use crate::device_scanner::{self, device_id};
use crate::error::TransportError;
use crate::gatt::{CharacteristicHandle, GattService};
use crate::transport::{DeviceId, Transport, TransportEvent};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

#[derive(Default)]
struct LinkSlot {
    peripheral: Option<Peripheral>,
    pump: Option<JoinHandle<()>>,
}

impl LinkSlot {
    fn clear(&mut self) -> Option<Peripheral> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.peripheral.take()
    }
}

pub struct BtleTransport {
    adapter: Option<Adapter>,
    unavailable: Option<TransportError>,
    loop_tx: UnboundedSender<LoopEvent>,
    device: Option<DeviceId>,
    link: Arc<Mutex<LinkSlot>>,
    scan_task: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
    /// Writes not yet confirmed; a local disconnect waits for them
    writes: Vec<JoinHandle<()>>,
}

impl BtleTransport {
    /// Open the first Bluetooth adapter
    pub async fn open(loop_tx: UnboundedSender<LoopEvent>) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::ScanFailed(format!("Failed to create BLE manager: {}", e)))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::ScanFailed(format!("Failed to get adapters: {}", e)))?;
        let adapter = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(info) => log::info!("Using Bluetooth adapter {}", info),
            Err(e) => log::debug!("Adapter info unavailable: {}", e),
        }
        Ok(Self::build(Some(adapter), None, loop_tx))
    }

    /// A transport that fails every scan with `reason`
    pub fn unavailable(loop_tx: UnboundedSender<LoopEvent>, reason: TransportError) -> Self {
        Self::build(None, Some(reason), loop_tx)
    }

    fn build(
        adapter: Option<Adapter>,
        unavailable: Option<TransportError>,
        loop_tx: UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            adapter,
            unavailable,
            loop_tx,
            device: None,
            link: Arc::new(Mutex::new(LinkSlot::default())),
            scan_task: None,
            link_task: None,
            writes: Vec::new(),
        }
    }

    fn post(&self, event: TransportEvent) {
        post(&self.loop_tx, event);
    }

    fn peripheral(&self) -> Option<Peripheral> {
        self.link.lock().ok().and_then(|slot| slot.peripheral.clone())
    }

    /// Run `op` against the connected peripheral on a separate task
    fn with_peripheral<F, Fut>(&self, what: &'static str, op: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(Peripheral, UnboundedSender<LoopEvent>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.peripheral() {
            Some(peripheral) => Some(tokio::spawn(op(peripheral, self.loop_tx.clone()))),
            None => {
                log::warn!("Cannot {}: no connected peripheral", what);
                None
            }
        }
    }
}

fn post(loop_tx: &UnboundedSender<LoopEvent>, event: TransportEvent) {
    if loop_tx.send(LoopEvent::Transport(event)).is_err() {
        log::debug!("Event loop gone, dropping transport event");
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: CharacteristicHandle,
) -> Result<Characteristic, String> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
        .ok_or_else(|| format!("characteristic {} not found", handle.uuid))
}

/// Post notifications from `peripheral` until its stream ends
async fn pump_notifications(peripheral: Peripheral, loop_tx: UnboundedSender<LoopEvent>) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Could not get notification stream: {}", e);
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        post(
            &loop_tx,
            TransportEvent::Notification {
                uuid: notification.uuid,
                value: notification.value,
            },
        );
    }
    log::debug!("Notification stream ended");
}

impl Transport for BtleTransport {
    fn start_scan(&mut self) {
        let Some(adapter) = self.adapter.clone() else {
            let reason = self
                .unavailable
                .clone()
                .unwrap_or(TransportError::NoAdapter);
            self.post(TransportEvent::ScanFailed(reason.to_string()));
            return;
        };
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        self.scan_task = Some(tokio::spawn(device_scanner::run_scan(
            adapter,
            self.loop_tx.clone(),
        )));
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        if let Some(adapter) = self.adapter.clone() {
            tokio::spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    log::warn!("Failed to stop scan: {}", e);
                }
            });
        }
    }

    fn connect(&mut self, device: &DeviceId) {
        let Some(adapter) = self.adapter.clone() else {
            self.post(TransportEvent::ConnectFailed {
                device: device.clone(),
                reason: TransportError::NoAdapter.to_string(),
            });
            return;
        };
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.device = Some(device.clone());

        let device = device.clone();
        let link = self.link.clone();
        let loop_tx = self.loop_tx.clone();
        self.link_task = Some(tokio::spawn(async move {
            let connect_failed = |reason: String| TransportEvent::ConnectFailed {
                device: device.clone(),
                reason,
            };

            let peripheral = match adapter.peripherals().await {
                Ok(peripherals) => peripherals
                    .into_iter()
                    .find(|p| device_id(&p.id()) == device),
                Err(e) => {
                    post(&loop_tx, connect_failed(e.to_string()));
                    return;
                }
            };
            let Some(peripheral) = peripheral else {
                post(&loop_tx, connect_failed("device no longer visible".to_string()));
                return;
            };

            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    post(&loop_tx, connect_failed(e.to_string()));
                    return;
                }
            };
            if let Err(e) = peripheral.connect().await {
                post(&loop_tx, connect_failed(e.to_string()));
                return;
            }
            if let Ok(mut slot) = link.lock() {
                slot.clear();
                slot.peripheral = Some(peripheral.clone());
            }
            post(&loop_tx, TransportEvent::Connected(device.clone()));

            // Watch for the link dropping on the remote side
            let id = peripheral.id();
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        if let Ok(mut slot) = link.lock() {
                            slot.clear();
                        }
                        post(
                            &loop_tx,
                            TransportEvent::Disconnected {
                                device: device.clone(),
                                reason: "link lost".to_string(),
                            },
                        );
                        break;
                    }
                }
            }
        }));
    }

    fn discover_services(&mut self) {
        let link = self.link.clone();
        self.with_peripheral("discover services", move |peripheral, loop_tx| async move {
            if let Err(e) = peripheral.discover_services().await {
                post(&loop_tx, TransportEvent::ServiceDiscoveryFailed(e.to_string()));
                return;
            }
            let services: Vec<GattService> = peripheral
                .services()
                .into_iter()
                .map(|s| GattService {
                    uuid: s.uuid,
                    characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
                })
                .collect();

            let pump = tokio::spawn(pump_notifications(peripheral, loop_tx.clone()));
            if let Ok(mut slot) = link.lock() {
                if let Some(old) = slot.pump.replace(pump) {
                    old.abort();
                }
            }
            post(&loop_tx, TransportEvent::ServicesDiscovered(services));
        });
    }

    fn subscribe(&mut self, characteristic: CharacteristicHandle) {
        let Some(peripheral) = self.peripheral() else {
            self.post(TransportEvent::SubscribeFailed {
                uuid: characteristic.uuid,
                reason: "not connected".to_string(),
            });
            return;
        };
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Ok(c) => peripheral.subscribe(&c).await.map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            let event = match result {
                Ok(()) => TransportEvent::Subscribed(characteristic.uuid),
                Err(reason) => {
                    log::warn!(
                        "Could not subscribe to {} notifications: {}",
                        characteristic.role.name(),
                        reason
                    );
                    TransportEvent::SubscribeFailed {
                        uuid: characteristic.uuid,
                        reason,
                    }
                }
            };
            post(&loop_tx, event);
        });
    }

    fn read(&mut self, characteristic: CharacteristicHandle) {
        let Some(peripheral) = self.peripheral() else {
            self.post(TransportEvent::ReadCompleted {
                uuid: characteristic.uuid,
                result: Err("not connected".to_string()),
            });
            return;
        };
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Ok(c) => peripheral.read(&c).await.map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            post(
                &loop_tx,
                TransportEvent::ReadCompleted {
                    uuid: characteristic.uuid,
                    result,
                },
            );
        });
    }

    fn write(&mut self, characteristic: CharacteristicHandle, value: Vec<u8>) {
        self.writes.retain(|task| !task.is_finished());
        let task = self.with_peripheral("write", move |peripheral, _| async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Ok(c) => peripheral
                    .write(&c, &value, WriteType::WithResponse)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                log::warn!("Write to {} failed: {}", characteristic.role.name(), e);
            }
        });
        self.writes.extend(task);
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        let peripheral = self.link.lock().ok().and_then(|mut slot| slot.clear());
        let Some(device) = self.device.take() else {
            return;
        };
        let writes = std::mem::take(&mut self.writes);
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            // Let a final command (logging off, cycle stop) reach the scale first
            for write in writes {
                let _ = write.await;
            }
            if let Some(peripheral) = peripheral {
                if let Err(e) = peripheral.disconnect().await {
                    log::warn!("Disconnect failed: {}", e);
                }
            }
            post(
                &loop_tx,
                TransportEvent::Disconnected {
                    device,
                    reason: "local disconnect".to_string(),
                },
            );
        });
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        for task in self.writes.drain(..) {
            task.abort();
        }
        if let Ok(mut slot) = self.link.lock() {
            slot.clear();
        }
    }
}
