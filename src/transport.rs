//! # Bluetooth Transport Interface
//!
//! The seam between the device session and the host Bluetooth stack.
//!
//! Every request is fire-and-forget: implementations start the operation and
//! return immediately. Completions, failures and unsolicited notifications come
//! back as [`TransportEvent`]s on the event loop channel, in whatever order the
//! stack produces them.

use crate::gatt::{CharacteristicHandle, GattService};
use uuid::Uuid;

/// Opaque identifier of a discovered peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Advertisement {
        device: DeviceId,
        local_name: Option<String>,
    },
    ScanFailed(String),
    Connected(DeviceId),
    ConnectFailed {
        device: DeviceId,
        reason: String,
    },
    ServicesDiscovered(Vec<GattService>),
    ServiceDiscoveryFailed(String),
    /// Notifications for the characteristic are now enabled
    Subscribed(Uuid),
    SubscribeFailed {
        uuid: Uuid,
        reason: String,
    },
    /// The peer changed its GATT table; resolved handles are stale
    ServicesInvalidated,
    Notification {
        uuid: Uuid,
        value: Vec<u8>,
    },
    ReadCompleted {
        uuid: Uuid,
        result: Result<Vec<u8>, String>,
    },
    Disconnected {
        device: DeviceId,
        reason: String,
    },
}

pub trait Transport {
    fn start_scan(&mut self);
    fn stop_scan(&mut self);
    fn connect(&mut self, device: &DeviceId);
    fn discover_services(&mut self);
    fn subscribe(&mut self, characteristic: CharacteristicHandle);
    fn read(&mut self, characteristic: CharacteristicHandle);
    fn write(&mut self, characteristic: CharacteristicHandle, value: Vec<u8>);
    fn disconnect(&mut self);
}
