//! # Device Session Module
//!
//! Connection state machine for one LoggingScale.
//!
//! ## Lifecycle
//! ```text
//! Idle -> Scanning -> Connecting -> DiscoveringServices -> Ready
//!   ^        |            |                 |               |
//!   |     timeout   FailedToConnect   FailedToConnect   Disconnecting
//!   |        |            |                 |               |
//!   +--------+------------+-----------------+--- Disconnected(reason)
//! ```
//!
//! The session never blocks. Requests go to the [`Transport`] and completions
//! come back through [`DeviceSession::handle_transport_event`]. Everything the
//! session wants the rest of the app to know is queued as a [`ScaleEvent`] and
//! collected with [`DeviceSession::drain_events`].

use crate::clock::Clock;
use crate::codec::{self, Grams};
use crate::connection::LoopEvent;
use crate::error::{PreconditionError, TransportError};
use crate::gatt::{CharRole, CharacteristicHandle, GattService, ScaleCharacteristics};
use crate::timer::{self, TimerHandle, TimerIds};
use crate::transport::{DeviceId, Transport, TransportEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnecting,
    Disconnected(String),
    FailedToConnect(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassSource {
    Live,
    LoggingFeed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassSample {
    pub value: Grams,
    pub source: MassSource,
    pub observed_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleEvent {
    ScanStarted,
    /// Scan window elapsed without a matching advertisement
    ScanTimedOut,
    ScanFailed(TransportError),
    DeviceFound { device: DeviceId, name: String },
    Connecting(DeviceId),
    Connected(DeviceId),
    Ready(DeviceId),
    Disconnecting(DeviceId),
    Disconnected { device: DeviceId, reason: String },
    FailedToConnect { device: DeviceId, reason: TransportError },
    MassUpdated(MassSample),
    LoggingSample(MassSample),
    TargetMassRead(Grams),
    ShotStatusChanged(bool),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Substring the advertised local name must contain
    pub name_filter: String,
    pub scan_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name_filter: "LoggingScale".to_string(),
            scan_timeout: Duration::from_secs(10),
        }
    }
}

pub struct DeviceSession<T: Transport> {
    transport: T,
    settings: SessionSettings,
    clock: Arc<dyn Clock>,
    loop_tx: UnboundedSender<LoopEvent>,
    state: ConnectionState,
    device: Option<DeviceId>,
    characteristics: Option<ScaleCharacteristics>,
    /// Notify characteristics still waiting for a subscription ack
    pending_subscriptions: Vec<Uuid>,
    scan_timer: Option<TimerHandle>,
    timer_ids: TimerIds,
    outbox: VecDeque<ScaleEvent>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(
        transport: T,
        settings: SessionSettings,
        clock: Arc<dyn Clock>,
        loop_tx: UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            transport,
            settings,
            clock,
            loop_tx,
            state: ConnectionState::Idle,
            device: None,
            characteristics: None,
            pending_subscriptions: Vec::new(),
            scan_timer: None,
            timer_ids: TimerIds::default(),
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    pub fn drain_events(&mut self) -> Vec<ScaleEvent> {
        self.outbox.drain(..).collect()
    }

    fn emit(&mut self, event: ScaleEvent) {
        self.outbox.push_back(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("Scale session: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Begin scanning for the scale. Only valid from Idle.
    pub fn start_scan(&mut self) -> Result<(), PreconditionError> {
        if self.state != ConnectionState::Idle {
            return Err(PreconditionError::Busy(self.state.clone()));
        }
        self.set_state(ConnectionState::Scanning);
        self.transport.start_scan();

        let id = self.timer_ids.next();
        self.scan_timer = Some(TimerHandle::schedule(
            id,
            self.settings.scan_timeout,
            self.loop_tx.clone(),
            LoopEvent::ScanTimeout(id),
        ));
        self.emit(ScaleEvent::ScanStarted);
        Ok(())
    }

    pub fn handle_scan_timeout(&mut self, id: u64) {
        if !timer::take_if_current(&mut self.scan_timer, id) {
            return;
        }
        if self.state == ConnectionState::Scanning {
            log::info!(
                "No device matching '{}' found within {:?}",
                self.settings.name_filter,
                self.settings.scan_timeout
            );
            self.transport.stop_scan();
            self.set_state(ConnectionState::Idle);
            self.emit(ScaleEvent::ScanTimedOut);
        }
    }

    fn cancel_scan_timer(&mut self) {
        if let Some(timer) = self.scan_timer.take() {
            timer.cancel();
        }
    }

    /// Tear down the current link, or abandon a scan in progress
    pub fn disconnect(&mut self) -> Result<(), PreconditionError> {
        match self.state {
            ConnectionState::Scanning => {
                self.cancel_scan_timer();
                self.transport.stop_scan();
                self.set_state(ConnectionState::Idle);
                Ok(())
            }
            ConnectionState::Connecting
            | ConnectionState::DiscoveringServices
            | ConnectionState::Ready => {
                self.drop_handles();
                self.set_state(ConnectionState::Disconnecting);
                let device = self.device.clone().unwrap_or_else(|| DeviceId(String::new()));
                self.emit(ScaleEvent::Disconnecting(device));
                self.transport.disconnect();
                Ok(())
            }
            _ => Err(PreconditionError::NotConnected),
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement { device, local_name } => {
                self.on_advertisement(device, local_name)
            }
            TransportEvent::ScanFailed(reason) => {
                if self.state == ConnectionState::Scanning {
                    log::warn!("Scan failed: {}", reason);
                    self.cancel_scan_timer();
                    self.set_state(ConnectionState::Idle);
                    self.emit(ScaleEvent::ScanFailed(TransportError::ScanFailed(reason)));
                }
            }
            TransportEvent::Connected(device) => {
                if self.state == ConnectionState::Connecting && self.is_current(&device) {
                    self.set_state(ConnectionState::DiscoveringServices);
                    self.emit(ScaleEvent::Connected(device));
                    self.transport.discover_services();
                } else {
                    log::debug!("Ignoring connect completion for {} in {:?}", device, self.state);
                }
            }
            TransportEvent::ConnectFailed { device, reason } => {
                if self.state == ConnectionState::Connecting && self.is_current(&device) {
                    let device_name = device.to_string();
                    self.fail(TransportError::ConnectFailed {
                        device: device_name,
                        reason,
                    });
                }
            }
            TransportEvent::ServicesDiscovered(services) => self.on_services(services),
            TransportEvent::ServiceDiscoveryFailed(reason) => {
                if self.state == ConnectionState::DiscoveringServices {
                    self.fail(TransportError::ServiceDiscovery(reason));
                    self.transport.disconnect();
                }
            }
            TransportEvent::Subscribed(uuid) => self.on_subscribed(uuid),
            TransportEvent::SubscribeFailed { uuid, reason } => {
                self.on_subscribe_failed(uuid, reason)
            }
            TransportEvent::ServicesInvalidated => {
                if self.state == ConnectionState::Ready {
                    log::info!("Services invalidated, rediscovering");
                    self.drop_handles();
                    self.set_state(ConnectionState::DiscoveringServices);
                    self.transport.discover_services();
                }
            }
            TransportEvent::Notification { uuid, value } => self.on_notification(uuid, &value),
            TransportEvent::ReadCompleted { uuid, result } => self.on_read(uuid, result),
            TransportEvent::Disconnected { device, reason } => self.on_disconnected(device, reason),
        }
    }

    fn drop_handles(&mut self) {
        self.characteristics = None;
        self.pending_subscriptions.clear();
    }

    fn is_current(&self, device: &DeviceId) -> bool {
        self.device.as_ref() == Some(device)
    }

    fn on_advertisement(&mut self, device: DeviceId, local_name: Option<String>) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        let name = match local_name {
            Some(name) if name.contains(&self.settings.name_filter) => name,
            other => {
                log::debug!("Skipping advertisement from {} ({:?})", device, other);
                return;
            }
        };

        log::info!("Found {} at {}", name, device);
        self.cancel_scan_timer();
        self.transport.stop_scan();
        self.device = Some(device.clone());
        self.emit(ScaleEvent::DeviceFound {
            device: device.clone(),
            name,
        });
        self.set_state(ConnectionState::Connecting);
        self.emit(ScaleEvent::Connecting(device.clone()));
        self.transport.connect(&device);
    }

    fn on_services(&mut self, services: Vec<GattService>) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        match ScaleCharacteristics::resolve(&services) {
            Ok(characteristics) => {
                self.pending_subscriptions.clear();
                for handle in characteristics.notify_handles() {
                    self.pending_subscriptions.push(handle.uuid);
                    self.transport.subscribe(handle);
                }
                self.characteristics = Some(characteristics);
            }
            Err(err) => {
                self.fail(err);
                self.transport.disconnect();
            }
        }
    }

    /// Ready once every notify characteristic has acknowledged its subscription
    fn on_subscribed(&mut self, uuid: Uuid) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        let before = self.pending_subscriptions.len();
        self.pending_subscriptions.retain(|pending| *pending != uuid);
        if self.pending_subscriptions.len() == before {
            log::debug!("Ignoring subscription ack for {}", uuid);
            return;
        }
        if self.pending_subscriptions.is_empty() && self.characteristics.is_some() {
            self.set_state(ConnectionState::Ready);
            let device = self.device.clone().unwrap_or_else(|| DeviceId(String::new()));
            self.emit(ScaleEvent::Ready(device));
        }
    }

    fn on_subscribe_failed(&mut self, uuid: Uuid, reason: String) {
        if self.state != ConnectionState::DiscoveringServices
            || !self.pending_subscriptions.contains(&uuid)
        {
            return;
        }
        let characteristic = self
            .characteristics
            .as_ref()
            .and_then(|chars| chars.role_of(uuid))
            .map_or("notify", |role| role.name());
        self.fail(TransportError::SubscribeFailed {
            characteristic,
            reason,
        });
        self.transport.disconnect();
    }

    fn on_notification(&mut self, uuid: Uuid, value: &[u8]) {
        let role = match (&self.state, &self.characteristics) {
            (ConnectionState::Ready, Some(chars)) => chars.role_of(uuid),
            _ => return,
        };
        log::debug!("Notification {:?}: {:02X?}", role, value);

        match role {
            Some(CharRole::Mass) => {
                if let Some(sample) = self.decode_sample(value, MassSource::Live) {
                    self.emit(ScaleEvent::MassUpdated(sample));
                }
            }
            Some(CharRole::Logging) => {
                if let Some(sample) = self.decode_sample(value, MassSource::LoggingFeed) {
                    self.emit(ScaleEvent::LoggingSample(sample));
                }
            }
            Some(CharRole::ShotState) => match codec::decode_boolean_flag(value) {
                Ok(in_progress) => self.emit(ScaleEvent::ShotStatusChanged(in_progress)),
                Err(e) => log::debug!("Dropping shot state payload: {}", e),
            },
            _ => log::debug!("Unexpected notification from {}", uuid),
        }
    }

    fn decode_sample(&self, value: &[u8], source: MassSource) -> Option<MassSample> {
        match codec::decode_fixed_point_mass(value) {
            Ok(grams) => Some(MassSample {
                value: grams,
                source,
                observed_at: self.clock.now_ms(),
            }),
            Err(e) => {
                log::debug!("Dropping {:?} payload {:02X?}: {}", source, value, e);
                None
            }
        }
    }

    fn on_read(&mut self, uuid: Uuid, result: Result<Vec<u8>, String>) {
        let role = match (&self.state, &self.characteristics) {
            (ConnectionState::Ready, Some(chars)) => chars.role_of(uuid),
            _ => return,
        };
        if role != Some(CharRole::TargetMass) {
            return;
        }
        match result {
            Ok(bytes) => {
                let grams = codec::decode_fixed_point_mass(&bytes).unwrap_or_else(|e| {
                    log::debug!("Target mass payload unreadable ({}), using 0", e);
                    Grams::ZERO
                });
                self.emit(ScaleEvent::TargetMassRead(grams));
            }
            Err(reason) => log::warn!("Target mass read failed: {}", reason),
        }
    }

    fn on_disconnected(&mut self, device: DeviceId, reason: String) {
        if self.device.is_some() && !self.is_current(&device) {
            return;
        }
        match self.state {
            ConnectionState::Connecting => {
                self.fail(TransportError::ConnectFailed {
                    device: device.to_string(),
                    reason,
                });
            }
            ConnectionState::DiscoveringServices
            | ConnectionState::Ready
            | ConnectionState::Disconnecting => {
                self.drop_handles();
                self.set_state(ConnectionState::Disconnected(reason.clone()));
                self.emit(ScaleEvent::Disconnected { device, reason });
                self.device = None;
                self.set_state(ConnectionState::Idle);
            }
            _ => log::debug!("Ignoring disconnect from {} in {:?}", device, self.state),
        }
    }

    /// Abort the current connection attempt and return to Idle
    fn fail(&mut self, reason: TransportError) {
        log::warn!("Failed to connect: {}", reason);
        self.drop_handles();
        self.set_state(ConnectionState::FailedToConnect(reason.to_string()));
        let device = self.device.take().unwrap_or_else(|| DeviceId(String::new()));
        self.emit(ScaleEvent::FailedToConnect { device, reason });
        self.set_state(ConnectionState::Idle);
    }

    fn ready_handle(&self, role: CharRole) -> Result<CharacteristicHandle, PreconditionError> {
        match (&self.state, &self.characteristics) {
            (ConnectionState::Ready, Some(chars)) => Ok(chars.get(role)),
            _ => Err(PreconditionError::NotConnected),
        }
    }

    fn write_opcode(&mut self, role: CharRole, opcode: u8) -> Result<(), PreconditionError> {
        let handle = self.ready_handle(role)?;
        self.transport.write(handle, vec![opcode]);
        Ok(())
    }

    pub fn read_target_mass(&mut self) -> Result<(), PreconditionError> {
        let handle = self.ready_handle(CharRole::TargetMass)?;
        self.transport.read(handle);
        Ok(())
    }

    pub fn write_target_mass(&mut self, grams: Grams) -> Result<(), PreconditionError> {
        let handle = self.ready_handle(CharRole::TargetMass)?;
        self.transport
            .write(handle, codec::encode_fixed_point_mass(grams).to_vec());
        Ok(())
    }

    pub fn send_tare(&mut self) -> Result<(), PreconditionError> {
        self.write_opcode(CharRole::Tare, codec::TARE_OPCODE)
    }

    pub fn send_start_cycle(&mut self) -> Result<(), PreconditionError> {
        self.write_opcode(CharRole::ShotState, codec::CYCLE_START_OPCODE)
    }

    pub fn send_stop_cycle(&mut self) -> Result<(), PreconditionError> {
        self.write_opcode(CharRole::ShotState, codec::CYCLE_STOP_OPCODE)
    }

    pub fn start_logging_feed(&mut self) -> Result<(), PreconditionError> {
        self.write_opcode(CharRole::LogState, codec::LOGGING_ENABLE_OPCODE)
    }

    pub fn stop_logging_feed(&mut self) -> Result<(), PreconditionError> {
        self.write_opcode(CharRole::LogState, codec::LOGGING_DISABLE_OPCODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::ManualClock;
    use crate::gatt::{self, LOG_STATE_CHAR_UUID, MASS_CHAR_UUID, SHOT_STATE_CHAR_UUID};
    use crate::transport::mock::{MockTransport, TransportCall};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        session: DeviceSession<MockTransport>,
        transport: MockTransport,
        loop_rx: UnboundedReceiver<LoopEvent>,
        clock: ManualClock,
    }

    fn scale_id() -> DeviceId {
        DeviceId("AA:BB:CC:DD:EE:01".to_string())
    }

    fn harness() -> Harness {
        let transport = MockTransport::default();
        let clock = ManualClock::starting_at(1_000);
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let session = DeviceSession::new(
            transport.clone(),
            SessionSettings::default(),
            Arc::new(clock.clone()),
            loop_tx,
        );
        Harness {
            session,
            transport,
            loop_rx,
            clock,
        }
    }

    fn advertise(h: &mut Harness, name: &str) {
        h.session.handle_transport_event(TransportEvent::Advertisement {
            device: scale_id(),
            local_name: Some(name.to_string()),
        });
    }

    fn acknowledge_subscriptions(h: &mut Harness) {
        for uuid in [MASS_CHAR_UUID, gatt::LOGGING_CHAR_UUID, SHOT_STATE_CHAR_UUID] {
            h.session
                .handle_transport_event(TransportEvent::Subscribed(uuid));
        }
    }

    /// Drive the session to DiscoveringServices with the scale service found
    fn discovered_harness() -> Harness {
        let mut h = harness();
        h.session.start_scan().unwrap();
        advertise(&mut h, "LoggingScale-01");
        h.session
            .handle_transport_event(TransportEvent::Connected(scale_id()));
        h.session
            .handle_transport_event(TransportEvent::ServicesDiscovered(vec![gatt::scale_service()]));
        h
    }

    fn ready_harness() -> Harness {
        let mut h = discovered_harness();
        acknowledge_subscriptions(&mut h);
        assert!(h.session.is_ready());
        h.session.drain_events();
        h.transport.take_calls();
        h
    }

    fn notify(h: &mut Harness, uuid: Uuid, value: &[u8]) {
        h.session.handle_transport_event(TransportEvent::Notification {
            uuid,
            value: value.to_vec(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_returns_to_idle_without_failure() {
        let mut h = harness();
        let started = tokio::time::Instant::now();
        h.session.start_scan().unwrap();
        advertise(&mut h, "Kitchen Speaker");
        assert_eq!(h.session.state(), &ConnectionState::Scanning);

        match h.loop_rx.recv().await {
            Some(LoopEvent::ScanTimeout(id)) => h.session.handle_scan_timeout(id),
            other => panic!("unexpected {:?}", other),
        }

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(h.session.state(), &ConnectionState::Idle);
        let events = h.session.drain_events();
        assert_eq!(events, vec![ScaleEvent::ScanStarted, ScaleEvent::ScanTimedOut]);
        assert_eq!(
            h.transport.calls(),
            vec![TransportCall::StartScan, TransportCall::StopScan]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_cancels_scan_timer() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        advertise(&mut h, "LoggingScale-01");

        assert_eq!(h.session.state(), &ConnectionState::Connecting);
        assert_eq!(
            h.transport.calls(),
            vec![
                TransportCall::StartScan,
                TransportCall::StopScan,
                TransportCall::Connect(scale_id()),
            ]
        );
        let fired = tokio::time::timeout(Duration::from_secs(30), h.loop_rx.recv()).await;
        assert!(fired.is_err());

        // a stale expiry is ignored
        h.session.handle_scan_timeout(1);
        assert_eq!(h.session.state(), &ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_discovery_subscribes_to_notify_characteristics() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        advertise(&mut h, "LoggingScale-01");
        h.session
            .handle_transport_event(TransportEvent::Connected(scale_id()));
        assert_eq!(h.session.state(), &ConnectionState::DiscoveringServices);
        h.session
            .handle_transport_event(TransportEvent::ServicesDiscovered(vec![gatt::scale_service()]));

        // not ready until every subscription is acknowledged
        assert_eq!(h.session.state(), &ConnectionState::DiscoveringServices);
        assert_eq!(h.session.send_tare(), Err(PreconditionError::NotConnected));
        h.session
            .handle_transport_event(TransportEvent::Subscribed(MASS_CHAR_UUID));
        h.session
            .handle_transport_event(TransportEvent::Subscribed(MASS_CHAR_UUID));
        h.session
            .handle_transport_event(TransportEvent::Subscribed(gatt::LOGGING_CHAR_UUID));
        assert!(!h.session.is_ready());
        h.session
            .handle_transport_event(TransportEvent::Subscribed(SHOT_STATE_CHAR_UUID));

        assert!(h.session.is_ready());
        let subscribed: Vec<TransportCall> = h
            .transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Subscribe(_)))
            .collect();
        assert_eq!(
            subscribed,
            vec![
                TransportCall::Subscribe(MASS_CHAR_UUID),
                TransportCall::Subscribe(gatt::LOGGING_CHAR_UUID),
                TransportCall::Subscribe(SHOT_STATE_CHAR_UUID),
            ]
        );
        let events = h.session.drain_events();
        assert_eq!(events.last(), Some(&ScaleEvent::Ready(scale_id())));
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails_then_rescan_allowed() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        advertise(&mut h, "LoggingScale-01");
        h.session
            .handle_transport_event(TransportEvent::Connected(scale_id()));
        let mut service = gatt::scale_service();
        service.characteristics.retain(|u| *u != LOG_STATE_CHAR_UUID);
        h.session
            .handle_transport_event(TransportEvent::ServicesDiscovered(vec![service]));

        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert!(h.session.drain_events().contains(&ScaleEvent::FailedToConnect {
            device: scale_id(),
            reason: TransportError::MissingCharacteristic("log state"),
        }));
        assert_eq!(h.transport.calls().last(), Some(&TransportCall::Disconnect));

        // the teardown's own disconnect report arrives while idle
        h.session.handle_transport_event(TransportEvent::Disconnected {
            device: scale_id(),
            reason: "local".to_string(),
        });
        assert!(h.session.drain_events().is_empty());
        assert!(h.session.start_scan().is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        advertise(&mut h, "LoggingScale-01");
        h.session.handle_transport_event(TransportEvent::ConnectFailed {
            device: scale_id(),
            reason: "le-connection-abort-by-local".to_string(),
        });

        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert!(h
            .session
            .drain_events()
            .iter()
            .any(|e| matches!(e, ScaleEvent::FailedToConnect { .. })));
        assert!(h.session.device().is_none());
    }

    #[tokio::test]
    async fn test_scan_failure_is_reported() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        h.session
            .handle_transport_event(TransportEvent::ScanFailed("adapter powered off".to_string()));
        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert_eq!(
            h.session.drain_events().last(),
            Some(&ScaleEvent::ScanFailed(TransportError::ScanFailed(
                "adapter powered off".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_notifications_decode_to_events() {
        let mut h = ready_harness();
        h.clock.set(5_000);

        notify(&mut h, MASS_CHAR_UUID, &[0x90, 0x01]);
        notify(&mut h, MASS_CHAR_UUID, &[]);
        notify(&mut h, MASS_CHAR_UUID, &[0x90]);
        notify(&mut h, gatt::LOGGING_CHAR_UUID, &[0x0A, 0x00, 0x55]);
        notify(&mut h, SHOT_STATE_CHAR_UUID, &[0x00]);
        notify(&mut h, SHOT_STATE_CHAR_UUID, &[]);

        assert_eq!(
            h.session.drain_events(),
            vec![
                ScaleEvent::MassUpdated(MassSample {
                    value: Grams(40.0),
                    source: MassSource::Live,
                    observed_at: 5_000,
                }),
                ScaleEvent::LoggingSample(MassSample {
                    value: Grams(1.0),
                    source: MassSource::LoggingFeed,
                    observed_at: 5_000,
                }),
                ScaleEvent::ShotStatusChanged(false),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_target_mass_with_lenient_fallback() {
        let mut h = ready_harness();
        h.session.read_target_mass().unwrap();
        assert_eq!(
            h.transport.calls(),
            vec![TransportCall::Read(gatt::TARGET_MASS_CHAR_UUID)]
        );

        h.session.handle_transport_event(TransportEvent::ReadCompleted {
            uuid: gatt::TARGET_MASS_CHAR_UUID,
            result: Ok(vec![0x90, 0x01]),
        });
        h.session.handle_transport_event(TransportEvent::ReadCompleted {
            uuid: gatt::TARGET_MASS_CHAR_UUID,
            result: Ok(vec![0x07]),
        });
        h.session.handle_transport_event(TransportEvent::ReadCompleted {
            uuid: gatt::TARGET_MASS_CHAR_UUID,
            result: Err("insufficient authentication".to_string()),
        });

        assert_eq!(
            h.session.drain_events(),
            vec![
                ScaleEvent::TargetMassRead(Grams(40.0)),
                ScaleEvent::TargetMassRead(Grams::ZERO),
            ]
        );
    }

    #[tokio::test]
    async fn test_commands_write_opcodes() {
        let mut h = ready_harness();
        h.session.send_tare().unwrap();
        h.session.send_start_cycle().unwrap();
        h.session.send_stop_cycle().unwrap();
        h.session.start_logging_feed().unwrap();
        h.session.stop_logging_feed().unwrap();
        h.session.write_target_mass(Grams(36.5)).unwrap();

        assert_eq!(
            h.transport.calls(),
            vec![
                TransportCall::Write(gatt::TARE_CHAR_UUID, vec![0x01]),
                TransportCall::Write(SHOT_STATE_CHAR_UUID, vec![0x01]),
                TransportCall::Write(SHOT_STATE_CHAR_UUID, vec![0x00]),
                TransportCall::Write(LOG_STATE_CHAR_UUID, vec![0x01]),
                TransportCall::Write(LOG_STATE_CHAR_UUID, vec![0x00]),
                TransportCall::Write(gatt::TARGET_MASS_CHAR_UUID, 365i16.to_le_bytes().to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_commands_rejected_when_not_ready() {
        let mut h = harness();
        assert_eq!(h.session.send_tare(), Err(PreconditionError::NotConnected));
        assert_eq!(h.session.read_target_mass(), Err(PreconditionError::NotConnected));
        assert_eq!(
            h.session.write_target_mass(Grams(10.0)),
            Err(PreconditionError::NotConnected)
        );
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_local_disconnect_invalidates_handles() {
        let mut h = ready_harness();
        h.session.disconnect().unwrap();
        assert_eq!(h.session.state(), &ConnectionState::Disconnecting);
        assert_eq!(h.session.send_tare(), Err(PreconditionError::NotConnected));

        h.session.handle_transport_event(TransportEvent::Disconnected {
            device: scale_id(),
            reason: "local disconnect".to_string(),
        });
        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert_eq!(
            h.session.drain_events(),
            vec![
                ScaleEvent::Disconnecting(scale_id()),
                ScaleEvent::Disconnected {
                    device: scale_id(),
                    reason: "local disconnect".to_string(),
                },
            ]
        );

        notify(&mut h, MASS_CHAR_UUID, &[0x90, 0x01]);
        assert!(h.session.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_remote_disconnect_then_rescan() {
        let mut h = ready_harness();
        h.session.handle_transport_event(TransportEvent::Disconnected {
            device: scale_id(),
            reason: "remote user terminated".to_string(),
        });
        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert_eq!(h.session.stop_logging_feed(), Err(PreconditionError::NotConnected));
        assert!(h.session.start_scan().is_ok());
    }

    #[tokio::test]
    async fn test_scan_while_busy_is_rejected() {
        let mut h = ready_harness();
        assert_eq!(
            h.session.start_scan(),
            Err(PreconditionError::Busy(ConnectionState::Ready))
        );
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_services_invalidated_triggers_rediscovery() {
        let mut h = ready_harness();
        h.session
            .handle_transport_event(TransportEvent::ServicesInvalidated);
        assert_eq!(h.session.state(), &ConnectionState::DiscoveringServices);
        assert_eq!(h.session.send_tare(), Err(PreconditionError::NotConnected));
        assert_eq!(h.transport.calls(), vec![TransportCall::DiscoverServices]);

        h.session
            .handle_transport_event(TransportEvent::ServicesDiscovered(vec![gatt::scale_service()]));
        assert!(!h.session.is_ready());
        acknowledge_subscriptions(&mut h);
        assert!(h.session.is_ready());
    }

    #[tokio::test]
    async fn test_subscription_failure_fails_connection() {
        let mut h = discovered_harness();
        h.session
            .handle_transport_event(TransportEvent::Subscribed(MASS_CHAR_UUID));
        h.session.handle_transport_event(TransportEvent::SubscribeFailed {
            uuid: gatt::LOGGING_CHAR_UUID,
            reason: "cccd write rejected".to_string(),
        });

        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert!(h.session.drain_events().contains(&ScaleEvent::FailedToConnect {
            device: scale_id(),
            reason: TransportError::SubscribeFailed {
                characteristic: "logging feed",
                reason: "cccd write rejected".to_string(),
            },
        }));
        assert_eq!(h.transport.calls().last(), Some(&TransportCall::Disconnect));

        // a late ack for the abandoned link changes nothing
        h.session
            .handle_transport_event(TransportEvent::Subscribed(SHOT_STATE_CHAR_UUID));
        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert!(h.session.start_scan().is_ok());
    }

    #[tokio::test]
    async fn test_service_discovery_failure_tears_down_link() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        advertise(&mut h, "LoggingScale-01");
        h.session
            .handle_transport_event(TransportEvent::Connected(scale_id()));
        h.transport.take_calls();

        h.session.handle_transport_event(TransportEvent::ServiceDiscoveryFailed(
            "gatt error 0x85".to_string(),
        ));

        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert!(h.session.drain_events().contains(&ScaleEvent::FailedToConnect {
            device: scale_id(),
            reason: TransportError::ServiceDiscovery("gatt error 0x85".to_string()),
        }));
        assert_eq!(h.transport.calls(), vec![TransportCall::Disconnect]);
        assert!(h.session.device().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_is_a_connect_failure() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        advertise(&mut h, "LoggingScale-01");
        h.session.drain_events();

        h.session.handle_transport_event(TransportEvent::Disconnected {
            device: scale_id(),
            reason: "connection timed out".to_string(),
        });

        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert_eq!(
            h.session.drain_events(),
            vec![ScaleEvent::FailedToConnect {
                device: scale_id(),
                reason: TransportError::ConnectFailed {
                    device: scale_id().to_string(),
                    reason: "connection timed out".to_string(),
                },
            }]
        );
        assert!(h.session.start_scan().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_scanning_abandons_scan() {
        let mut h = harness();
        h.session.start_scan().unwrap();
        h.session.disconnect().unwrap();

        assert_eq!(h.session.state(), &ConnectionState::Idle);
        assert_eq!(
            h.transport.calls(),
            vec![TransportCall::StartScan, TransportCall::StopScan]
        );
        let fired = tokio::time::timeout(Duration::from_secs(30), h.loop_rx.recv()).await;
        assert!(fired.is_err(), "scan timer still fired");
        assert_eq!(h.session.disconnect(), Err(PreconditionError::NotConnected));
    }
}
