//! BLE Transport Module
//!
//! Owns the radio-level link to the GNSS accessory: filtered scan, connect,
//! MTU negotiation, service discovery, CCCD subscription and characteristic
//! access. Radio callbacks are decoded and re-emitted as [`TransportEvent`]s.

use crate::domain::models::{Capability, ConnectionState, DeviceHandle, TelemetryEvent};
use crate::domain::ports::PermissionQuery;
use crate::domain::settings::Settings;
use crate::error::{BridgeError, SCAN_FAILED_INTERNAL_ERROR};
use crate::infrastructure::bluetooth::protocol::{self, AccessoryIdentity};
use crate::infrastructure::bluetooth::radio::{
    Radio, RadioEvent, ScanFilter, ServiceInfo, SubscriptionMode, GATT_FAILURE, GATT_SUCCESS,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for transport behavior
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub identity: AccessoryIdentity,
    /// Scan auto-stop when nothing matched
    pub scan_timeout: Duration,
    pub preferred_mtu: u16,
    /// Delay between the coordinates and status CCCD writes
    pub descriptor_delay: Duration,
    /// Scan/connect gated by dedicated Bluetooth permissions instead of location
    pub dedicated_permissions: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            identity: AccessoryIdentity::default(),
            scan_timeout: Duration::from_millis(protocol::SCAN_TIMEOUT_MS),
            preferred_mtu: protocol::PREFERRED_MTU,
            descriptor_delay: Duration::from_millis(protocol::DESCRIPTOR_DELAY_MS),
            dedicated_permissions: true,
        }
    }
}

impl TransportConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = AccessoryIdentity::default();
        Self {
            identity: AccessoryIdentity {
                service_uuid: parse_uuid_or(&settings.ble_service_uuid, defaults.service_uuid),
                name_pattern: settings.ble_device_name.clone(),
                coordinates_char_uuid: parse_uuid_or(
                    &settings.ble_coordinates_char_uuid,
                    defaults.coordinates_char_uuid,
                ),
                status_char_uuid: parse_uuid_or(&settings.ble_status_char_uuid, defaults.status_char_uuid),
            },
            scan_timeout: Duration::from_millis(settings.scan_timeout_ms),
            preferred_mtu: settings.preferred_mtu,
            descriptor_delay: Duration::from_millis(settings.descriptor_delay_ms),
            dedicated_permissions: settings.dedicated_bluetooth_permissions,
        }
    }
}

fn parse_uuid_or(value: &str, fallback: Uuid) -> Uuid {
    Uuid::parse_str(value).unwrap_or_else(|e| {
        warn!("Invalid UUID {:?} in settings ({}), using {}", value, e, fallback);
        fallback
    })
}

/// Events emitted by the transport, in radio order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    DeviceFound(DeviceHandle),
    ScanStopped { device_found: bool },
    ScanFailed(i32),
    Connecting,
    Connected,
    ServicesDiscovered,
    Disconnected,
    Subscribed(Uuid),
    Telemetry(Vec<TelemetryEvent>),
    Error(BridgeError),
}

/// Outcome of a scan request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStart {
    Started,
    AlreadyScanning,
    /// A connection attempt or an established link owns the radio
    LinkBusy,
}

#[derive(Default)]
struct TransportState {
    connection: ConnectionState,
    device_found: bool,
    scan_generation: u64,
    device: Option<DeviceHandle>,
    gnss_service: Option<ServiceInfo>,
    scan_timer: Option<JoinHandle<()>>,
    descriptor_timer: Option<JoinHandle<()>>,
}

impl TransportState {
    fn cancel_scan_timer(&mut self) {
        if let Some(timer) = self.scan_timer.take() {
            timer.abort();
        }
    }

    fn cancel_descriptor_timer(&mut self) {
        if let Some(timer) = self.descriptor_timer.take() {
            timer.abort();
        }
    }
}

/// BLE transport for the GNSS accessory
pub struct BleTransport {
    radio: Arc<dyn Radio>,
    permissions: Arc<dyn PermissionQuery>,
    config: TransportConfig,
    state: Mutex<TransportState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    radio_events: Mutex<Option<mpsc::UnboundedReceiver<RadioEvent>>>,
}

impl BleTransport {
    /// Create a transport over `radio`, fed by the radio's callback channel.
    pub fn new(
        radio: Arc<dyn Radio>,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        permissions: Arc<dyn PermissionQuery>,
        config: TransportConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            radio,
            permissions,
            config,
            state: Mutex::new(TransportState::default()),
            events,
            radio_events: Mutex::new(Some(radio_events)),
        });
        (transport, receiver)
    }

    pub fn identity(&self) -> &AccessoryIdentity {
        &self.config.identity
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_state().connection
    }

    /// Spawn the task that pumps radio callbacks into the transport.
    ///
    /// Returns `None` if the pump was already started.
    pub fn start_event_pump(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .radio_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let weak = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                transport.handle_radio_event(event);
            }
            debug!("Radio event pump finished");
        }))
    }

    /// Check permissions and radio power without side effects.
    pub fn scan_ready(&self) -> Result<(), BridgeError> {
        self.require(self.scan_capabilities(), "scan")?;
        if !self.radio.is_powered_on() {
            return Err(BridgeError::RadioUnavailable);
        }
        Ok(())
    }

    /// `scan_ready` plus the capability needed to connect once the scan matches.
    pub fn link_ready(&self) -> Result<(), BridgeError> {
        self.scan_ready()?;
        self.require(self.connect_capabilities(), "connect")
    }

    /// Start a low-latency scan for the accessory
    pub fn start_scan(self: &Arc<Self>) -> Result<ScanStart, BridgeError> {
        let mut state = self.lock_state();
        match state.connection {
            ConnectionState::Idle => {}
            ConnectionState::Scanning => {
                debug!("Scan already in progress");
                return Ok(ScanStart::AlreadyScanning);
            }
            busy => {
                debug!("Link busy ({:?}), not scanning", busy);
                return Ok(ScanStart::LinkBusy);
            }
        }

        if let Err(e) = self.scan_ready() {
            return Err(self.refuse_scan(e));
        }

        let identity = &self.config.identity;
        let filters = [
            ScanFilter::ServiceUuid(identity.service_uuid),
            ScanFilter::DeviceName(identity.name_pattern.clone()),
        ];
        if let Err(e) = self.radio.start_scan(&filters) {
            error!("Failed to start scan: {}", e);
            return Err(self.refuse_scan(BridgeError::ScanFailed(SCAN_FAILED_INTERNAL_ERROR)));
        }

        info!(
            "Scanning for {} (service {})",
            identity.name_pattern, identity.service_uuid
        );
        state.connection = ConnectionState::Scanning;
        state.device_found = false;
        state.scan_generation += 1;
        state.cancel_scan_timer();
        state.scan_timer = Some(self.spawn_scan_timeout(state.scan_generation));

        Ok(ScanStart::Started)
    }

    /// Stop scanning. No-op when no scan is running.
    pub fn stop_scan(&self) {
        let mut state = self.lock_state();
        if state.connection != ConnectionState::Scanning {
            trace!("stop_scan: not scanning");
            return;
        }
        state.cancel_scan_timer();
        self.finish_scan(&mut state);
    }

    /// Connect to `device`, dropping any other peripheral first.
    pub fn connect(&self, device: DeviceHandle) -> Result<(), BridgeError> {
        if let Err(e) = self.require(self.connect_capabilities(), "connect") {
            warn!("Cannot connect: {}", e);
            self.emit(TransportEvent::Error(e.clone()));
            self.emit(TransportEvent::Disconnected);
            return Err(e);
        }

        let mut state = self.lock_state();
        if let Some(current) = &state.device {
            if current.address != device.address {
                info!("Dropping link to {} for {}", current.address, device.address);
                self.radio.disconnect();
                self.radio.close();
                Self::release(&mut state);
            } else if state.connection != ConnectionState::Idle {
                debug!("Already linked to {}", device.address);
                return Ok(());
            }
        }

        if state.connection == ConnectionState::Scanning {
            state.cancel_scan_timer();
            state.device_found = true;
            self.finish_scan(&mut state);
        }

        info!("Connecting to {} ({})", device.display_name(), device.address);
        state.connection = ConnectionState::Connecting;
        state.device = Some(device.clone());
        self.emit(TransportEvent::Connecting);

        if let Err(e) = self.radio.connect(&device) {
            state.connection = ConnectionState::Idle;
            state.device = None;
            let err = BridgeError::ConnectFailed(e.to_string());
            error!("{}", err);
            self.emit(TransportEvent::Error(err.clone()));
            self.emit(TransportEvent::Disconnected);
            return Err(err);
        }

        Ok(())
    }

    /// Read the status characteristic once.
    ///
    /// Returns false when there is no link, no GNSS service, or the connect
    /// capability is missing.
    pub fn poll_telemetry(&self) -> bool {
        if let Err(e) = self.require(self.connect_capabilities(), "poll telemetry") {
            warn!("Cannot poll telemetry: {}", e);
            return false;
        }

        let state = self.lock_state();
        let Some(service) = &state.gnss_service else {
            debug!("Cannot poll telemetry: GNSS service not discovered");
            return false;
        };

        match self
            .radio
            .read_characteristic(service.uuid, self.config.identity.status_char_uuid)
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Status read failed to start: {}", e);
                false
            }
        }
    }

    /// Write raw bytes to a characteristic of the GNSS service.
    pub fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> Result<(), BridgeError> {
        self.require(self.connect_capabilities(), "write characteristic")?;

        let state = self.lock_state();
        let service = state
            .gnss_service
            .as_ref()
            .ok_or(BridgeError::ServiceNotFound(self.config.identity.service_uuid))?;
        service
            .characteristic(characteristic)
            .ok_or(BridgeError::CharacteristicNotFound(characteristic))?;

        debug!("Writing {} bytes to {}", value.len(), characteristic);
        self.radio
            .write_characteristic(service.uuid, characteristic, value)
            .map_err(|e| BridgeError::WriteFailed {
                characteristic,
                reason: e.to_string(),
            })
    }

    /// Ask the radio to drop the link. No-op when nothing is connected.
    pub fn disconnect(&self) -> Result<(), BridgeError> {
        self.require(self.connect_capabilities(), "disconnect")?;

        let state = self.lock_state();
        match &state.device {
            Some(device) => {
                info!("Disconnecting from {}", device.address);
                self.radio.disconnect();
            }
            None => trace!("disconnect: no device"),
        }
        Ok(())
    }

    /// Release radio resources and pending timers. Safe when already closed.
    pub fn close_gatt(&self) {
        let mut state = self.lock_state();
        state.cancel_descriptor_timer();
        if state.device.is_some() || state.gnss_service.is_some() {
            debug!("Closing GATT client");
            self.radio.close();
        }
        Self::release(&mut state);
        if state.connection != ConnectionState::Scanning {
            state.connection = ConnectionState::Idle;
        }
    }

    /// Dispatch one radio callback.
    pub fn handle_radio_event(self: &Arc<Self>, event: RadioEvent) {
        match event {
            RadioEvent::ScanResult(device) => self.on_scan_result(device),
            RadioEvent::ScanFailed(code) => self.on_scan_failed(code),
            RadioEvent::ConnectionStateChanged { device, connected } => {
                self.on_connection_changed(&device, connected)
            }
            RadioEvent::MtuChanged { mtu, success } => self.on_mtu_changed(mtu, success),
            RadioEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services)
            }
            RadioEvent::CharacteristicChanged { uuid, value } => self.forward_payload(uuid, &value),
            RadioEvent::CharacteristicRead { uuid, value, status } => {
                if status == GATT_SUCCESS {
                    self.forward_payload(uuid, &value);
                } else {
                    warn!("Read of {} failed with status {}", uuid, status);
                    self.emit(TransportEvent::Error(BridgeError::ReadFailed {
                        characteristic: uuid,
                        status,
                    }));
                }
            }
            RadioEvent::DescriptorWritten {
                characteristic,
                success,
            } => {
                if success {
                    info!("Subscribed to {}", characteristic);
                    self.emit(TransportEvent::Subscribed(characteristic));
                } else {
                    warn!("CCCD write for {} rejected", characteristic);
                    self.emit(TransportEvent::Error(BridgeError::DescriptorWriteFailed {
                        characteristic,
                        reason: "descriptor write rejected".into(),
                    }));
                }
            }
        }
    }

    fn on_scan_result(&self, device: DeviceHandle) {
        let device = {
            let mut state = self.lock_state();
            if state.connection != ConnectionState::Scanning {
                return;
            }
            if !self.config.identity.matches(&device) {
                trace!("Ignoring {} ({})", device.display_name(), device.address);
                return;
            }

            info!(
                "Found accessory {} ({}) rssi {:?}",
                device.display_name(),
                device.address,
                device.rssi
            );
            state.device_found = true;
            state.cancel_scan_timer();
            self.emit(TransportEvent::DeviceFound(device.clone()));
            self.finish_scan(&mut state);
            device
        };

        if let Err(e) = self.connect(device) {
            debug!("Connect after scan failed: {}", e);
        }
    }

    fn on_scan_failed(&self, code: i32) {
        let mut state = self.lock_state();
        if state.connection != ConnectionState::Scanning {
            debug!("Late scan failure {} ignored", code);
            return;
        }
        error!("Scan failed with error code {}", code);
        state.cancel_scan_timer();
        state.connection = ConnectionState::Idle;
        self.emit(TransportEvent::Error(BridgeError::ScanFailed(code)));
        self.emit(TransportEvent::ScanFailed(code));
    }

    fn on_scan_timeout(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.connection != ConnectionState::Scanning || state.scan_generation != generation {
            return;
        }
        info!("Scan timed out without finding the accessory");
        state.scan_timer = None;
        self.emit(TransportEvent::Error(BridgeError::ScanTimeout));
        self.finish_scan(&mut state);
    }

    fn on_connection_changed(&self, device: &str, connected: bool) {
        let mut state = self.lock_state();
        if state.device.as_ref().map(|d| d.address.as_str()) != Some(device) {
            debug!("Ignoring link change for unknown device {}", device);
            return;
        }

        if connected {
            if state.connection != ConnectionState::Connecting {
                debug!("Duplicate link-up for {}", device);
                return;
            }
            info!("Connected to {}", device);
            state.connection = ConnectionState::Connected;
            self.emit(TransportEvent::Connected);

            if let Err(e) = self.radio.request_mtu(self.config.preferred_mtu) {
                warn!("MTU request failed ({}), discovering services anyway", e);
                self.discover_services();
            }
        } else {
            if state.connection == ConnectionState::Idle {
                return;
            }
            info!("Disconnected from {}", device);
            self.radio.close();
            Self::release(&mut state);
            state.connection = ConnectionState::Idle;
            self.emit(TransportEvent::Disconnected);
        }
    }

    fn on_mtu_changed(&self, mtu: u16, success: bool) {
        let state = self.lock_state();
        if state.connection != ConnectionState::Connected {
            return;
        }
        if success {
            info!("MTU changed to {}", mtu);
        } else {
            warn!("MTU negotiation failed, staying at {}", mtu);
        }
        self.discover_services();
    }

    fn discover_services(&self) {
        if let Err(e) = self.radio.discover_services() {
            error!("Service discovery failed to start: {}", e);
            self.emit(TransportEvent::Error(BridgeError::ServiceDiscoveryFailed(GATT_FAILURE)));
        }
    }

    fn on_services_discovered(self: &Arc<Self>, status: i32, services: Vec<ServiceInfo>) {
        let mut state = self.lock_state();
        if state.connection != ConnectionState::Connected {
            debug!("Services discovered in state {:?}, ignoring", state.connection);
            return;
        }
        if status != GATT_SUCCESS {
            warn!("Service discovery failed with status {}", status);
            self.emit(TransportEvent::Error(BridgeError::ServiceDiscoveryFailed(status)));
            return;
        }

        state.connection = ConnectionState::ServicesDiscovered;
        self.emit(TransportEvent::ServicesDiscovered);

        let service_uuid = self.config.identity.service_uuid;
        let Some(service) = services.into_iter().find(|s| s.uuid == service_uuid) else {
            error!("GPS service ({}) not found", service_uuid);
            self.emit(TransportEvent::Error(BridgeError::ServiceNotFound(service_uuid)));
            return;
        };

        info!("GPS service found with {} characteristics", service.characteristics.len());
        state.gnss_service = Some(service);
        self.subscribe(&state, self.config.identity.coordinates_char_uuid);

        state.cancel_descriptor_timer();
        state.descriptor_timer = Some(self.spawn_descriptor_timer());
    }

    fn subscribe(&self, state: &TransportState, characteristic: Uuid) -> bool {
        if let Err(e) = self.require(self.connect_capabilities(), "enable notifications") {
            warn!("Cannot subscribe to {}: {}", characteristic, e);
            self.emit(TransportEvent::Error(e));
            return false;
        }
        let Some(service) = &state.gnss_service else {
            return false;
        };
        let Some(info) = service.characteristic(characteristic) else {
            warn!("Characteristic {} not found", characteristic);
            self.emit(TransportEvent::Error(BridgeError::CharacteristicNotFound(characteristic)));
            return false;
        };
        if !info.has_cccd {
            self.emit(TransportEvent::Error(BridgeError::DescriptorWriteFailed {
                characteristic,
                reason: "CCCD descriptor missing".into(),
            }));
            return false;
        }

        let mode = if info.properties.indicate {
            SubscriptionMode::Indicate
        } else {
            SubscriptionMode::Notify
        };
        match self.radio.write_cccd(service.uuid, characteristic, mode) {
            Ok(()) => {
                debug!("Enabling {:?} on {}", mode, characteristic);
                true
            }
            Err(e) => {
                self.emit(TransportEvent::Error(BridgeError::DescriptorWriteFailed {
                    characteristic,
                    reason: e.to_string(),
                }));
                false
            }
        }
    }

    fn subscribe_status(&self) {
        let mut state = self.lock_state();
        state.descriptor_timer = None;
        if state.connection == ConnectionState::ServicesDiscovered {
            self.subscribe(&state, self.config.identity.status_char_uuid);
        }
    }

    fn forward_payload(&self, characteristic: Uuid, value: &[u8]) {
        match protocol::try_decode(&self.config.identity, characteristic, value) {
            Ok(events) if events.is_empty() => trace!("No telemetry in payload from {}", characteristic),
            Ok(events) => self.emit(TransportEvent::Telemetry(events)),
            Err(e) => {
                warn!("Error parsing data for {}: {}", characteristic, e);
                self.emit(TransportEvent::Error(BridgeError::PayloadParseError {
                    characteristic,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn spawn_scan_timeout(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.scan_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(transport) = weak.upgrade() {
                transport.on_scan_timeout(generation);
            }
        })
    }

    fn spawn_descriptor_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let delay = self.config.descriptor_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(transport) = weak.upgrade() {
                transport.subscribe_status();
            }
        })
    }

    /// Stop the radio scan and report the outcome. Caller checked `Scanning`.
    fn finish_scan(&self, state: &mut TransportState) {
        self.radio.stop_scan();
        state.connection = ConnectionState::Idle;
        info!("Scan stopped (device found: {})", state.device_found);
        self.emit(TransportEvent::ScanStopped {
            device_found: state.device_found,
        });
    }

    fn release(state: &mut TransportState) {
        state.cancel_descriptor_timer();
        state.gnss_service = None;
        state.device = None;
    }

    fn scan_capabilities(&self) -> &'static [Capability] {
        if self.config.dedicated_permissions {
            &[Capability::Scan]
        } else {
            &[Capability::FineLocation]
        }
    }

    fn connect_capabilities(&self) -> &'static [Capability] {
        if self.config.dedicated_permissions {
            &[Capability::Connect]
        } else {
            &[]
        }
    }

    fn require(&self, capabilities: &[Capability], operation: &'static str) -> Result<(), BridgeError> {
        match capabilities
            .iter()
            .find(|c| !self.permissions.has_capability(**c))
        {
            Some(capability) => Err(BridgeError::PermissionDenied {
                capability: *capability,
                operation,
            }),
            None => Ok(()),
        }
    }

    fn refuse_scan(&self, err: BridgeError) -> BridgeError {
        warn!("Scan refused: {}", err);
        self.emit(TransportEvent::Error(err.clone()));
        self.emit(TransportEvent::ScanFailed(SCAN_FAILED_INTERNAL_ERROR));
        err
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_scan_timer();
        state.cancel_descriptor_timer();
        if state.connection == ConnectionState::Scanning {
            self.radio.stop_scan();
        }
    }
}
