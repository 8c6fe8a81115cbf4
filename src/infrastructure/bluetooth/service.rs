//! Bluetooth Service Module
//!
//! Connection state machine on top of [`BleTransport`]: keeps the
//! {scanning, connecting, connected} triple, runs the auto-rescan loop and
//! hands telemetry to the mock location manager.

use crate::domain::models::{ConnectionState, LinkStatus, StatusUpdate};
use crate::domain::ports::{SessionFlag, StatusSink};
use crate::domain::settings::Settings;
use crate::error::BridgeError;
use crate::infrastructure::bluetooth::transport::{BleTransport, ScanStart, TransportEvent};
use crate::infrastructure::mock_location::MockLocationManager;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Period of the auto-rescan loop
    pub rescan_interval: Duration,
    /// Delay before rescanning after a disconnect or a failed scan
    pub rescan_delay: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rescan_interval: Duration::from_secs(3),
            rescan_delay: Duration::from_secs(3),
        }
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            rescan_interval: Duration::from_millis(settings.rescan_interval_ms),
            rescan_delay: Duration::from_millis(settings.rescan_delay_ms),
        }
    }
}

/// At most one of the three is true at any instant.
#[derive(Debug, Default)]
struct LinkFlags {
    scanning: bool,
    connecting: bool,
    connected: bool,
}

impl LinkFlags {
    fn busy(&self) -> bool {
        self.scanning || self.connecting || self.connected
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.connected,
            scanning: self.scanning,
        }
    }
}

#[derive(Default)]
struct ServiceTasks {
    running: bool,
    radio_pump: Option<JoinHandle<()>>,
    event_pump: Option<JoinHandle<()>>,
    rescan_loop: Option<JoinHandle<()>>,
    pending_rescan: Option<JoinHandle<()>>,
    /// Pending user-action error (permission, radio off), surfaced once
    last_precheck: Option<BridgeError>,
}

/// Main Bluetooth service coordinating the accessory link
pub struct BluetoothService {
    transport: Arc<BleTransport>,
    flag: Arc<dyn SessionFlag>,
    mock: Arc<MockLocationManager>,
    sink: Arc<dyn StatusSink>,
    config: ServiceConfig,
    link: Mutex<LinkFlags>,
    tasks: Mutex<ServiceTasks>,
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl BluetoothService {
    pub fn new(
        transport: Arc<BleTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        flag: Arc<dyn SessionFlag>,
        mock: Arc<MockLocationManager>,
        sink: Arc<dyn StatusSink>,
        config: ServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            flag,
            mock,
            sink,
            config,
            link: Mutex::new(LinkFlags::default()),
            tasks: Mutex::new(ServiceTasks::default()),
            transport_events: Mutex::new(Some(transport_events)),
        })
    }

    pub fn transport(&self) -> &Arc<BleTransport> {
        &self.transport
    }

    /// Start the event pumps and the auto-rescan loop. No-op when running.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.lock_tasks();
        if tasks.running {
            debug!("Bluetooth service already running");
            return;
        }
        info!("Starting Bluetooth service");
        tasks.running = true;
        tasks.last_precheck = None;

        if tasks.radio_pump.is_none() {
            tasks.radio_pump = self.transport.start_event_pump();
        }
        if tasks.event_pump.is_none() {
            tasks.event_pump = self.spawn_event_pump();
        }
        tasks.rescan_loop = Some(self.spawn_rescan_loop());
        drop(tasks);

        *self.lock_link() = LinkFlags::default();
        self.publish_link();
    }

    /// Tear the link down. Idempotent, safe mid-connection attempt.
    pub fn stop(&self) {
        {
            let mut tasks = self.lock_tasks();
            if tasks.running {
                info!("Stopping Bluetooth service");
            }
            tasks.running = false;
            for task in [tasks.rescan_loop.take(), tasks.pending_rescan.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        }

        {
            let mut link = self.lock_link();
            self.transport.stop_scan();
            if let Err(e) = self.transport.disconnect() {
                warn!("Disconnect skipped: {}", e);
            }
            self.transport.close_gatt();
            *link = LinkFlags::default();
        }
        self.publish_link();
    }

    /// Stop and release the event pumps. The service cannot be restarted.
    pub fn shutdown(&self) {
        self.stop();
        let mut tasks = self.lock_tasks();
        for task in [tasks.radio_pump.take(), tasks.event_pump.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_tasks().running
    }

    pub fn link_state(&self) -> LinkStatus {
        self.lock_link().status()
    }

    /// Start a scan if the flag is on and the link is idle.
    pub fn try_start_scan(self: &Arc<Self>) -> bool {
        if !self.is_running() || !self.flag.get() {
            return false;
        }

        let started = {
            let mut link = self.lock_link();
            if self.reconciled_busy(&mut link) {
                debug!("Link busy, skipping scan");
                return false;
            }
            match self.transport.start_scan() {
                Ok(ScanStart::Started) | Ok(ScanStart::AlreadyScanning) => {
                    link.scanning = true;
                    true
                }
                Ok(ScanStart::LinkBusy) => false,
                Err(e) => {
                    debug!("Scan not started: {}", e);
                    false
                }
            }
        };

        if started {
            self.publish_link();
        }
        started
    }

    /// Rescan when idle, shared by the periodic loop and delayed rescans.
    fn rescan_if_idle(self: &Arc<Self>) {
        if !self.is_running() || !self.flag.get() {
            return;
        }
        {
            let mut link = self.lock_link();
            if self.reconciled_busy(&mut link) {
                return;
            }
        }

        // Pre-check so a missing permission or a powered-off radio is
        // reported once instead of on every attempt
        match self.transport.link_ready() {
            Ok(()) => {
                self.lock_tasks().last_precheck = None;
                self.try_start_scan();
            }
            Err(e) => {
                if self.note_user_action(&e) {
                    warn!("Cannot scan yet: {}", e);
                    self.mock.report_error(&e);
                }
            }
        }
    }

    /// Busy flags left behind by events that arrived after a teardown are
    /// cleared when the transport is idle.
    fn reconciled_busy(&self, link: &mut LinkFlags) -> bool {
        if link.busy() && !link.scanning && self.transport.connection_state() == ConnectionState::Idle {
            debug!("Clearing stale link flags {:?}", link);
            *link = LinkFlags::default();
        }
        link.busy()
    }

    /// Remember a user-action error; true when it differs from the last one.
    fn note_user_action(&self, error: &BridgeError) -> bool {
        let mut tasks = self.lock_tasks();
        let changed = tasks.last_precheck.as_ref() != Some(error);
        tasks.last_precheck = Some(error.clone());
        changed
    }

    fn awaiting_user(&self) -> bool {
        self.lock_tasks().last_precheck.is_some()
    }

    /// Apply one transport event to the state machine.
    pub fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        if !self.is_running() && Self::changes_link(&event) {
            debug!("Ignoring {:?} after stop", event);
            return;
        }

        match event {
            TransportEvent::DeviceFound(device) => {
                info!("Accessory found: {} ({})", device.display_name(), device.address);
            }
            TransportEvent::ScanStopped { device_found } => {
                self.update_link(|link| {
                    link.scanning = false;
                    link.connecting = device_found && !link.connected;
                });
                if !device_found {
                    self.schedule_rescan();
                }
            }
            TransportEvent::ScanFailed(code) => {
                self.update_link(|link| link.scanning = false);
                if self.awaiting_user() {
                    debug!("Scan failed ({}), waiting for the user", code);
                } else {
                    debug!("Scan failed ({}), rescheduling", code);
                    self.schedule_rescan();
                }
            }
            TransportEvent::Connecting => {
                self.update_link(|link| {
                    link.scanning = false;
                    link.connected = false;
                    link.connecting = true;
                });
            }
            TransportEvent::Connected => {
                self.update_link(|link| {
                    link.scanning = false;
                    link.connecting = false;
                    link.connected = true;
                });
                if !self.transport.poll_telemetry() {
                    debug!("Initial status poll deferred until services are discovered");
                }
                if self.is_running() && !self.mock.is_active() {
                    if let Err(e) = self.mock.start_mocking() {
                        warn!("Mock providers not ready yet: {}", e);
                    }
                }
            }
            TransportEvent::ServicesDiscovered => debug!("Services discovered"),
            TransportEvent::Subscribed(characteristic) => {
                if characteristic == self.transport.identity().status_char_uuid {
                    self.transport.poll_telemetry();
                }
            }
            TransportEvent::Disconnected => {
                self.update_link(|link| *link = LinkFlags::default());
                self.schedule_rescan();
            }
            TransportEvent::Telemetry(events) => {
                if self.is_running() {
                    self.mock.ingest(&events);
                }
            }
            TransportEvent::Error(e) if e.is_local() => warn!("{}", e),
            TransportEvent::Error(e) if e.is_retryable() => {
                info!("{}, rescanning", e);
                self.mock.report_error(&e);
            }
            TransportEvent::Error(e) if e.requires_user_action() => {
                if self.note_user_action(&e) {
                    error!("Bluetooth error: {}", e);
                    self.mock.report_error(&e);
                }
            }
            TransportEvent::Error(e) => {
                error!("Bluetooth error: {}", e);
                self.mock.report_error(&e);
            }
        }
    }

    fn changes_link(event: &TransportEvent) -> bool {
        matches!(
            event,
            TransportEvent::ScanStopped { .. }
                | TransportEvent::ScanFailed(_)
                | TransportEvent::Connecting
                | TransportEvent::Connected
                | TransportEvent::Disconnected
        )
    }

    fn update_link(&self, change: impl FnOnce(&mut LinkFlags)) {
        {
            let mut link = self.lock_link();
            change(&mut link);
        }
        self.publish_link();
    }

    fn publish_link(&self) {
        let status = self.link_state();
        debug!("Link status: {:?}", status);
        self.sink.publish(StatusUpdate::Link(status));
    }

    fn schedule_rescan(self: &Arc<Self>) {
        if !self.flag.get() {
            return;
        }
        let mut tasks = self.lock_tasks();
        if !tasks.running {
            return;
        }
        if let Some(pending) = tasks.pending_rescan.take() {
            pending.abort();
        }

        let weak = Arc::downgrade(self);
        let delay = self.config.rescan_delay;
        debug!("Rescan scheduled in {:?}", delay);
        tasks.pending_rescan = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(service) = weak.upgrade() {
                service.rescan_if_idle();
            }
        }));
    }

    fn spawn_rescan_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.rescan_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.rescan_if_idle();
            }
        })
    }

    fn spawn_event_pump(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .transport_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let weak = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.handle_event(event);
            }
            debug!("Transport event pump finished");
        }))
    }

    fn lock_link(&self) -> MutexGuard<'_, LinkFlags> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, ServiceTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [
            tasks.radio_pump.take(),
            tasks.event_pump.take(),
            tasks.rescan_loop.take(),
            tasks.pending_rescan.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
