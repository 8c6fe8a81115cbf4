//! Session controller
//!
//! Glues the connection state machine and the mock location manager to the
//! persisted session flag. Owned by the host; there is no global state, so
//! several sessions (or a restarted one) can coexist in tests.

use crate::domain::models::{LinkStatus, StatusRecord, StatusUpdate};
use crate::domain::ports::{MockLocationSurface, PermissionQuery, SessionFlag, StatusSink};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::radio::{Radio, RadioEvent};
use crate::infrastructure::bluetooth::service::{BluetoothService, ServiceConfig};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportConfig};
use crate::infrastructure::mock_location::{DropReason, MockConfig, MockLocationManager, PushOutcome};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Platform collaborators of a session.
pub struct SessionPorts {
    pub radio: Arc<dyn Radio>,
    pub radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    pub flag: Arc<dyn SessionFlag>,
    pub permissions: Arc<dyn PermissionQuery>,
    pub surface: Arc<dyn MockLocationSurface>,
    pub sink: Arc<dyn StatusSink>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub link: ServiceConfig,
    pub mock: MockConfig,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            transport: TransportConfig::from_settings(settings),
            link: ServiceConfig::from_settings(settings),
            mock: MockConfig::from_settings(settings),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub link: LinkStatus,
    pub record: StatusRecord,
}

pub struct SessionController {
    flag: Arc<dyn SessionFlag>,
    sink: Arc<dyn StatusSink>,
    mock: Arc<MockLocationManager>,
    bluetooth: Arc<BluetoothService>,
}

impl SessionController {
    pub fn new(ports: SessionPorts, config: SessionConfig) -> Self {
        let (transport, transport_events) = BleTransport::new(
            ports.radio,
            ports.radio_events,
            ports.permissions.clone(),
            config.transport,
        );
        let mock = Arc::new(MockLocationManager::new(
            ports.surface,
            ports.permissions,
            ports.flag.clone(),
            ports.sink.clone(),
            config.mock,
        ));
        let bluetooth = BluetoothService::new(
            transport,
            transport_events,
            ports.flag.clone(),
            mock.clone(),
            ports.sink.clone(),
            config.link,
        );

        Self {
            flag: ports.flag,
            sink: ports.sink,
            mock,
            bluetooth,
        }
    }

    /// Start or stop according to the persisted flag.
    pub fn apply_preferences(&self) {
        if self.flag.get() {
            self.start();
        } else {
            self.stop();
        }
    }

    pub fn enable(&self) {
        self.flag.set(true);
        self.apply_preferences();
    }

    pub fn disable(&self) {
        self.flag.set(false);
        self.apply_preferences();
    }

    pub fn start(&self) {
        info!("Starting mock location session");
        if let Err(e) = self.mock.start_mocking() {
            // Retried lazily on the first coordinate
            warn!("Mock location not ready: {}", e);
        }
        self.bluetooth.start();
    }

    pub fn stop(&self) {
        info!("Stopping mock location session");
        self.bluetooth.stop();
        self.mock.stop_mocking();
        self.mock.publish_status();
    }

    /// Inject coordinates by hand through the regular push path.
    pub fn feed_coordinates(&self, latitude: f64, longitude: f64) -> PushOutcome {
        if !latitude.is_finite() || !longitude.is_finite() {
            return PushOutcome::Dropped(DropReason::InvalidCoordinates);
        }
        self.mock.handle_location_update(latitude, longitude)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            link: self.bluetooth.link_state(),
            record: self.mock.status(),
        }
    }

    pub fn bluetooth(&self) -> &Arc<BluetoothService> {
        &self.bluetooth
    }

    /// Stop and cancel every background task.
    pub fn shutdown(&self) {
        self.stop();
        self.bluetooth.shutdown();
        self.sink.publish(StatusUpdate::Link(LinkStatus::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeFlag, FakePermissions, FakeRadio, FakeSurface, RecordingSink};
    use std::time::Duration;

    struct Harness {
        radio: Arc<FakeRadio>,
        flag: Arc<FakeFlag>,
        surface: Arc<FakeSurface>,
        session: SessionController,
    }

    fn harness(enabled: bool) -> Harness {
        let radio = FakeRadio::new();
        let (_radio_tx, radio_events) = mpsc::unbounded_channel();
        let flag = FakeFlag::new(enabled);
        let surface = FakeSurface::new();
        let ports = SessionPorts {
            radio: radio.clone(),
            radio_events,
            flag: flag.clone(),
            permissions: FakePermissions::all(),
            surface: surface.clone(),
            sink: RecordingSink::new(),
        };
        Harness {
            radio,
            flag,
            surface,
            session: SessionController::new(ports, SessionConfig::default()),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_preferences_follows_flag() {
        let h = harness(false);
        h.session.apply_preferences();
        settle().await;
        assert_eq!(h.radio.scans_started(), 0);
        assert!(!h.session.status().record.running);

        h.session.enable();
        settle().await;
        assert!(h.flag.get());
        assert_eq!(h.radio.scans_started(), 1);
        assert!(h.session.status().record.running);
        assert!(h.session.status().link.scanning);

        h.session.disable();
        assert!(!h.flag.get());
        assert_eq!(h.session.status().link, LinkStatus::default());
        assert!(!h.session.status().record.running);
        assert!(h.surface.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_is_restartable() {
        let h = harness(true);
        h.session.start();
        settle().await;
        h.session.stop();
        h.session.stop();
        h.session.start();
        settle().await;
        assert_eq!(h.radio.scans_started(), 2);
        assert!(h.surface.is_enabled("gps"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_coordinates() {
        let h = harness(true);
        h.session.start();

        assert_eq!(
            h.session.feed_coordinates(f64::NAN, 1.0),
            PushOutcome::Dropped(DropReason::InvalidCoordinates)
        );
        assert!(matches!(
            h.session.feed_coordinates(52.52, 13.40),
            PushOutcome::Pushed { .. }
        ));
        assert_eq!(h.session.status().record.last_fix, Some((52.52, 13.40)));

        h.flag.set(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            h.session.feed_coordinates(52.53, 13.41),
            PushOutcome::Dropped(DropReason::SessionDisabled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let h = harness(true);
        h.session.start();
        settle().await;
        h.session.shutdown();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.radio.scans_started(), 1);
        assert!(!h.session.bluetooth().is_running());
    }
}
