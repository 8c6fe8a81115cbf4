use anyhow::Result;
use ble_gps_mocker::domain::settings::{FileSessionFlag, SettingsService};
use ble_gps_mocker::infrastructure::bluetooth::radio::{Radio, RadioEvent};
use ble_gps_mocker::infrastructure::desktop::{GrantedPermissions, JournalSurface, TracingStatusSink};
use ble_gps_mocker::infrastructure::logging::init_logger;
use ble_gps_mocker::{SessionConfig, SessionController, SessionPorts};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    // Keep the guard alive for the whole run so file logs get flushed
    let _logging_guard = init_logger(&settings.log_settings)?;
    info!("Starting BLE GPS mocker");
    info!("Settings: {:?}", settings_service.path());

    let journal_path = settings_service
        .path()
        .with_file_name(&settings.location_journal_file);
    let settings_service = Arc::new(Mutex::new(settings_service));

    let (radio, radio_events) = platform_radio()?;
    let ports = SessionPorts {
        radio,
        radio_events,
        flag: Arc::new(FileSessionFlag::new(settings_service)),
        permissions: Arc::new(GrantedPermissions),
        surface: Arc::new(JournalSurface::new(journal_path)?),
        sink: Arc::new(TracingStatusSink),
    };
    let session = SessionController::new(ports, SessionConfig::from_settings(&settings));

    match std::env::args().nth(1).as_deref() {
        Some("--enable") => session.enable(),
        Some("--disable") => {
            session.disable();
            info!("Mock location disabled");
            return Ok(());
        }
        _ => {
            if !settings.mock_enabled {
                info!("Mock location is off; run with --enable to start the bridge");
            }
            session.apply_preferences();
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.shutdown();
    Ok(())
}

#[cfg(windows)]
fn platform_radio() -> Result<(Arc<dyn Radio>, mpsc::UnboundedReceiver<RadioEvent>)> {
    use ble_gps_mocker::infrastructure::bluetooth::winrt::WinRtRadio;

    let (events, radio_events) = mpsc::unbounded_channel();
    let radio = WinRtRadio::new(events)?;
    Ok((Arc::new(radio), radio_events))
}

#[cfg(not(windows))]
fn platform_radio() -> Result<(Arc<dyn Radio>, mpsc::UnboundedReceiver<RadioEvent>)> {
    anyhow::bail!("No Bluetooth LE backend is available on this platform")
}
