//! Accessory to mock provider, through the public session API.

mod support;

use ble_gps_mocker::domain::models::LinkStatus;
use ble_gps_mocker::infrastructure::bluetooth::protocol::{COORDINATES_CHAR_UUID, STATUS_CHAR_UUID};
use ble_gps_mocker::infrastructure::bluetooth::radio::{RadioEvent, SubscriptionMode, GATT_SUCCESS};
use ble_gps_mocker::infrastructure::desktop::{GrantedPermissions, JournalSurface};
use ble_gps_mocker::{SessionConfig, SessionController, SessionPorts};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use support::{accessory, gnss_service, settle, CollectingSink, MemoryFlag, ScriptedRadio};

fn journal_path(test: &str) -> PathBuf {
    let path = std::env::temp_dir()
        .join(format!("ble_gps_mocker_e2e_{}_{}", test, std::process::id()))
        .join("fixes.jsonl");
    let _ = std::fs::remove_file(&path);
    path
}

fn journal_lines(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_accessory_fix_reaches_journal() {
    let path = journal_path("fix");
    let (radio, radio_tx, radio_events) = ScriptedRadio::new();
    let sink = Arc::new(CollectingSink::default());
    let session = SessionController::new(
        SessionPorts {
            radio: radio.clone(),
            radio_events,
            flag: MemoryFlag::new(true),
            permissions: Arc::new(GrantedPermissions),
            surface: Arc::new(JournalSurface::new(&path).unwrap()),
            sink: sink.clone(),
        },
        SessionConfig::default(),
    );

    session.apply_preferences();
    settle().await;
    assert_eq!(radio.scans(), 1);
    assert!(session.status().link.scanning);

    radio_tx.send(RadioEvent::ScanResult(accessory())).unwrap();
    settle().await;
    assert_eq!(*radio.connects.lock().unwrap(), vec![accessory().address]);

    radio_tx
        .send(RadioEvent::ConnectionStateChanged {
            device: accessory().address,
            connected: true,
        })
        .unwrap();
    radio_tx.send(RadioEvent::MtuChanged { mtu: 185, success: true }).unwrap();
    radio_tx
        .send(RadioEvent::ServicesDiscovered {
            status: GATT_SUCCESS,
            services: vec![gnss_service()],
        })
        .unwrap();
    settle().await;
    assert!(session.status().link.connected);

    // Status subscription follows after the descriptor delay
    tokio::time::sleep(Duration::from_millis(150)).await;
    settle().await;
    assert_eq!(
        *radio.subscriptions.lock().unwrap(),
        vec![
            (COORDINATES_CHAR_UUID, SubscriptionMode::Notify),
            (STATUS_CHAR_UUID, SubscriptionMode::Indicate),
        ]
    );

    radio_tx
        .send(RadioEvent::CharacteristicRead {
            uuid: STATUS_CHAR_UUID,
            value: br#"{"fix":1,"hdop":1.2,"signals":[10,25,40]}"#.to_vec(),
            status: GATT_SUCCESS,
        })
        .unwrap();
    radio_tx
        .send(RadioEvent::CharacteristicChanged {
            uuid: COORDINATES_CHAR_UUID,
            value: br#"{"lt":48.8584,"lg":2.2945,"alt":35.0}"#.to_vec(),
        })
        .unwrap();
    settle().await;

    let record = sink.last_record().unwrap();
    assert!(record.running);
    assert_eq!(record.last_fix, Some((48.8584, 2.2945)));
    assert_eq!(record.hdop, Some(1.2));
    assert_eq!(record.satellite_count, Some(3));

    let lines = journal_lines(&path);
    let providers: Vec<&str> = lines.iter().filter_map(|l| l["provider"].as_str()).collect();
    assert_eq!(providers, vec!["gps", "network"]);
    assert_eq!(lines[0]["fix"]["latitude"], 48.8584);
    assert_eq!(lines[0]["fix"]["altitude"], 35.0);

    session
        .bluetooth()
        .transport()
        .write_characteristic(STATUS_CHAR_UUID, b"{\"rate\":1}")
        .unwrap();
    assert_eq!(radio.writes.lock().unwrap().len(), 1);

    session.shutdown();
    assert_eq!(session.status().link, LinkStatus::default());
    assert!(!session.status().record.running);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_session_stays_quiet() {
    let path = journal_path("quiet");
    let (radio, radio_tx, radio_events) = ScriptedRadio::new();
    let flag = MemoryFlag::new(false);
    let session = SessionController::new(
        SessionPorts {
            radio: radio.clone(),
            radio_events,
            flag: flag.clone(),
            permissions: Arc::new(GrantedPermissions),
            surface: Arc::new(JournalSurface::new(&path).unwrap()),
            sink: Arc::new(CollectingSink::default()),
        },
        SessionConfig::default(),
    );

    session.apply_preferences();
    radio_tx.send(RadioEvent::ScanResult(accessory())).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(radio.scans(), 0);
    assert!(radio.connects.lock().unwrap().is_empty());
    assert!(journal_lines(&path).is_empty());

    session.enable();
    settle().await;
    assert_eq!(radio.scans(), 1);
    session.shutdown();
}
