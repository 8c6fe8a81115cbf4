//! Scripted accessory for the integration tests.
//!
//! `ScriptedRadio` records what the bridge asks of the radio while the test
//! plays the accessory side through the returned event sender.

use ble_gps_mocker::domain::models::{DeviceHandle, StatusRecord, StatusUpdate};
use ble_gps_mocker::domain::ports::{SessionFlag, StatusSink};
use ble_gps_mocker::infrastructure::bluetooth::protocol::{COORDINATES_CHAR_UUID, GPS_SERVICE_UUID, STATUS_CHAR_UUID};
use ble_gps_mocker::infrastructure::bluetooth::radio::{
    CharacteristicInfo, CharacteristicProperties, Radio, RadioError, RadioEvent, ScanFilter, ServiceInfo,
    SubscriptionMode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
pub struct ScriptedRadio {
    pub scans: Mutex<usize>,
    pub connects: Mutex<Vec<String>>,
    pub subscriptions: Mutex<Vec<(Uuid, SubscriptionMode)>>,
    pub writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    pub closed: AtomicBool,
}

impl ScriptedRadio {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<RadioEvent>, mpsc::UnboundedReceiver<RadioEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::default()), tx, rx)
    }

    pub fn scans(&self) -> usize {
        *self.scans.lock().unwrap()
    }
}

impl Radio for ScriptedRadio {
    fn is_powered_on(&self) -> bool {
        true
    }

    fn start_scan(&self, _filters: &[ScanFilter]) -> Result<(), RadioError> {
        *self.scans.lock().unwrap() += 1;
        Ok(())
    }

    fn stop_scan(&self) {}

    fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        self.connects.lock().unwrap().push(device.address.clone());
        Ok(())
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), RadioError> {
        Ok(())
    }

    fn discover_services(&self) -> Result<(), RadioError> {
        Ok(())
    }

    fn write_cccd(&self, _service: Uuid, characteristic: Uuid, mode: SubscriptionMode) -> Result<(), RadioError> {
        self.subscriptions.lock().unwrap().push((characteristic, mode));
        Ok(())
    }

    fn read_characteristic(&self, _service: Uuid, _characteristic: Uuid) -> Result<(), RadioError> {
        Ok(())
    }

    fn write_characteristic(&self, _service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), RadioError> {
        self.writes.lock().unwrap().push((characteristic, value.to_vec()));
        Ok(())
    }

    fn disconnect(&self) {}

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MemoryFlag(AtomicBool);

impl MemoryFlag {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(enabled)))
    }
}

impl SessionFlag for MemoryFlag {
    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct CollectingSink(Mutex<Vec<StatusUpdate>>);

impl CollectingSink {
    pub fn last_record(&self) -> Option<StatusRecord> {
        self.0.lock().unwrap().iter().rev().find_map(|u| match u {
            StatusUpdate::Record(record) => Some(record.clone()),
            StatusUpdate::Link(_) => None,
        })
    }
}

impl StatusSink for CollectingSink {
    fn publish(&self, update: StatusUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

pub fn accessory() -> DeviceHandle {
    DeviceHandle {
        address: "24:0A:C4:00:11:22".into(),
        name: Some("GPS-C3".into()),
        service_uuids: vec![GPS_SERVICE_UUID],
        rssi: Some(-61),
    }
}

pub fn gnss_service() -> ServiceInfo {
    let notify = CharacteristicProperties {
        read: true,
        notify: true,
        ..Default::default()
    };
    let indicate = CharacteristicProperties {
        read: true,
        indicate: true,
        ..Default::default()
    };
    ServiceInfo {
        uuid: GPS_SERVICE_UUID,
        characteristics: vec![
            CharacteristicInfo {
                uuid: COORDINATES_CHAR_UUID,
                properties: notify,
                has_cccd: true,
            },
            CharacteristicInfo {
                uuid: STATUS_CHAR_UUID,
                properties: indicate,
                has_cccd: true,
            },
        ],
    }
}

pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
