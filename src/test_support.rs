//! In-memory fakes for the bridge ports, shared by the unit tests.

use crate::domain::models::{Capability, DeviceHandle, LocationFix, StatusRecord, StatusUpdate};
use crate::domain::ports::{MockLocationSurface, PermissionQuery, SessionFlag, StatusSink, SurfaceError};
use crate::infrastructure::bluetooth::protocol::{COORDINATES_CHAR_UUID, GPS_SERVICE_UUID, STATUS_CHAR_UUID};
use crate::infrastructure::bluetooth::radio::{
    CharacteristicInfo, CharacteristicProperties, Radio, RadioError, ScanFilter, ServiceInfo, SubscriptionMode,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RadioCall {
    StartScan(Vec<ScanFilter>),
    StopScan,
    Connect(String),
    RequestMtu(u16),
    DiscoverServices,
    WriteCccd { characteristic: Uuid, mode: SubscriptionMode },
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Disconnect,
    Close,
}

pub struct FakeRadio {
    calls: Mutex<Vec<RadioCall>>,
    powered: AtomicBool,
    fail_connect: AtomicBool,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            powered: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &RadioCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn scans_started(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, RadioCall::StartScan(_)))
            .count()
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Radio for FakeRadio {
    fn is_powered_on(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn start_scan(&self, filters: &[ScanFilter]) -> Result<(), RadioError> {
        self.record(RadioCall::StartScan(filters.to_vec()));
        Ok(())
    }

    fn stop_scan(&self) {
        self.record(RadioCall::StopScan);
    }

    fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        self.record(RadioCall::Connect(device.address.clone()));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(RadioError("gatt unavailable".into()));
        }
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), RadioError> {
        self.record(RadioCall::RequestMtu(mtu));
        Ok(())
    }

    fn discover_services(&self) -> Result<(), RadioError> {
        self.record(RadioCall::DiscoverServices);
        Ok(())
    }

    fn write_cccd(&self, _service: Uuid, characteristic: Uuid, mode: SubscriptionMode) -> Result<(), RadioError> {
        self.record(RadioCall::WriteCccd { characteristic, mode });
        Ok(())
    }

    fn read_characteristic(&self, _service: Uuid, characteristic: Uuid) -> Result<(), RadioError> {
        self.record(RadioCall::Read(characteristic));
        Ok(())
    }

    fn write_characteristic(&self, _service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), RadioError> {
        self.record(RadioCall::Write(characteristic, value.to_vec()));
        Ok(())
    }

    fn disconnect(&self) {
        self.record(RadioCall::Disconnect);
    }

    fn close(&self) {
        self.record(RadioCall::Close);
    }
}

pub struct FakePermissions {
    granted: Mutex<HashSet<Capability>>,
}

impl FakePermissions {
    pub fn all() -> Arc<Self> {
        Self::with(&[
            Capability::Scan,
            Capability::Connect,
            Capability::FineLocation,
            Capability::CoarseLocation,
        ])
    }

    pub fn none() -> Arc<Self> {
        Self::with(&[])
    }

    pub fn with(capabilities: &[Capability]) -> Arc<Self> {
        Arc::new(Self {
            granted: Mutex::new(capabilities.iter().copied().collect()),
        })
    }

    pub fn grant(&self, capability: Capability) {
        self.granted.lock().unwrap().insert(capability);
    }

    pub fn revoke(&self, capability: Capability) {
        self.granted.lock().unwrap().remove(&capability);
    }
}

impl PermissionQuery for FakePermissions {
    fn has_capability(&self, capability: Capability) -> bool {
        self.granted.lock().unwrap().contains(&capability)
    }
}

pub struct FakeFlag(AtomicBool);

impl FakeFlag {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(enabled)))
    }
}

impl SessionFlag for FakeFlag {
    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<StatusRecord> {
        self.updates()
            .into_iter()
            .filter_map(|u| match u {
                StatusUpdate::Record(record) => Some(record),
                StatusUpdate::Link(_) => None,
            })
            .collect()
    }

    pub fn last_record(&self) -> Option<StatusRecord> {
        self.records().pop()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&self, update: StatusUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// Mock location surface that remembers every provider call.
pub struct FakeSurface {
    allowed: AtomicBool,
    /// provider name -> enabled
    providers: Mutex<BTreeMap<String, bool>>,
    pushes: Mutex<Vec<(String, LocationFix)>>,
    /// Providers whose add_test_provider call fails
    reject_add: Mutex<HashSet<String>>,
    /// Providers that answer the next location push with a revocation
    revoke_on_push: Mutex<HashSet<String>>,
    /// Providers whose pushes fail with a generic error
    reject_push: Mutex<HashSet<String>>,
    removals: Mutex<Vec<String>>,
    /// Every add_test_provider call, rejected or not
    adds: Mutex<Vec<String>>,
}

impl FakeSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            allowed: AtomicBool::new(true),
            providers: Mutex::new(BTreeMap::new()),
            pushes: Mutex::new(Vec::new()),
            reject_add: Mutex::new(HashSet::new()),
            revoke_on_push: Mutex::new(HashSet::new()),
            reject_push: Mutex::new(HashSet::new()),
            removals: Mutex::new(Vec::new()),
            adds: Mutex::new(Vec::new()),
        })
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn reject_add(&self, provider: &str) {
        self.reject_add.lock().unwrap().insert(provider.to_string());
    }

    pub fn allow_add(&self, provider: &str) {
        self.reject_add.lock().unwrap().remove(provider);
    }

    pub fn revoke_on_push(&self, provider: &str) {
        self.revoke_on_push.lock().unwrap().insert(provider.to_string());
    }

    pub fn reject_push(&self, provider: &str) {
        self.reject_push.lock().unwrap().insert(provider.to_string());
    }

    pub fn pushes(&self) -> Vec<(String, LocationFix)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn pushes_to(&self, provider: &str) -> usize {
        self.pushes.lock().unwrap().iter().filter(|(p, _)| p == provider).count()
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.providers.lock().unwrap().get(provider).copied().unwrap_or(false)
    }

    pub fn registered(&self) -> Vec<String> {
        self.providers.lock().unwrap().keys().cloned().collect()
    }

    pub fn removals(&self) -> Vec<String> {
        self.removals.lock().unwrap().clone()
    }

    pub fn removals_of(&self, provider: &str) -> usize {
        self.removals.lock().unwrap().iter().filter(|p| *p == provider).count()
    }

    pub fn adds_of(&self, provider: &str) -> usize {
        self.adds.lock().unwrap().iter().filter(|p| *p == provider).count()
    }

    /// The system drops a provider behind the app's back.
    pub fn drop_provider(&self, provider: &str) {
        self.providers.lock().unwrap().remove(provider);
    }
}

impl MockLocationSurface for FakeSurface {
    fn is_mock_provider_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    fn add_test_provider(&self, provider: &str) -> Result<(), SurfaceError> {
        self.adds.lock().unwrap().push(provider.to_string());
        if self.reject_add.lock().unwrap().contains(provider) {
            return Err(SurfaceError::Rejected(format!("cannot add {}", provider)));
        }
        self.providers.lock().unwrap().insert(provider.to_string(), false);
        Ok(())
    }

    fn remove_test_provider(&self, provider: &str) -> Result<(), SurfaceError> {
        self.removals.lock().unwrap().push(provider.to_string());
        match self.providers.lock().unwrap().remove(provider) {
            Some(_) => Ok(()),
            None => Err(SurfaceError::NotTestProvider(provider.to_string())),
        }
    }

    fn set_test_provider_enabled(&self, provider: &str, enabled: bool) -> Result<(), SurfaceError> {
        match self.providers.lock().unwrap().get_mut(provider) {
            Some(state) => {
                *state = enabled;
                Ok(())
            }
            None => Err(SurfaceError::NotTestProvider(provider.to_string())),
        }
    }

    fn set_test_provider_location(&self, provider: &str, fix: &LocationFix) -> Result<(), SurfaceError> {
        if self.revoke_on_push.lock().unwrap().remove(provider) {
            self.providers.lock().unwrap().remove(provider);
            return Err(SurfaceError::NotTestProvider(provider.to_string()));
        }
        if self.reject_push.lock().unwrap().contains(provider) {
            return Err(SurfaceError::Rejected("provider busy".into()));
        }
        if !self.providers.lock().unwrap().contains_key(provider) {
            return Err(SurfaceError::NotTestProvider(provider.to_string()));
        }
        self.pushes.lock().unwrap().push((provider.to_string(), fix.clone()));
        Ok(())
    }
}

pub fn accessory() -> DeviceHandle {
    DeviceHandle {
        address: "24:0A:C4:00:11:22".into(),
        name: Some("GPS-C3".into()),
        service_uuids: vec![GPS_SERVICE_UUID],
        rssi: Some(-58),
    }
}

/// GNSS service as advertised by the accessory firmware.
pub fn gnss_service() -> ServiceInfo {
    ServiceInfo {
        uuid: GPS_SERVICE_UUID,
        characteristics: vec![
            CharacteristicInfo {
                uuid: COORDINATES_CHAR_UUID,
                properties: CharacteristicProperties {
                    read: true,
                    notify: true,
                    ..Default::default()
                },
                has_cccd: true,
            },
            CharacteristicInfo {
                uuid: STATUS_CHAR_UUID,
                properties: CharacteristicProperties {
                    read: true,
                    indicate: true,
                    ..Default::default()
                },
                has_cccd: true,
            },
        ],
    }
}

pub fn drain<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = receiver.try_recv() {
        items.push(item);
    }
    items
}
