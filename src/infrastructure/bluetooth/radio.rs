//! Radio port
//!
//! Initiating calls go through [`Radio`]; everything the radio reports back
//! (scan results, link changes, GATT completions) arrives as [`RadioEvent`]s
//! on the channel handed to the platform backend.

use crate::domain::models::DeviceHandle;
use thiserror::Error;
use uuid::Uuid;

/// GATT status code for a successful operation.
pub const GATT_SUCCESS: i32 = 0;
/// Generic GATT failure status.
pub const GATT_FAILURE: i32 = 257;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RadioError(pub String);

/// Scan filter; a result is reported when any filter matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    ServiceUuid(Uuid),
    DeviceName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Whether the characteristic carries a client configuration descriptor
    pub has_cccd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Callback from the platform radio.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    ScanResult(DeviceHandle),
    ScanFailed(i32),
    ConnectionStateChanged {
        device: String,
        connected: bool,
    },
    MtuChanged {
        mtu: u16,
        success: bool,
    },
    ServicesDiscovered {
        status: i32,
        services: Vec<ServiceInfo>,
    },
    CharacteristicChanged {
        uuid: Uuid,
        value: Vec<u8>,
    },
    CharacteristicRead {
        uuid: Uuid,
        value: Vec<u8>,
        status: i32,
    },
    DescriptorWritten {
        characteristic: Uuid,
        success: bool,
    },
}

/// Platform BLE central.
///
/// Every call returns immediately. Completion is reported through the
/// matching [`RadioEvent`]. An `Err` means the request could not even be
/// issued.
pub trait Radio: Send + Sync {
    fn is_powered_on(&self) -> bool;

    fn start_scan(&self, filters: &[ScanFilter]) -> Result<(), RadioError>;

    fn stop_scan(&self);

    fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError>;

    fn request_mtu(&self, mtu: u16) -> Result<(), RadioError>;

    fn discover_services(&self) -> Result<(), RadioError>;

    fn write_cccd(&self, service: Uuid, characteristic: Uuid, mode: SubscriptionMode) -> Result<(), RadioError>;

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError>;

    fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), RadioError>;

    fn disconnect(&self);

    /// Release every handle held for the current peripheral.
    fn close(&self);
}
