//! WinRT Radio Backend
//!
//! Implements [`Radio`] on top of `Windows.Devices.Bluetooth`. WinRT calls
//! run on a dedicated thread with its own current-thread runtime; the
//! [`WinRtRadio`] handle only forwards commands to it.

use crate::domain::models::DeviceHandle;
use crate::error::SCAN_FAILED_INTERNAL_ERROR;
use crate::infrastructure::bluetooth::protocol::CCCD_UUID;
use crate::infrastructure::bluetooth::radio::{
    CharacteristicInfo, CharacteristicProperties, Radio, RadioError, RadioEvent, ScanFilter, ServiceInfo,
    SubscriptionMode, GATT_FAILURE, GATT_SUCCESS,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use windows::core::{Ref, GUID};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothError, BluetoothLEDevice,
};
use windows::Devices::Radios::{Radio as SystemRadio, RadioState};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// ATT default MTU, reported when no GATT session is open.
const DEFAULT_ATT_MTU: u16 = 23;

#[derive(Debug)]
enum RadioCommand {
    StartScan(Vec<ScanFilter>),
    StopScan,
    Connect(DeviceHandle),
    RequestMtu(u16),
    DiscoverServices,
    WriteCccd {
        service: Uuid,
        characteristic: Uuid,
        mode: SubscriptionMode,
    },
    Read {
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnect,
    Close,
}

/// Handle to the WinRT radio thread
pub struct WinRtRadio {
    commands: mpsc::UnboundedSender<RadioCommand>,
    powered: Arc<AtomicBool>,
}

impl WinRtRadio {
    /// Spawn the radio thread; callbacks are delivered on `events`.
    pub fn new(events: mpsc::UnboundedSender<RadioEvent>) -> anyhow::Result<Self> {
        let (commands, mut receiver) = mpsc::unbounded_channel();
        // Unknown until the radio query answers; a failed query must not block scanning
        let powered = Arc::new(AtomicBool::new(radio_powered(None)));
        let thread_powered = powered.clone();

        // WinRT objects stay on this thread
        std::thread::Builder::new()
            .name("winrt-radio".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime for Bluetooth: {}", e);
                        return;
                    }
                };

                rt.block_on(async move {
                    let mut backend = Backend::new(events, thread_powered);
                    if let Err(e) = backend.watch_radio_state().await {
                        warn!("Bluetooth radio state unavailable: {}", e);
                    }
                    while let Some(command) = receiver.recv().await {
                        backend.handle(command).await;
                    }
                    backend.release();
                    debug!("WinRT radio thread finished");
                });
            })?;

        Ok(Self { commands, powered })
    }

    fn send(&self, command: RadioCommand) -> Result<(), RadioError> {
        self.commands
            .send(command)
            .map_err(|_| RadioError("Bluetooth thread stopped".to_string()))
    }
}

impl Radio for WinRtRadio {
    fn is_powered_on(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn start_scan(&self, filters: &[ScanFilter]) -> Result<(), RadioError> {
        self.send(RadioCommand::StartScan(filters.to_vec()))
    }

    fn stop_scan(&self) {
        let _ = self.send(RadioCommand::StopScan);
    }

    fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        if parse_address(&device.address).is_none() {
            return Err(RadioError(format!("invalid Bluetooth address {}", device.address)));
        }
        self.send(RadioCommand::Connect(device.clone()))
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), RadioError> {
        self.send(RadioCommand::RequestMtu(mtu))
    }

    fn discover_services(&self) -> Result<(), RadioError> {
        self.send(RadioCommand::DiscoverServices)
    }

    fn write_cccd(&self, service: Uuid, characteristic: Uuid, mode: SubscriptionMode) -> Result<(), RadioError> {
        self.send(RadioCommand::WriteCccd {
            service,
            characteristic,
            mode,
        })
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError> {
        self.send(RadioCommand::Read {
            service,
            characteristic,
        })
    }

    fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), RadioError> {
        self.send(RadioCommand::Write {
            service,
            characteristic,
            value: value.to_vec(),
        })
    }

    fn disconnect(&self) {
        let _ = self.send(RadioCommand::Disconnect);
    }

    fn close(&self) {
        let _ = self.send(RadioCommand::Close);
    }
}

/// State owned by the radio thread
struct Backend {
    events: mpsc::UnboundedSender<RadioEvent>,
    powered: Arc<AtomicBool>,
    system_radio: Option<SystemRadio>,
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    device: Option<BluetoothLEDevice>,
    address: Option<String>,
    session: Option<GattSession>,
    services: Vec<GattDeviceService>,
    characteristics: HashMap<(Uuid, Uuid), GattCharacteristic>,
}

impl Backend {
    fn new(events: mpsc::UnboundedSender<RadioEvent>, powered: Arc<AtomicBool>) -> Self {
        Self {
            events,
            powered,
            system_radio: None,
            watcher: None,
            device: None,
            address: None,
            session: None,
            services: Vec::new(),
            characteristics: HashMap::new(),
        }
    }

    async fn handle(&mut self, command: RadioCommand) {
        debug!("WinRT radio command: {:?}", command);
        match command {
            RadioCommand::StartScan(filters) => {
                debug!("Advertisement filters applied by the transport: {:?}", filters);
                if let Err(e) = self.start_scan() {
                    error!("Failed to start advertisement watcher: {}", e);
                    self.emit(RadioEvent::ScanFailed(SCAN_FAILED_INTERNAL_ERROR));
                }
            }
            RadioCommand::StopScan => self.stop_scan(),
            RadioCommand::Connect(device) => {
                let address = device.address.clone();
                let result = match parse_address(&address) {
                    Some(raw) => self.connect(raw, device).await.map_err(|e| e.to_string()),
                    None => Err("invalid Bluetooth address".to_string()),
                };
                if let Err(e) = result {
                    error!("Failed to connect to {}: {}", address, e);
                    self.release();
                    self.emit(RadioEvent::ConnectionStateChanged {
                        device: address,
                        connected: false,
                    });
                }
            }
            RadioCommand::RequestMtu(requested) => {
                // Windows negotiates the MTU itself; report what the session ended up with
                let mtu = self
                    .session
                    .as_ref()
                    .and_then(|s| s.MaxPduSize().ok())
                    .unwrap_or(DEFAULT_ATT_MTU);
                debug!("Requested MTU {}, session reports {}", requested, mtu);
                self.emit(RadioEvent::MtuChanged {
                    mtu,
                    success: self.session.is_some(),
                });
            }
            RadioCommand::DiscoverServices => {
                if let Err(e) = self.discover_services().await {
                    error!("Service discovery failed: {}", e);
                    self.emit(RadioEvent::ServicesDiscovered {
                        status: GATT_FAILURE,
                        services: Vec::new(),
                    });
                }
            }
            RadioCommand::WriteCccd {
                service,
                characteristic,
                mode,
            } => {
                let success = match self.write_cccd(service, characteristic, mode).await {
                    Ok(success) => success,
                    Err(e) => {
                        // 0x800704C7: the user dismissed the pairing prompt
                        warn!("CCCD write for {} failed: {:?}", characteristic, e);
                        false
                    }
                };
                self.emit(RadioEvent::DescriptorWritten {
                    characteristic,
                    success,
                });
            }
            RadioCommand::Read {
                service,
                characteristic,
            } => {
                let (value, status) = match self.read(service, characteristic).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("Read of {} failed: {}", characteristic, e);
                        (Vec::new(), GATT_FAILURE)
                    }
                };
                self.emit(RadioEvent::CharacteristicRead {
                    uuid: characteristic,
                    value,
                    status,
                });
            }
            RadioCommand::Write {
                service,
                characteristic,
                value,
            } => {
                if let Err(e) = self.write(service, characteristic, &value).await {
                    warn!("Write to {} failed: {}", characteristic, e);
                }
            }
            RadioCommand::Disconnect => {
                let address = self.address.clone();
                self.release();
                if let Some(device) = address {
                    self.emit(RadioEvent::ConnectionStateChanged {
                        device,
                        connected: false,
                    });
                }
            }
            RadioCommand::Close => self.release(),
        }
    }

    async fn watch_radio_state(&mut self) -> windows::core::Result<()> {
        let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
        let radio = adapter.GetRadioAsync()?.await?;
        self.powered.store(radio_powered(Some(radio.State()?)), Ordering::SeqCst);
        info!("Bluetooth radio state: {:?}", radio.State()?);

        let powered = self.powered.clone();
        radio.StateChanged(&TypedEventHandler::new(
            move |sender: Ref<SystemRadio>, _: Ref<windows::core::IInspectable>| {
                if let Some(radio) = sender.as_ref() {
                    let on = radio_powered(Some(radio.State()?));
                    info!("Bluetooth radio {}", if on { "on" } else { "off" });
                    powered.store(on, Ordering::SeqCst);
                }
                Ok(())
            },
        ))?;
        self.system_radio = Some(radio);
        Ok(())
    }

    fn start_scan(&mut self) -> windows::core::Result<()> {
        self.stop_scan();

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let events = self.events.clone();
        watcher.Received(&TypedEventHandler::new(
            move |_: Ref<BluetoothLEAdvertisementWatcher>, args: Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let advertisement = args.Advertisement()?;
                    let uuids = advertisement.ServiceUuids()?;
                    let mut service_uuids = Vec::new();
                    for i in 0..uuids.Size()? {
                        service_uuids.push(from_guid(uuids.GetAt(i)?));
                    }
                    let name = advertisement.LocalName()?.to_string();

                    let device = DeviceHandle {
                        address: format_address(args.BluetoothAddress()?),
                        name: (!name.is_empty()).then_some(name),
                        service_uuids,
                        rssi: Some(args.RawSignalStrengthInDBm()?),
                    };
                    let _ = events.send(RadioEvent::ScanResult(device));
                }
                Ok(())
            },
        ))?;

        let events = self.events.clone();
        watcher.Stopped(&TypedEventHandler::new(
            move |_: Ref<BluetoothLEAdvertisementWatcher>, args: Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success {
                        let _ = events.send(RadioEvent::ScanFailed(error.0));
                    }
                }
                Ok(())
            },
        ))?;

        watcher.Start()?;
        info!("Advertisement watcher started");
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop advertisement watcher: {}", e);
            }
        }
    }

    /// Open the device and a GATT session; the session open counts as link-up.
    async fn connect(&mut self, address: u64, device: DeviceHandle) -> windows::core::Result<()> {
        self.release();
        info!("Connecting to Bluetooth device: {:#X}", address);
        let le_device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

        let session = GattSession::FromDeviceIdAsync(&le_device.BluetoothDeviceId()?)?.await?;
        session.SetMaintainConnection(true)?;
        info!("GattSession created, MaintainConnection set to true");

        let events = self.events.clone();
        let reported_address = device.address.clone();
        le_device.ConnectionStatusChanged(&TypedEventHandler::new(
            move |dev: Ref<BluetoothLEDevice>, _: Ref<windows::core::IInspectable>| {
                if let Some(dev) = dev.as_ref() {
                    let connected = dev.ConnectionStatus()? == BluetoothConnectionStatus::Connected;
                    let _ = events.send(RadioEvent::ConnectionStateChanged {
                        device: reported_address.clone(),
                        connected,
                    });
                }
                Ok(())
            },
        ))?;

        self.device = Some(le_device);
        self.session = Some(session);
        self.address = Some(device.address.clone());
        self.emit(RadioEvent::ConnectionStateChanged {
            device: device.address,
            connected: true,
        });
        Ok(())
    }

    async fn discover_services(&mut self) -> windows::core::Result<()> {
        let Some(device) = self.device.clone() else {
            self.emit(RadioEvent::ServicesDiscovered {
                status: GATT_FAILURE,
                services: Vec::new(),
            });
            return Ok(());
        };

        let result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get GATT services: {:?}", status);
            self.emit(RadioEvent::ServicesDiscovered {
                status: status.0,
                services: Vec::new(),
            });
            return Ok(());
        }

        let services = result.Services()?;
        let mut infos = Vec::new();
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let service_uuid = from_guid(service.Uuid()?);
            let mut characteristics = Vec::new();

            let chars_result = service.GetCharacteristicsAsync()?.await?;
            if chars_result.Status()? == GattCommunicationStatus::Success {
                let list = chars_result.Characteristics()?;
                for j in 0..list.Size()? {
                    let characteristic = list.GetAt(j)?;
                    let uuid = from_guid(characteristic.Uuid()?);
                    let properties = characteristic.CharacteristicProperties()?;
                    let has = |flag: GattCharacteristicProperties| properties.0 & flag.0 != 0;

                    let descriptors = characteristic
                        .GetDescriptorsForUuidAsync(to_guid(CCCD_UUID))?
                        .await?;
                    let has_cccd = descriptors.Status()? == GattCommunicationStatus::Success
                        && descriptors.Descriptors()?.Size()? > 0;

                    characteristics.push(CharacteristicInfo {
                        uuid,
                        properties: CharacteristicProperties {
                            read: has(GattCharacteristicProperties::Read),
                            write: has(GattCharacteristicProperties::Write)
                                || has(GattCharacteristicProperties::WriteWithoutResponse),
                            notify: has(GattCharacteristicProperties::Notify),
                            indicate: has(GattCharacteristicProperties::Indicate),
                        },
                        has_cccd,
                    });
                    self.characteristics.insert((service_uuid, uuid), characteristic);
                }
            } else {
                warn!("Characteristics of {} unavailable", service_uuid);
            }

            infos.push(ServiceInfo {
                uuid: service_uuid,
                characteristics,
            });
            self.services.push(service);
        }

        info!("Found {} GATT services", infos.len());
        self.emit(RadioEvent::ServicesDiscovered {
            status: GATT_SUCCESS,
            services: infos,
        });
        Ok(())
    }

    async fn write_cccd(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        mode: SubscriptionMode,
    ) -> windows::core::Result<bool> {
        let Some(target) = self.characteristics.get(&(service, characteristic)).cloned() else {
            warn!("Characteristic {} not cached", characteristic);
            return Ok(false);
        };

        let events = self.events.clone();
        target.ValueChanged(&TypedEventHandler::new(
            move |_: Ref<GattCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = events.send(RadioEvent::CharacteristicChanged {
                        uuid: characteristic,
                        value,
                    });
                }
                Ok(())
            },
        ))?;

        let value = match mode {
            SubscriptionMode::Notify => GattClientCharacteristicConfigurationDescriptorValue::Notify,
            SubscriptionMode::Indicate => GattClientCharacteristicConfigurationDescriptorValue::Indicate,
        };
        let status = target
            .WriteClientCharacteristicConfigurationDescriptorAsync(value)?
            .await?;
        Ok(status == GattCommunicationStatus::Success)
    }

    async fn read(&mut self, service: Uuid, characteristic: Uuid) -> windows::core::Result<(Vec<u8>, i32)> {
        let Some(target) = self.characteristics.get(&(service, characteristic)).cloned() else {
            return Ok((Vec::new(), GATT_FAILURE));
        };
        let result = target
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Ok((Vec::new(), status.0));
        }
        Ok((read_buffer(&result.Value()?)?, GATT_SUCCESS))
    }

    async fn write(&mut self, service: Uuid, characteristic: Uuid, value: &[u8]) -> windows::core::Result<()> {
        let Some(target) = self.characteristics.get(&(service, characteristic)).cloned() else {
            warn!("Characteristic {} not cached", characteristic);
            return Ok(());
        };
        let writer = DataWriter::new()?;
        writer.WriteBytes(value)?;
        let buffer = writer.DetachBuffer()?;
        let status = target.WriteValueAsync(&buffer)?.await?;
        if status != GattCommunicationStatus::Success {
            warn!("Write to {} returned {:?}", characteristic, status);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.characteristics.clear();
        for service in self.services.drain(..) {
            let _ = service.Close();
        }
        if let Some(session) = self.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = self.device.take() {
            debug!("Closing {:?}", self.address);
            let _ = device.Close();
        }
        self.address = None;
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }
}

/// An unknown radio state counts as powered; the scan itself reports failures.
fn radio_powered(state: Option<RadioState>) -> bool {
    state.map_or(true, |state| state == RadioState::On)
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; buffer.Length()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn from_guid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_address(address: &str) -> Option<u64> {
    u64::from_str_radix(&address.replace(':', ""), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let formatted = format_address(0x240A_C400_1122);
        assert_eq!(formatted, "24:0A:C4:00:11:22");
        assert_eq!(parse_address(&formatted), Some(0x240A_C400_1122));
        assert_eq!(parse_address("not an address"), None);
    }

    #[test]
    fn test_unknown_radio_state_counts_as_powered() {
        assert!(radio_powered(None));
        assert!(radio_powered(Some(RadioState::On)));
        assert!(!radio_powered(Some(RadioState::Off)));
        assert!(!radio_powered(Some(RadioState::Disabled)));
    }

    #[test]
    fn test_guid_conversion() {
        assert_eq!(from_guid(to_guid(CCCD_UUID)), CCCD_UUID);
    }
}
