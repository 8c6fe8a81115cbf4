//! GNSS Accessory Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the BLE GNSS receiver: identifiers, scan filter and the JSON telemetry
//! codec.

use crate::domain::models::{DeviceHandle, FixType, TelemetryEvent};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// GNSS service exposed by the accessory
pub const GPS_SERVICE_UUID: Uuid = Uuid::from_u128(0x14f0514a_e15f_4ad3_89a6_b4cb3ac86abe);

/// Coordinates characteristic - `{"lt":..,"lg":..,"hd":..,"spd":..,"alt":..}`
pub const COORDINATES_CHAR_UUID: Uuid = Uuid::from_u128(0x12c64fea_7ed9_40be_9c7e_9912a5050d23);

/// Status characteristic - `{"fix":..,"hdop":..,"signals":[..],"ttff":..}`
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x3e4f5d6c_7b8a_9d0e_1f2a_3b4c5d6e7f8a);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Advertised name of the accessory firmware
pub const DEVICE_NAME: &str = "GPS-C3";

/// MTU requested right after link-up
pub const PREFERRED_MTU: u16 = 185;

/// Scan auto-stop when nothing matched
pub const SCAN_TIMEOUT_MS: u64 = 10_000;

/// Spacing between the two CCCD writes
pub const DESCRIPTOR_DELAY_MS: u64 = 100;

/// Filter criteria used to recognize the accessory during a scan.
///
/// Either criterion may match (OR semantics).
#[derive(Debug, Clone, PartialEq)]
pub struct AccessoryIdentity {
    pub service_uuid: Uuid,
    /// Exact name, or a prefix when it ends with `*`
    pub name_pattern: String,
    pub coordinates_char_uuid: Uuid,
    pub status_char_uuid: Uuid,
}

impl Default for AccessoryIdentity {
    fn default() -> Self {
        Self {
            service_uuid: GPS_SERVICE_UUID,
            name_pattern: DEVICE_NAME.to_string(),
            coordinates_char_uuid: COORDINATES_CHAR_UUID,
            status_char_uuid: STATUS_CHAR_UUID,
        }
    }
}

impl AccessoryIdentity {
    pub fn matches(&self, device: &DeviceHandle) -> bool {
        device.service_uuids.contains(&self.service_uuid)
            || device
                .name
                .as_deref()
                .is_some_and(|name| self.matches_name(name))
    }

    fn matches_name(&self, name: &str) -> bool {
        match self.name_pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == self.name_pattern,
        }
    }

    /// Which telemetry channel a characteristic carries, if any.
    pub fn channel(&self, characteristic: Uuid) -> Option<TelemetryChannel> {
        if characteristic == self.coordinates_char_uuid {
            Some(TelemetryChannel::Coordinates)
        } else if characteristic == self.status_char_uuid {
            Some(TelemetryChannel::Status)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryChannel {
    Coordinates,
    Status,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Decode a characteristic payload, logging and swallowing malformed input.
pub fn decode(identity: &AccessoryIdentity, characteristic: Uuid, payload: &[u8]) -> Vec<TelemetryEvent> {
    match try_decode(identity, characteristic, payload) {
        Ok(events) => events,
        Err(e) => {
            warn!(
                "Dropping malformed payload on {}: {} ({:?})",
                characteristic,
                e,
                String::from_utf8_lossy(payload)
            );
            Vec::new()
        }
    }
}

/// Decode a characteristic payload into telemetry events.
///
/// # Coordinates payload
///
/// ```text
/// lt   : latitude, degrees   (required)
/// lg   : longitude, degrees  (required)
/// hd   : heading, degrees    (optional)
/// spd  : speed, m/s          (optional)
/// alt  : altitude, meters    (optional)
/// ```
///
/// # Status payload
///
/// ```text
/// fix     : int, 1 = fixed, anything else = no fix
/// hdop    : float              (optional)
/// signals : [int], one per satellite (optional)
/// ttff    : int seconds        (optional)
/// ```
///
/// Missing or non-finite optional fields are skipped individually. Numbers
/// quoted as strings are accepted.
pub fn try_decode(
    identity: &AccessoryIdentity,
    characteristic: Uuid,
    payload: &[u8],
) -> Result<Vec<TelemetryEvent>, CodecError> {
    let Some(channel) = identity.channel(characteristic) else {
        debug!("No specific parsing for UUID {}", characteristic);
        return Ok(Vec::new());
    };

    let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
    let text = text.trim();
    trace!("Raw payload {:?}: {}", channel, text);

    let value: Value = serde_json::from_str(text).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(CodecError::NotAnObject)?;

    Ok(match channel {
        TelemetryChannel::Coordinates => decode_coordinates(object),
        TelemetryChannel::Status => decode_status(object),
    })
}

fn decode_coordinates(payload: &Map<String, Value>) -> Vec<TelemetryEvent> {
    let mut events = Vec::new();

    if let (Some(latitude), Some(longitude)) = (float_field(payload, "lt"), float_field(payload, "lg")) {
        events.push(TelemetryEvent::Coordinates {
            latitude,
            longitude,
        });
    }
    if let Some(heading) = float_field(payload, "hd") {
        events.push(TelemetryEvent::Heading(heading));
    }
    if let Some(speed) = float_field(payload, "spd") {
        events.push(TelemetryEvent::Speed(speed));
    }
    if let Some(altitude) = float_field(payload, "alt") {
        events.push(TelemetryEvent::Altitude(altitude));
    }

    events
}

fn decode_status(payload: &Map<String, Value>) -> Vec<TelemetryEvent> {
    let mut events = Vec::new();

    if let Some(raw) = int_field(payload, "fix") {
        events.push(TelemetryEvent::FixStatus {
            raw,
            fix_type: FixType::from_raw(raw),
        });
    }
    if let Some(hdop) = float_field(payload, "hdop") {
        events.push(TelemetryEvent::Hdop(hdop));
    }
    if let Some(signals) = payload.get("signals").and_then(Value::as_array) {
        let levels = signals.iter().map(|v| as_int(v).unwrap_or(0)).collect();
        events.push(TelemetryEvent::SignalLevels(levels));
    }
    if let Some(ttff) = int_field(payload, "ttff") {
        events.push(TelemetryEvent::Ttff(ttff));
    }

    events
}

fn float_field(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(as_float).filter(|v| v.is_finite())
}

fn int_field(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(as_int)
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|v| v.is_finite())
                .map(|v| v.trunc() as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|v| v.trunc() as i64)
            })
        }
        _ => None,
    }
}
