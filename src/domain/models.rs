use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Link state of a single transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    ServicesDiscovered,
}

/// Fix classification reported by the accessory.
///
/// Only raw value 1 counts as a fix. Status screens also know a 3D fix
/// (type 2), which is reported here as `NoFix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixType {
    NoFix,
    Fix,
}

impl FixType {
    pub fn from_raw(raw: i64) -> Self {
        if raw == 1 {
            Self::Fix
        } else {
            Self::NoFix
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::NoFix => 0,
            Self::Fix => 1,
        }
    }
}

/// One decoded piece of accessory telemetry.
///
/// A single characteristic payload may yield several events; fields arrive
/// independently and are cached by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Coordinates { latitude: f64, longitude: f64 },
    Heading(f64),
    Speed(f64),
    Altitude(f64),
    FixStatus { raw: i64, fix_type: FixType },
    Hdop(f64),
    SignalLevels(Vec<i64>),
    Ttff(i64),
}

/// Coarse per-satellite signal classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStrength {
    None,
    Weak,
    Medium,
    Strong,
}

/// Signal level at or above which a satellite counts as strong.
pub const STRONG_SIGNAL_MIN: i64 = 35;
/// Signal level at or above which a satellite counts as medium.
pub const MEDIUM_SIGNAL_MIN: i64 = 20;

impl SignalStrength {
    pub fn classify(level: i64) -> Self {
        if level >= STRONG_SIGNAL_MIN {
            Self::Strong
        } else if level >= MEDIUM_SIGNAL_MIN {
            Self::Medium
        } else if level >= 1 {
            Self::Weak
        } else {
            Self::None
        }
    }
}

/// Platform capability the core may need before a gated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scan,
    Connect,
    FineLocation,
    CoarseLocation,
}

/// Handle to a peripheral as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Radio address, unique per peripheral
    pub address: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Service UUIDs listed in the advertisement
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

impl DeviceHandle {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// A location record pushed to a mock provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy estimate in meters
    pub accuracy: f32,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    /// Wall-clock time (Unix milliseconds)
    pub timestamp_millis: i64,
    /// Monotonic time since session start
    pub monotonic_nanos: u64,
}

/// Registration state of one named mock provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderRegistration {
    pub registered: bool,
    pub enabled: bool,
}

/// Minimal link status broadcast on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub scanning: bool,
}

/// Human-readable status and telemetry published to the status sink.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatusRecord {
    pub running: bool,
    pub last_fix: Option<(f64, f64)>,
    pub error_message: Option<String>,
    pub fix_raw: Option<String>,
    pub fix_valid: Option<bool>,
    pub hdop: Option<f64>,
    pub signal_levels: Option<String>,
    pub satellite_count: Option<usize>,
    pub satellites_strong: Option<usize>,
    pub satellites_medium: Option<usize>,
    pub satellites_weak: Option<usize>,
    pub signal_percent: Option<i32>,
    pub fix_type: Option<i32>,
    pub ttff_seconds: Option<i64>,
    pub altitude_meters: Option<f64>,
    pub speed_mps: Option<f64>,
    pub heading_degrees: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Link(LinkStatus),
    Record(StatusRecord),
}
