//! Telemetry cache
//!
//! Accessory fields arrive independently (coordinates on one characteristic,
//! fix quality on another) and are merged into a snapshot that the location
//! pipeline and the status sink read from.

use crate::domain::models::{FixType, SignalStrength, StatusRecord, TelemetryEvent};

/// Latest known value of every telemetry field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySnapshot {
    pub fix_raw: Option<i64>,
    pub fix_type: Option<FixType>,
    pub hdop: Option<f64>,
    pub signal_levels: Option<Vec<i64>>,
    pub ttff_seconds: Option<i64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub last_coordinates: Option<(f64, f64)>,
}

/// Merge incoming events into the previous snapshot.
///
/// Per-field precedence: the incoming value wins when it is usable, otherwise
/// the previous value is carried forward.
///
/// - floats (`hdop`, `altitude`, `speed`, `heading`): incoming if finite
/// - `speed`: additionally must be non-negative
/// - coordinates: incoming if both components are finite
/// - fix status, signal levels, TTFF: incoming always
/// - later events in the same batch override earlier ones
pub fn merge_telemetry(previous: &TelemetrySnapshot, incoming: &[TelemetryEvent]) -> TelemetrySnapshot {
    let mut current = previous.clone();

    for event in incoming {
        match event {
            TelemetryEvent::Coordinates {
                latitude,
                longitude,
            } => {
                if latitude.is_finite() && longitude.is_finite() {
                    current.last_coordinates = Some((*latitude, *longitude));
                }
            }
            TelemetryEvent::Heading(deg) => current.heading = finite_or(*deg, current.heading),
            TelemetryEvent::Speed(mps) => {
                if mps.is_finite() && *mps >= 0.0 {
                    current.speed = Some(*mps);
                }
            }
            TelemetryEvent::Altitude(m) => current.altitude = finite_or(*m, current.altitude),
            TelemetryEvent::FixStatus { raw, fix_type } => {
                current.fix_raw = Some(*raw);
                current.fix_type = Some(*fix_type);
            }
            TelemetryEvent::Hdop(value) => current.hdop = finite_or(*value, current.hdop),
            TelemetryEvent::SignalLevels(levels) => current.signal_levels = Some(levels.clone()),
            TelemetryEvent::Ttff(seconds) => current.ttff_seconds = Some(*seconds),
        }
    }

    current
}

fn finite_or(incoming: f64, previous: Option<f64>) -> Option<f64> {
    if incoming.is_finite() {
        Some(incoming)
    } else {
        previous
    }
}

/// Per-severity breakdown of the visible satellites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSummary {
    pub total: usize,
    pub strong: usize,
    pub medium: usize,
    pub weak: usize,
}

pub fn summarize_signals(levels: &[i64]) -> SignalSummary {
    let mut summary = SignalSummary {
        total: levels.len(),
        ..Default::default()
    };
    for level in levels {
        match SignalStrength::classify(*level) {
            SignalStrength::Strong => summary.strong += 1,
            SignalStrength::Medium => summary.medium += 1,
            SignalStrength::Weak => summary.weak += 1,
            SignalStrength::None => {}
        }
    }
    summary
}

/// Rough 0..=100 signal quality derived from HDOP.
pub fn signal_percent(hdop: f64) -> i32 {
    (100.0 - hdop * 10.0).clamp(0.0, 100.0) as i32
}

/// Comma separated signal levels, as shown to the user.
pub fn format_signal_levels(levels: &[i64]) -> String {
    levels
        .iter()
        .map(|level| level.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl TelemetrySnapshot {
    /// Fill the telemetry part of a status record.
    pub fn apply_to(&self, record: &mut StatusRecord) {
        if let (Some(raw), Some(fix_type)) = (self.fix_raw, self.fix_type) {
            record.fix_raw = Some(format!("{},{}", raw, fix_type.code()));
            record.fix_valid = Some(raw == 1);
            record.fix_type = Some(fix_type.code());
        }
        if let Some(hdop) = self.hdop {
            record.hdop = Some(hdop);
            record.signal_percent = Some(signal_percent(hdop));
        }
        if let Some(levels) = &self.signal_levels {
            let summary = summarize_signals(levels);
            record.signal_levels = Some(format_signal_levels(levels));
            record.satellite_count = Some(summary.total);
            record.satellites_strong = Some(summary.strong);
            record.satellites_medium = Some(summary.medium);
            record.satellites_weak = Some(summary.weak);
        }
        record.ttff_seconds = self.ttff_seconds;
        record.altitude_meters = self.altitude;
        record.speed_mps = self.speed;
        record.heading_degrees = self.heading;
    }
}
