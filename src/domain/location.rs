//! Derived location fields
//!
//! Accuracy, altitude and speed resolution for fixes pushed to the mock
//! providers. All functions are pure so they can be tuned and tested without
//! a provider surface.

/// HDOP assumed when the accessory has not reported a usable value.
pub const DEFAULT_HDOP: f64 = 1.5;
/// Meters of horizontal error per unit of HDOP.
pub const HDOP_TO_ACCURACY_METERS: f64 = 5.0;
pub const MIN_ACCURACY_METERS: f32 = 3.0;
pub const MAX_ACCURACY_METERS: f32 = 50.0;
/// Displacement below which the receiver is treated as stationary.
pub const MIN_MOVEMENT_THRESHOLD_METERS: f64 = 0.1;

/// Mean earth radius (IUGG) in meters.
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Tunables for [`accuracy_from_hdop`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyPolicy {
    pub default_hdop: f64,
    pub scale: f64,
    pub min_meters: f32,
    pub max_meters: f32,
}

impl Default for AccuracyPolicy {
    fn default() -> Self {
        Self {
            default_hdop: DEFAULT_HDOP,
            scale: HDOP_TO_ACCURACY_METERS,
            min_meters: MIN_ACCURACY_METERS,
            max_meters: MAX_ACCURACY_METERS,
        }
    }
}

/// Map HDOP to an accuracy estimate in meters.
///
/// Non-finite or non-positive HDOP falls back to the policy default before
/// scaling; the result is clamped to `[min_meters, max_meters]`.
pub fn accuracy_from_hdop(hdop: Option<f64>, policy: &AccuracyPolicy) -> f32 {
    let hdop = hdop
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(policy.default_hdop);
    let accuracy = (hdop * policy.scale) as f32;
    accuracy.clamp(policy.min_meters, policy.max_meters)
}

/// Latest finite BLE altitude, else the previous fix's altitude.
pub fn resolve_altitude(latest: Option<f64>, previous_fix: Option<f64>) -> Option<f64> {
    match latest {
        Some(altitude) if altitude.is_finite() => Some(altitude),
        _ => previous_fix,
    }
}

/// Previous fix used for speed derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviousPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Seconds elapsed between the previous fix and the current one
    pub elapsed_secs: f64,
}

/// Speed from the accessory when usable, otherwise derived from displacement.
pub fn resolve_speed(
    direct: Option<f64>,
    latitude: f64,
    longitude: f64,
    previous: Option<PreviousPosition>,
) -> Option<f64> {
    if let Some(speed) = direct.filter(|s| s.is_finite() && *s >= 0.0) {
        return Some(speed);
    }

    let previous = previous?;
    if previous.elapsed_secs <= 0.0 {
        return None;
    }

    let distance = distance_meters(previous.latitude, previous.longitude, latitude, longitude);
    if distance < MIN_MOVEMENT_THRESHOLD_METERS {
        return Some(0.0);
    }

    Some(distance / previous.elapsed_secs).filter(|s| s.is_finite() && *s >= 0.0)
}

/// Great-circle distance between two WGS84 coordinates (haversine).
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Degrees of latitude spanning `meters` along a meridian.
    fn lat_offset(meters: f64) -> f64 {
        (meters / EARTH_RADIUS_METERS).to_degrees()
    }

    #[test]
    fn test_accuracy_mapping() {
        let policy = AccuracyPolicy::default();
        assert_eq!(accuracy_from_hdop(Some(1.0), &policy), 5.0);
        assert_eq!(accuracy_from_hdop(Some(20.0), &policy), 50.0);
        assert_eq!(accuracy_from_hdop(Some(0.1), &policy), 3.0);
    }

    #[test]
    fn test_accuracy_invalid_hdop_uses_default() {
        let policy = AccuracyPolicy::default();
        assert_eq!(accuracy_from_hdop(None, &policy), 7.5);
        assert_eq!(accuracy_from_hdop(Some(f64::NAN), &policy), 7.5);
        assert_eq!(accuracy_from_hdop(Some(0.0), &policy), 7.5);
        assert_eq!(accuracy_from_hdop(Some(-2.0), &policy), 7.5);
    }

    #[test]
    fn test_altitude_carried_forward() {
        assert_eq!(resolve_altitude(Some(12.5), Some(3.0)), Some(12.5));
        assert_eq!(resolve_altitude(None, Some(3.0)), Some(3.0));
        assert_eq!(resolve_altitude(Some(f64::INFINITY), Some(3.0)), Some(3.0));
        assert_eq!(resolve_altitude(None, None), None);
    }

    #[test]
    fn test_speed_prefers_direct_value() {
        let previous = PreviousPosition {
            latitude: 0.0,
            longitude: 0.0,
            elapsed_secs: 1.0,
        };
        assert_eq!(resolve_speed(Some(4.2), 1.0, 1.0, Some(previous)), Some(4.2));
    }

    #[test]
    fn test_speed_derived_from_displacement() {
        let previous = PreviousPosition {
            latitude: 48.0,
            longitude: 11.0,
            elapsed_secs: 5.0,
        };
        let speed = resolve_speed(None, 48.0 + lat_offset(10.0), 11.0, Some(previous)).unwrap();
        assert!((speed - 2.0).abs() < 0.01, "speed was {}", speed);
    }

    #[test]
    fn test_speed_below_movement_threshold_is_zero() {
        let previous = PreviousPosition {
            latitude: 48.0,
            longitude: 11.0,
            elapsed_secs: 5.0,
        };
        let speed = resolve_speed(None, 48.0 + lat_offset(0.05), 11.0, Some(previous));
        assert_eq!(speed, Some(0.0));
    }

    #[test]
    fn test_speed_without_history() {
        assert_eq!(resolve_speed(None, 1.0, 1.0, None), None);
        assert_eq!(resolve_speed(Some(-1.0), 1.0, 1.0, None), None);
        let previous = PreviousPosition {
            latitude: 1.0,
            longitude: 1.0,
            elapsed_secs: 0.0,
        };
        assert_eq!(resolve_speed(None, 1.1, 1.0, Some(previous)), None);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let d = distance_meters(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 1.0);
    }
}
