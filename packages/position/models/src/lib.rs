#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Device position types.
//!
//! A [`Position`] is a single fix delivered by the platform location
//! sensor. Fixes are immutable once captured and are consumed by the alert
//! dispatcher as they arrive.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single location fix from the device sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Latitude in degrees (WGS84).
    pub latitude: f64,
    /// Longitude in degrees (WGS84).
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    /// When the sensor captured this fix.
    pub timestamp: DateTime<Utc>,
    /// Ground speed in meters per second, if reported.
    pub speed: Option<f64>,
    /// Heading in degrees clockwise from true north, if reported.
    pub heading: Option<f64>,
    /// Altitude in meters above the WGS84 ellipsoid, if reported.
    pub altitude: Option<f64>,
}

impl Position {
    /// Creates a fix with only the required fields set.
    #[must_use]
    pub const fn new(
        latitude: f64,
        longitude: f64,
        accuracy: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp,
            speed: None,
            heading: None,
            altitude: None,
        }
    }

    /// How old this fix is relative to `now`. Fixes from the future count
    /// as zero age.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Sampling options for one-shot and continuous position requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PositionOptions {
    /// Request the most accurate fix the sensor can provide.
    pub enable_high_accuracy: bool,
    /// Minimum movement in meters before a new watch sample is delivered.
    pub distance_filter_m: f64,
    /// Minimum time between delivered watch samples.
    #[serde(with = "millis")]
    pub interval: Duration,
    /// How long a one-shot request may wait for a fix.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// A cached fix younger than this satisfies a one-shot request.
    #[serde(with = "millis")]
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            enable_high_accuracy: true,
            distance_filter_m: 10.0,
            interval: Duration::from_millis(5000),
            timeout: Duration::from_millis(15_000),
            maximum_age: Duration::from_millis(10_000),
        }
    }
}

/// Errors reported by the location sensor.
///
/// None of these are retried internally; they are handed to the caller
/// as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    /// The user or platform denied location access.
    #[error("Location permission denied")]
    PermissionDenied,

    /// The sensor could not produce a fix.
    #[error("Position unavailable: {message}")]
    PositionUnavailable {
        /// Platform-provided reason.
        message: String,
    },

    /// No fix arrived before the configured timeout.
    #[error("Timed out waiting for a position fix")]
    Timeout,
}

impl PositionError {
    /// Whether this error ends the tracking session outright.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_platform_defaults() {
        let options = PositionOptions::default();
        assert!(options.enable_high_accuracy);
        assert!((options.distance_filter_m - 10.0).abs() < f64::EPSILON);
        assert_eq!(options.interval, Duration::from_secs(5));
        assert_eq!(options.timeout, Duration::from_secs(15));
        assert_eq!(options.maximum_age, Duration::from_secs(10));
    }

    #[test]
    fn options_deserialize_with_partial_fields() {
        let options: PositionOptions =
            serde_json::from_str(r#"{"distanceFilterM": 25.0, "interval": 1000}"#).unwrap();
        assert!((options.distance_filter_m - 25.0).abs() < f64::EPSILON);
        assert_eq!(options.interval, Duration::from_secs(1));
        assert_eq!(options.timeout, Duration::from_secs(15));
    }

    #[test]
    fn age_of_future_fix_is_zero() {
        let now = Utc::now();
        let fix = Position::new(18.6, 73.7, 5.0, now + chrono::Duration::seconds(3));
        assert_eq!(fix.age_at(now), Duration::ZERO);
    }

    #[test]
    fn only_permission_denied_is_fatal() {
        assert!(PositionError::PermissionDenied.is_fatal());
        assert!(!PositionError::Timeout.is_fatal());
        assert!(
            !PositionError::PositionUnavailable {
                message: "no satellites".to_string()
            }
            .is_fatal()
        );
    }
}
