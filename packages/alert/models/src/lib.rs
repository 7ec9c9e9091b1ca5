#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Alert feed types.
//!
//! An [`AlertEvent`] is one entry in the officer's alert feed. It either
//! comes from the server over the real-time channel or is derived locally
//! when the officer enters or leaves an assigned zone. Every event carries
//! an [`AlertType`] used for the feed's filter buckets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display, EnumString};

/// Classification of an alert.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertType {
    /// High priority, needs acknowledgement.
    Emergency,
    /// Accepted or informational.
    Normal,
    /// Waiting for an officer to respond.
    Pending,
    /// Completed or resolved.
    Completed,
}

impl AlertType {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Emergency, Self::Normal, Self::Pending, Self::Completed]
    }

    /// Classifies a server alert payload.
    ///
    /// High priority (or an emergency/warning alert type) wins over
    /// status. Otherwise the status decides: `pending` is pending,
    /// `completed` and `resolved` are completed, anything else is normal.
    /// Comparisons ignore case.
    #[must_use]
    pub fn classify(payload: &Map<String, Value>) -> Self {
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_lowercase())
                .unwrap_or_default()
        };

        let emergency = field("priority") == "high"
            || field("alert_type") == "emergency"
            || matches!(
                field("original_alert_type").as_str(),
                "emergency" | "warning"
            );
        if emergency {
            return Self::Emergency;
        }

        match field("status").as_str() {
            "pending" => Self::Pending,
            "completed" | "resolved" => Self::Completed,
            _ => Self::Normal,
        }
    }
}

/// Where an alert came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertOrigin {
    /// Pushed by the server over the real-time channel.
    Server,
    /// Derived on this device from a zone transition.
    LocalGeofence,
}

/// A filter bucket of the alert feed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum AlertBucket {
    #[default]
    All,
    Emergency,
    Normal,
    Pending,
    Completed,
}

impl AlertBucket {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::All,
            Self::Emergency,
            Self::Normal,
            Self::Pending,
            Self::Completed,
        ]
    }

    /// Whether an alert of type `alert_type` belongs in this bucket.
    #[must_use]
    pub const fn includes(self, alert_type: AlertType) -> bool {
        matches!(
            (self, alert_type),
            (Self::All, _)
                | (Self::Emergency, AlertType::Emergency)
                | (Self::Normal, AlertType::Normal)
                | (Self::Pending, AlertType::Pending)
                | (Self::Completed, AlertType::Completed)
        )
    }
}

/// Direction of a zone boundary crossing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Transition {
    Enter,
    Exit,
}

/// Whether one officer is currently inside one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainmentState {
    pub officer_id: String,
    pub geofence_id: String,
    pub inside: bool,
    /// Set while `inside` is true.
    pub entered_at: Option<DateTime<Utc>>,
}

impl ContainmentState {
    /// The state before any position has been seen: outside.
    #[must_use]
    pub fn outside(officer_id: impl Into<String>, geofence_id: impl Into<String>) -> Self {
        Self {
            officer_id: officer_id.into(),
            geofence_id: geofence_id.into(),
            inside: false,
            entered_at: None,
        }
    }

    /// Applies a containment observation.
    ///
    /// Returns the transition when `inside` differs from the current
    /// state, so enter and exit strictly alternate.
    pub fn observe(&mut self, inside: bool, at: DateTime<Utc>) -> Option<Transition> {
        if inside == self.inside {
            return None;
        }
        self.inside = inside;
        if inside {
            self.entered_at = Some(at);
            Some(Transition::Enter)
        } else {
            self.entered_at = None;
            Some(Transition::Exit)
        }
    }
}

/// Error returned when a server payload cannot become an [`AlertEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAlertError {
    /// Why the payload was rejected.
    pub reason: &'static str,
}

impl std::fmt::Display for InvalidAlertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid alert payload: {}", self.reason)
    }
}

impl std::error::Error for InvalidAlertError {}

/// One entry of the alert feed. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub origin: AlertOrigin,
    /// Zone that produced a local event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_geofence_id: Option<String>,
}

impl AlertEvent {
    /// Builds a server-origin event from an inbound message payload.
    ///
    /// The id is `log_id` when present, else `id`; either may be a string
    /// or a number. The timestamp is `created_at` (or `timestamp`) when it
    /// parses as RFC 3339, else `received_at`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidAlertError`] if the payload is not an object or has
    /// no usable id.
    pub fn from_server(payload: Value, received_at: DateTime<Utc>) -> Result<Self, InvalidAlertError> {
        let Value::Object(fields) = &payload else {
            return Err(InvalidAlertError {
                reason: "payload is not an object",
            });
        };

        let id = ["log_id", "id"]
            .iter()
            .find_map(|key| match fields.get(*key) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or(InvalidAlertError {
                reason: "missing id",
            })?;

        let timestamp = ["created_at", "timestamp"]
            .iter()
            .filter_map(|key| fields.get(*key).and_then(Value::as_str))
            .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or(received_at, |t| t.with_timezone(&Utc));

        let alert_type = AlertType::classify(fields);

        Ok(Self {
            id,
            alert_type,
            payload,
            timestamp,
            origin: AlertOrigin::Server,
            source_geofence_id: None,
        })
    }

    /// Builds a local event for a zone boundary crossing.
    #[must_use]
    pub fn zone_transition(
        transition: Transition,
        geofence_id: &str,
        geofence_name: &str,
        latitude: f64,
        longitude: f64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type: AlertType::Normal,
            payload: json!({
                "transition": transition.as_ref(),
                "geofenceId": geofence_id,
                "geofenceName": geofence_name,
                "latitude": latitude,
                "longitude": longitude,
            }),
            timestamp: at,
            origin: AlertOrigin::LocalGeofence,
            source_geofence_id: Some(geofence_id.to_string()),
        }
    }
}

/// Number of retained events per bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertCounts {
    pub all: usize,
    pub emergency: usize,
    pub normal: usize,
    pub pending: usize,
    pub completed: usize,
}

impl AlertCounts {
    /// Tallies `events`.
    #[must_use]
    pub fn tally<'a>(events: impl IntoIterator<Item = &'a AlertEvent>) -> Self {
        events.into_iter().fold(Self::default(), |mut counts, event| {
            counts.all += 1;
            match event.alert_type {
                AlertType::Emergency => counts.emergency += 1,
                AlertType::Normal => counts.normal += 1,
                AlertType::Pending => counts.pending += 1,
                AlertType::Completed => counts.completed += 1,
            }
            counts
        })
    }

    #[must_use]
    pub const fn get(&self, bucket: AlertBucket) -> usize {
        match bucket {
            AlertBucket::All => self.all,
            AlertBucket::Emergency => self.emergency,
            AlertBucket::Normal => self.normal,
            AlertBucket::Pending => self.pending,
            AlertBucket::Completed => self.completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn object(value: &Value) -> &Map<String, Value> {
        value.as_object().unwrap()
    }

    #[test]
    fn high_priority_is_emergency_regardless_of_status() {
        let payload = json!({"id": 1, "priority": "HIGH", "status": "completed"});
        assert_eq!(AlertType::classify(object(&payload)), AlertType::Emergency);
    }

    #[test]
    fn emergency_alert_types_are_emergency() {
        for payload in [
            json!({"alert_type": "emergency"}),
            json!({"original_alert_type": "warning"}),
            json!({"original_alert_type": "Emergency"}),
        ] {
            assert_eq!(AlertType::classify(object(&payload)), AlertType::Emergency);
        }
    }

    #[test]
    fn status_decides_otherwise() {
        let cases = [
            ("pending", AlertType::Pending),
            ("Completed", AlertType::Completed),
            ("RESOLVED", AlertType::Completed),
            ("accepted", AlertType::Normal),
            ("something-else", AlertType::Normal),
        ];
        for (status, expected) in cases {
            let payload = json!({"status": status, "priority": "low"});
            assert_eq!(AlertType::classify(object(&payload)), expected, "{status}");
        }
        assert_eq!(AlertType::classify(&Map::new()), AlertType::Normal);
    }

    #[test]
    fn server_event_prefers_log_id_and_accepts_numbers() {
        let now = Utc::now();
        let event = AlertEvent::from_server(json!({"log_id": 77, "id": "x"}), now).unwrap();
        assert_eq!(event.id, "77");
        assert_eq!(event.origin, AlertOrigin::Server);
        assert_eq!(event.timestamp, now);

        let event = AlertEvent::from_server(json!({"id": "abc"}), now).unwrap();
        assert_eq!(event.id, "abc");
    }

    #[test]
    fn server_event_uses_created_at_when_valid() {
        let now = Utc::now();
        let event = AlertEvent::from_server(
            json!({"id": 1, "created_at": "2025-01-02T03:04:05Z"}),
            now,
        )
        .unwrap();
        assert_eq!(event.timestamp.to_rfc3339(), "2025-01-02T03:04:05+00:00");

        let event =
            AlertEvent::from_server(json!({"id": 1, "created_at": "yesterday"}), now).unwrap();
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn malformed_server_payloads_are_rejected() {
        let now = Utc::now();
        assert!(AlertEvent::from_server(json!("hello"), now).is_err());
        assert!(AlertEvent::from_server(json!([1, 2]), now).is_err());
        assert!(AlertEvent::from_server(json!({"status": "pending"}), now).is_err());
        assert!(AlertEvent::from_server(json!({"id": "  "}), now).is_err());
        assert!(AlertEvent::from_server(json!({"id": null}), now).is_err());
    }

    #[test]
    fn zone_transition_payload() {
        let at = Utc::now();
        let event = AlertEvent::zone_transition(
            Transition::Enter,
            "pune-pcmc",
            "Pune PCMC Area",
            18.52,
            73.85,
            at,
        );
        assert_eq!(event.origin, AlertOrigin::LocalGeofence);
        assert_eq!(event.source_geofence_id.as_deref(), Some("pune-pcmc"));
        assert_eq!(event.payload["transition"], "enter");
        assert_eq!(event.payload["geofenceName"], "Pune PCMC Area");
        assert!(uuid::Uuid::parse_str(&event.id).is_ok());
    }

    #[test]
    fn containment_transitions_alternate() {
        let mut state = ContainmentState::outside("officer-1", "zone-1");
        let t0 = Utc::now();

        assert_eq!(state.observe(false, t0), None);
        assert_eq!(state.observe(true, t0), Some(Transition::Enter));
        assert_eq!(state.entered_at, Some(t0));
        assert_eq!(state.observe(true, t0), None);
        assert_eq!(state.observe(false, t0), Some(Transition::Exit));
        assert_eq!(state.entered_at, None);
        assert_eq!(state.observe(false, t0), None);
    }

    #[test]
    fn buckets_and_counts_agree() {
        let now = Utc::now();
        let events: Vec<AlertEvent> = [
            json!({"id": 1, "priority": "high"}),
            json!({"id": 2, "status": "pending"}),
            json!({"id": 3, "status": "pending"}),
            json!({"id": 4, "status": "resolved"}),
            json!({"id": 5, "status": "accepted"}),
        ]
        .into_iter()
        .map(|p| AlertEvent::from_server(p, now).unwrap())
        .collect();

        let counts = AlertCounts::tally(&events);
        assert_eq!(counts.all, 5);
        for &bucket in AlertBucket::all() {
            let filtered = events.iter().filter(|e| bucket.includes(e.alert_type)).count();
            assert_eq!(counts.get(bucket), filtered, "{bucket}");
        }
    }

    #[test]
    fn bucket_parses_case_insensitively() {
        assert_eq!(AlertBucket::from_str("Emergency").unwrap(), AlertBucket::Emergency);
        assert_eq!(AlertBucket::from_str("all").unwrap(), AlertBucket::All);
        assert!(AlertBucket::from_str("urgent").is_err());
    }
}
