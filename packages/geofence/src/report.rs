//! Officer position reports sent to the backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{GeofenceError, retry};

/// Path of the location update endpoint relative to the API base URL.
pub const LOCATION_PATH: &str = "/api/security/location/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One position report. Coordinates travel as decimal strings, which is
/// what the backend expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationReport {
    pub security_id: String,
    pub latitude: String,
    pub longitude: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_id: Option<String>,
}

impl LocationReport {
    #[must_use]
    pub fn new(
        security_id: impl Into<String>,
        geofence_id: Option<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            security_id: security_id.into(),
            latitude: latitude.to_string(),
            longitude: longitude.to_string(),
            geofence_id,
        }
    }
}

/// Somewhere to deliver position reports.
#[async_trait]
pub trait LocationSink: Send + Sync {
    /// Delivers one report.
    ///
    /// # Errors
    ///
    /// Returns [`GeofenceError`] if the backend rejects the report or
    /// cannot be reached.
    async fn report(&self, report: &LocationReport) -> Result<(), GeofenceError>;
}

/// Posts reports to the security backend.
pub struct HttpLocationSink {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpLocationSink {
    /// # Errors
    ///
    /// Returns [`GeofenceError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, bearer_token: Option<String>) -> Result<Self, GeofenceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: format!("{}{LOCATION_PATH}", base_url.trim_end_matches('/')),
            bearer_token,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LocationSink for HttpLocationSink {
    async fn report(&self, report: &LocationReport) -> Result<(), GeofenceError> {
        log::trace!(
            "Reporting ({}, {}) for {}",
            report.latitude,
            report.longitude,
            report.security_id
        );

        retry::send_ok(|| {
            let request = self.client.post(&self.url).json(report);
            match &self.bearer_token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_body_matches_backend_shape() {
        let report = LocationReport::new("officer-7", Some("pune-pcmc".to_string()), 18.647, 73.784);
        let body = serde_json::to_value(&report).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "security_id": "officer-7",
                "latitude": "18.647",
                "longitude": "73.784",
                "geofence_id": "pune-pcmc",
            })
        );
    }

    #[test]
    fn geofence_id_is_omitted_when_unknown() {
        let body = serde_json::to_value(LocationReport::new("officer-7", None, 1.0, 2.5)).unwrap();
        assert!(body.get("geofence_id").is_none());
        assert_eq!(body["latitude"], "1");
    }

    #[test]
    fn endpoint_is_joined_to_base() {
        let sink = HttpLocationSink::new("https://example.test/", None).unwrap();
        assert_eq!(sink.url(), "https://example.test/api/security/location/");
    }
}
