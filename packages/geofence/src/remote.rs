//! Authoritative geofence data from the backend.

use std::time::Duration;

use async_trait::async_trait;
use patrol_geofence_models::GeofenceArea;

use crate::{GeofenceError, parse, retry};

/// Path of the geofence listing relative to the API base URL.
pub const GEOFENCE_PATH: &str = "/api/security/geofence/";

/// Per-request timeout for backend lookups.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A source of authoritative zone definitions.
#[async_trait]
pub trait GeofenceSource: Send + Sync {
    /// Fetches every zone visible to the current officer.
    ///
    /// # Errors
    ///
    /// Returns [`GeofenceError`] if the backend cannot be reached or
    /// returns an unusable response.
    async fn fetch_all(&self) -> Result<Vec<GeofenceArea>, GeofenceError>;
}

/// Fetches zones over HTTP from the security backend.
pub struct HttpGeofenceSource {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpGeofenceSource {
    /// Creates a source for the backend at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`GeofenceError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, bearer_token: Option<String>) -> Result<Self, GeofenceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: format!("{}{GEOFENCE_PATH}", base_url.trim_end_matches('/')),
            bearer_token,
        })
    }

    /// The full listing URL this source queries.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl GeofenceSource for HttpGeofenceSource {
    async fn fetch_all(&self) -> Result<Vec<GeofenceArea>, GeofenceError> {
        log::debug!("Fetching geofences from {}", self.url);

        let body = retry::send_json(|| {
            let request = self.client.get(&self.url);
            match &self.bearer_token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .await?;

        let areas = parse::areas_from_response(&body);
        log::info!("Fetched {} geofence(s) from backend", areas.len());
        Ok(areas)
    }
}
