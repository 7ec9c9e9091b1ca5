#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Named security zone lookup.
//!
//! [`GeofenceRegistry`] resolves a zone name to its definition by running
//! an ordered pipeline (exact, case-insensitive, substring) first over the
//! zones fetched from the backend, then over the static [`fallback`] table.
//! Every result is tagged with its [`Provenance`].
//!
//! The remote cache is filled by [`GeofenceRegistry::initialize`] and only
//! replaced by an explicit [`GeofenceRegistry::refresh`]. Nothing expires on
//! a timer.

pub mod fallback;
pub mod parse;
pub mod remote;
pub mod report;
pub mod retry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use patrol_geofence_models::{GeofenceArea, MatchKind, Provenance, ResolvedGeofence};
use thiserror::Error;

pub use remote::{GeofenceSource, HttpGeofenceSource};
pub use report::{HttpLocationSink, LocationReport, LocationSink};

/// Errors that can occur while loading zone definitions.
#[derive(Debug, Error)]
pub enum GeofenceError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status.
    #[error("Backend returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record could not be turned into a zone.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of what went wrong.
        message: String,
    },

    /// No zone matched the requested name in either table.
    #[error("No geofence named '{name}'")]
    NotFound {
        /// The name that was looked up.
        name: String,
    },
}

/// Zone lookup with remote-first resolution and a static fallback.
pub struct GeofenceRegistry {
    source: Option<Arc<dyn GeofenceSource>>,
    remote: Vec<GeofenceArea>,
    fallback: Vec<GeofenceArea>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl GeofenceRegistry {
    /// Creates a registry backed by `source` and the embedded fallback
    /// table. Call [`Self::initialize`] before resolving.
    #[must_use]
    pub fn new(source: Option<Arc<dyn GeofenceSource>>) -> Self {
        Self::with_fallback(source, fallback::all_zones())
    }

    /// Creates a registry with an explicit fallback table.
    #[must_use]
    pub const fn with_fallback(
        source: Option<Arc<dyn GeofenceSource>>,
        fallback: Vec<GeofenceArea>,
    ) -> Self {
        Self {
            source,
            remote: Vec::new(),
            fallback,
            refreshed_at: None,
        }
    }

    /// Loads the remote cache at startup.
    ///
    /// Failure is not fatal: it is logged and lookups are served from the
    /// fallback table until a later [`Self::refresh`] succeeds. Returns the
    /// number of remote zones loaded.
    pub async fn initialize(&mut self) -> usize {
        match self.refresh().await {
            Ok(count) => count,
            Err(e) => {
                log::warn!(
                    "Geofence backend unavailable ({e}); serving {} fallback zone(s)",
                    self.fallback.len()
                );
                0
            }
        }
    }

    /// Replaces the remote cache with a fresh fetch.
    ///
    /// On error the previous cache is kept untouched.
    ///
    /// # Errors
    ///
    /// Returns [`GeofenceError`] if the source fails.
    pub async fn refresh(&mut self) -> Result<usize, GeofenceError> {
        let Some(source) = &self.source else {
            log::debug!("No geofence source configured, fallback table only");
            return Ok(0);
        };

        let areas = source.fetch_all().await?;
        log::info!("Geofence cache refreshed with {} zone(s)", areas.len());
        self.remote = areas;
        self.refreshed_at = Some(Utc::now());
        Ok(self.remote.len())
    }

    /// Resolves a zone by name.
    ///
    /// Remote zones are searched first, then the fallback table; within each
    /// table the first stage that matches anything wins.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ResolvedGeofence> {
        [
            (Provenance::Remote, &self.remote),
            (Provenance::Fallback, &self.fallback),
        ]
        .into_iter()
        .find_map(|(provenance, table)| {
            find_by_name(table, name).map(|(area, matched_by)| ResolvedGeofence {
                area: area.clone(),
                provenance,
                matched_by,
            })
        })
        .inspect(|resolved| {
            if resolved.provenance == Provenance::Fallback {
                log::debug!(
                    "Zone '{name}' resolved from fallback table as '{}'",
                    resolved.area.name
                );
            }
        })
    }

    /// Like [`Self::resolve`], but a miss is an error.
    ///
    /// # Errors
    ///
    /// Returns [`GeofenceError::NotFound`] if no zone matches.
    pub fn require(&self, name: &str) -> Result<ResolvedGeofence, GeofenceError> {
        self.resolve(name).ok_or_else(|| GeofenceError::NotFound {
            name: name.to_string(),
        })
    }

    /// Number of cached remote zones.
    #[must_use]
    pub const fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// When the remote cache was last replaced, if ever.
    #[must_use]
    pub const fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}

/// Runs the lookup pipeline over one table.
///
/// Stages, in order: exact name, trimmed case-insensitive name, substring
/// in either direction (case-insensitive). Blank names match nothing.
#[must_use]
pub fn find_by_name<'a>(
    table: &'a [GeofenceArea],
    name: &str,
) -> Option<(&'a GeofenceArea, MatchKind)> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    if let Some(area) = table.iter().find(|a| a.name == name) {
        return Some((area, MatchKind::Exact));
    }

    if let Some(area) = table.iter().find(|a| a.name.trim().to_lowercase() == needle) {
        return Some((area, MatchKind::CaseInsensitive));
    }

    table
        .iter()
        .find(|a| {
            let key = a.name.trim().to_lowercase();
            !key.is_empty() && (key.contains(&needle) || needle.contains(&key))
        })
        .map(|area| (area, MatchKind::Substring))
}
