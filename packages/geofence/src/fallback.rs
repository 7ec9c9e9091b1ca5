//! Compile-time table of fallback zone definitions.
//!
//! Each entry is a `(name, toml_content)` pair embedded via `include_str!`.
//! These are used only when the backend has no matching zone, and are
//! tagged [`Provenance::Fallback`](patrol_geofence_models::Provenance) so
//! callers can tell they may be stale.

use patrol_geofence_models::GeofenceArea;

/// Number of embedded fallback zones. Enforced by a test.
#[cfg(test)]
const EXPECTED_ZONE_COUNT: usize = 2;

/// Embedded TOML zone definitions.
const ZONE_TOMLS: &[(&str, &str)] = &[
    (
        "jay_ganesh_vision",
        include_str!("../zones/jay_ganesh_vision.toml"),
    ),
    ("pune_pcmc", include_str!("../zones/pune_pcmc.toml")),
];

/// Returns all embedded fallback zones.
///
/// # Panics
///
/// Panics if any embedded TOML file fails to parse. These are
/// compile-time constants, so a parse failure is a development error
/// caught by the tests below.
#[must_use]
pub fn all_zones() -> Vec<GeofenceArea> {
    ZONE_TOMLS
        .iter()
        .map(|(name, toml_str)| {
            toml::de::from_str(toml_str)
                .unwrap_or_else(|e| panic!("Failed to parse fallback zone '{name}': {e}"))
        })
        .collect()
}
