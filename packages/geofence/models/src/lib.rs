#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Security zone (geofence) types.
//!
//! A [`GeofenceArea`] is a named region an officer is assigned to patrol.
//! Regions are either polygons (three or more ordered vertices) or, when
//! the polygon is degenerate, a circle around the center point.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A named security zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceArea {
    /// Stable zone identifier (e.g. `"pune-pcmc"`).
    pub id: String,
    /// Human-readable zone name, used for lookups.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Center of the zone, used for the radius fallback.
    pub center: GeoPoint,
    /// Ordered polygon vertices. The ring is implicitly closed; repeating
    /// the first vertex at the end is allowed but not required.
    #[serde(default)]
    pub vertices: Vec<GeoPoint>,
    /// Fallback radius in meters, used when the polygon is degenerate.
    #[serde(default)]
    pub radius_m: f64,
    /// Number of users currently reported inside the zone.
    #[serde(default)]
    pub active_users_count: u32,
    /// Zone area in square kilometers.
    #[serde(default)]
    pub area_size_km2: f64,
}

impl GeofenceArea {
    /// Whether containment must fall back to the radius check.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.distinct_vertex_count() < 3
    }

    /// Vertex count ignoring a closing vertex that repeats the first.
    #[must_use]
    pub fn distinct_vertex_count(&self) -> usize {
        match (self.vertices.first(), self.vertices.last()) {
            (Some(first), Some(last)) if self.vertices.len() > 1 && first == last => {
                self.vertices.len() - 1
            }
            _ => self.vertices.len(),
        }
    }

    /// Mean of the distinct vertices, or `None` for an empty ring.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn vertex_centroid(&self) -> Option<GeoPoint> {
        let n = self.distinct_vertex_count();
        if n == 0 {
            return None;
        }
        let (lat, lng) = self.vertices[..n]
            .iter()
            .fold((0.0, 0.0), |(lat, lng), p| (lat + p.latitude, lng + p.longitude));
        Some(GeoPoint::new(lat / n as f64, lng / n as f64))
    }
}

/// Where a resolved zone definition came from.
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
pub enum Provenance {
    /// Authoritative backend data.
    Remote,
    /// Static table compiled into the client. May be stale.
    Fallback,
}

/// How a lookup name matched a zone.
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
pub enum MatchKind {
    /// Byte-for-byte name match.
    Exact,
    /// Match after trimming and lowercasing.
    CaseInsensitive,
    /// One name contains the other.
    Substring,
}

/// A zone returned by a registry lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedGeofence {
    /// The zone definition.
    pub area: GeofenceArea,
    /// Which table produced it.
    pub provenance: Provenance,
    /// Which stage of the lookup pipeline matched.
    pub matched_by: MatchKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(closed: bool) -> GeofenceArea {
        let mut vertices = vec![
            GeoPoint::new(18.657, 73.774),
            GeoPoint::new(18.657, 73.794),
            GeoPoint::new(18.637, 73.794),
            GeoPoint::new(18.637, 73.774),
        ];
        if closed {
            vertices.push(vertices[0]);
        }
        GeofenceArea {
            id: "jay-ganesh-vision".to_string(),
            name: "jay ganesh vision".to_string(),
            description: String::new(),
            center: GeoPoint::new(18.647, 73.784),
            vertices,
            radius_m: 1500.0,
            active_users_count: 0,
            area_size_km2: 2.25,
        }
    }

    #[test]
    fn closing_vertex_is_not_counted() {
        assert_eq!(square(false).distinct_vertex_count(), 4);
        assert_eq!(square(true).distinct_vertex_count(), 4);
    }

    #[test]
    fn two_vertices_are_degenerate() {
        let mut area = square(false);
        area.vertices.truncate(2);
        assert!(area.is_degenerate());

        // A "triangle" whose third vertex closes the ring is still a line.
        area.vertices.push(area.vertices[0]);
        assert!(area.is_degenerate());
    }

    #[test]
    fn centroid_of_square_is_its_center() {
        let c = square(true).vertex_centroid().unwrap();
        assert!((c.latitude - 18.647).abs() < 1e-9);
        assert!((c.longitude - 73.784).abs() < 1e-9);
    }

    #[test]
    fn provenance_round_trips_through_strings() {
        assert_eq!(Provenance::Fallback.to_string(), "fallback");
        assert_eq!("remote".parse::<Provenance>().unwrap(), Provenance::Remote);
    }

    #[test]
    fn area_deserializes_from_toml_with_defaults() {
        let area: GeofenceArea = toml::from_str(
            r#"
            id = "z"
            name = "Zone"
            center = { latitude = 1.0, longitude = 2.0 }
            "#,
        )
        .unwrap();
        assert!(area.vertices.is_empty());
        assert!(area.is_degenerate());
        assert_eq!(area.active_users_count, 0);
    }
}
