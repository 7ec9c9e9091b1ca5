#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Point-in-zone containment.
//!
//! [`contains`] decides whether a coordinate lies inside a single
//! [`GeofenceArea`]: a planar point-in-polygon test over `(longitude,
//! latitude)` when the zone has at least three distinct vertices, or a
//! haversine radius check around the zone center otherwise. Points on the
//! polygon boundary count as inside.
//!
//! [`ZoneIndex`] keeps many zones in an R-tree of bounding envelopes so a
//! position only runs the exact test against nearby candidates.
//!
//! Polygons that cross the antimeridian or enclose a pole are not
//! supported: they produce a wrong answer, never a panic.

use geo::coordinate_position::{CoordPos, CoordinatePosition};
use geo::{Coord, Distance, Haversine, LineString, Point, Polygon};
use patrol_geofence_models::{GeoPoint, GeofenceArea};
use rstar::{AABB, RTree, RTreeObject};

/// Meters per degree of latitude, used for radius envelopes.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Whether `point` lies inside `area`.
///
/// Non-finite coordinates are never inside anything.
#[must_use]
pub fn contains(point: &GeoPoint, area: &GeofenceArea) -> bool {
    if !is_finite(point) {
        log::warn!(
            "Non-finite position ({}, {}) tested against zone {}",
            point.latitude,
            point.longitude,
            area.id
        );
        return false;
    }

    if area.is_degenerate() {
        log::warn!(
            "Zone {} has {} distinct vertices, using {}m radius around center",
            area.id,
            area.distinct_vertex_count(),
            area.radius_m
        );
        return within_radius(point, area);
    }

    let coord = Coord {
        x: point.longitude,
        y: point.latitude,
    };
    matches!(
        to_polygon(area).coordinate_position(&coord),
        CoordPos::Inside | CoordPos::OnBoundary
    )
}

/// Haversine distance from the zone center is at most the zone radius.
fn within_radius(point: &GeoPoint, area: &GeofenceArea) -> bool {
    if !is_finite(&area.center) || !area.radius_m.is_finite() {
        return false;
    }
    let distance = Haversine.distance(to_point(&area.center), to_point(point));
    distance <= area.radius_m
}

fn to_point(p: &GeoPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

/// Builds a closed polygon ring with `x = longitude`, `y = latitude`.
fn to_polygon(area: &GeofenceArea) -> Polygon<f64> {
    let ring: Vec<(f64, f64)> = area
        .vertices
        .iter()
        .map(|v| (v.longitude, v.latitude))
        .collect();
    Polygon::new(LineString::from(ring), vec![])
}

const fn is_finite(p: &GeoPoint) -> bool {
    p.latitude.is_finite() && p.longitude.is_finite()
}

/// A zone stored in the R-tree with its precomputed envelope.
struct ZoneEntry {
    slot: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for ZoneEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-tree prefilter over a fixed set of zones.
///
/// Built once from the zones an officer is assigned to; rebuild it after
/// the registry is refreshed.
pub struct ZoneIndex {
    zones: Vec<GeofenceArea>,
    tree: RTree<ZoneEntry>,
}

impl ZoneIndex {
    /// Builds the index. Zones whose envelope cannot be computed (no
    /// finite vertices and no finite center) are kept out of the tree.
    #[must_use]
    pub fn new(zones: Vec<GeofenceArea>) -> Self {
        let entries = zones
            .iter()
            .enumerate()
            .filter_map(|(slot, zone)| {
                let envelope = zone_envelope(zone);
                if envelope.is_none() {
                    log::warn!("Zone {} has no usable geometry, not indexed", zone.id);
                }
                envelope.map(|envelope| ZoneEntry { slot, envelope })
            })
            .collect();

        let tree = RTree::bulk_load(entries);
        log::debug!("Indexed {} of {} zone(s)", tree.size(), zones.len());

        Self { zones, tree }
    }

    /// Every zone that contains `point`, in insertion order.
    #[must_use]
    pub fn zones_containing(&self, point: &GeoPoint) -> Vec<&GeofenceArea> {
        if !is_finite(point) {
            return Vec::new();
        }

        let query = AABB::from_point([point.longitude, point.latitude]);
        let mut slots: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|entry| entry.slot)
            .collect();
        slots.sort_unstable();

        slots
            .into_iter()
            .map(|slot| &self.zones[slot])
            .filter(|zone| contains(point, zone))
            .collect()
    }

    /// Looks up an indexed zone by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&GeofenceArea> {
        self.zones.iter().find(|zone| zone.id == id)
    }

    /// All zones, in insertion order.
    #[must_use]
    pub fn zones(&self) -> &[GeofenceArea] {
        &self.zones
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// Bounding envelope in `[lng, lat]` space.
///
/// Polygons use their vertex bounds; degenerate zones use the box around
/// the radius circle, widened in longitude by `1 / cos(lat)`.
fn zone_envelope(zone: &GeofenceArea) -> Option<AABB<[f64; 2]>> {
    if !zone.is_degenerate() {
        let mut finite = zone.vertices.iter().filter(|v| is_finite(v));
        let first = finite.next()?;
        let (mut min, mut max) = (
            [first.longitude, first.latitude],
            [first.longitude, first.latitude],
        );
        for v in finite {
            min = [min[0].min(v.longitude), min[1].min(v.latitude)];
            max = [max[0].max(v.longitude), max[1].max(v.latitude)];
        }
        return Some(AABB::from_corners(min, max));
    }

    if !is_finite(&zone.center) || !zone.radius_m.is_finite() {
        return None;
    }

    let radius = zone.radius_m.max(0.0);
    let dlat = radius / METERS_PER_DEGREE;
    let cos_lat = zone.center.latitude.to_radians().cos().abs().max(1e-6);
    let dlng = (radius / (METERS_PER_DEGREE * cos_lat)).min(180.0);
    let (lng, lat) = (zone.center.longitude, zone.center.latitude);

    Some(AABB::from_corners(
        [lng - dlng, lat - dlat],
        [lng + dlng, lat + dlat],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a zone from `(x, y)` pairs where `x` is longitude and `y` is
    /// latitude.
    fn zone_xy(id: &str, ring: &[(f64, f64)]) -> GeofenceArea {
        GeofenceArea {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            center: GeoPoint::new(0.0, 0.0),
            vertices: ring.iter().map(|&(x, y)| GeoPoint::new(y, x)).collect(),
            radius_m: 0.0,
            active_users_count: 0,
            area_size_km2: 0.0,
        }
    }

    fn at(x: f64, y: f64) -> GeoPoint {
        GeoPoint::new(y, x)
    }

    fn jay_ganesh_vision() -> GeofenceArea {
        GeofenceArea {
            id: "jay-ganesh-vision".to_string(),
            name: "jay ganesh vision".to_string(),
            description: String::new(),
            center: GeoPoint::new(18.647, 73.784),
            vertices: vec![
                GeoPoint::new(18.657, 73.774),
                GeoPoint::new(18.657, 73.794),
                GeoPoint::new(18.637, 73.794),
                GeoPoint::new(18.637, 73.774),
            ],
            radius_m: 1500.0,
            active_users_count: 0,
            area_size_km2: 2.25,
        }
    }

    /// A "U" opening upward: the notch between x=1..2, y=1..3 is outside.
    const U_SHAPE: &[(f64, f64)] = &[
        (0.0, 0.0),
        (3.0, 0.0),
        (3.0, 3.0),
        (2.0, 3.0),
        (2.0, 1.0),
        (1.0, 1.0),
        (1.0, 3.0),
        (0.0, 3.0),
    ];

    const U_INSIDE: &[(f64, f64)] = &[(0.5, 2.0), (2.5, 2.0), (1.5, 0.5), (0.2, 0.2)];
    const U_OUTSIDE: &[(f64, f64)] = &[(1.5, 2.0), (1.5, 2.9), (-0.5, 1.0), (3.5, 1.0), (1.5, 4.0)];

    #[test]
    fn worked_example() {
        let zone = jay_ganesh_vision();
        assert!(contains(&GeoPoint::new(18.647, 73.784), &zone));
        assert!(!contains(&GeoPoint::new(18.700, 73.784), &zone));
    }

    #[test]
    fn concave_polygon_notch_is_outside() {
        let zone = zone_xy("u", U_SHAPE);
        for &(x, y) in U_INSIDE {
            assert!(contains(&at(x, y), &zone), "({x}, {y}) should be inside");
        }
        for &(x, y) in U_OUTSIDE {
            assert!(!contains(&at(x, y), &zone), "({x}, {y}) should be outside");
        }
    }

    #[test]
    fn boundary_counts_as_inside() {
        let zone = zone_xy("square", &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        assert!(contains(&at(0.5, 0.0), &zone), "edge");
        assert!(contains(&at(1.0, 1.0), &zone), "vertex");
        assert!(contains(&at(0.0, 0.25), &zone), "closing edge");
    }

    #[test]
    fn explicitly_closed_ring_behaves_like_open_ring() {
        let open = zone_xy("open", &[(0.0, 0.0), (2.0, 0.0), (1.0, 2.0)]);
        let closed = zone_xy("closed", &[(0.0, 0.0), (2.0, 0.0), (1.0, 2.0), (0.0, 0.0)]);
        for p in [at(1.0, 0.5), at(1.9, 1.9), at(0.1, 1.0)] {
            assert_eq!(contains(&p, &open), contains(&p, &closed));
        }
    }

    #[test]
    fn translation_invariance() {
        for (dx, dy) in [(10.0, 20.0), (-45.5, 7.25), (120.0, -60.0)] {
            let shifted: Vec<(f64, f64)> = U_SHAPE.iter().map(|&(x, y)| (x + dx, y + dy)).collect();
            let zone = zone_xy("u", &shifted);
            for &(x, y) in U_INSIDE {
                assert!(contains(&at(x + dx, y + dy), &zone));
            }
            for &(x, y) in U_OUTSIDE {
                assert!(!contains(&at(x + dx, y + dy), &zone));
            }
        }
    }

    #[test]
    fn rotation_invariance() {
        let rotate = |(x, y): (f64, f64), degrees: f64| {
            let (sin, cos) = degrees.to_radians().sin_cos();
            let (cx, cy) = (1.5, 1.5);
            let (px, py) = (x - cx, y - cy);
            (cx + px * cos - py * sin, cy + px * sin + py * cos)
        };

        for degrees in [30.0, 90.0, 135.0, 200.0, 315.0] {
            let ring: Vec<(f64, f64)> = U_SHAPE.iter().map(|&p| rotate(p, degrees)).collect();
            let zone = zone_xy("u", &ring);
            for &p in U_INSIDE {
                let (x, y) = rotate(p, degrees);
                assert!(contains(&at(x, y), &zone), "{p:?} rotated {degrees}");
            }
            for &p in U_OUTSIDE {
                let (x, y) = rotate(p, degrees);
                assert!(!contains(&at(x, y), &zone), "{p:?} rotated {degrees}");
            }
        }
    }

    #[test]
    fn degenerate_zone_uses_radius() {
        let mut zone = jay_ganesh_vision();
        zone.vertices.truncate(2);
        zone.radius_m = 1000.0;

        // ~556 m north of center.
        assert!(contains(&GeoPoint::new(18.652, 73.784), &zone));
        // ~2.2 km north of center.
        assert!(!contains(&GeoPoint::new(18.667, 73.784), &zone));

        zone.vertices.clear();
        assert!(contains(&GeoPoint::new(18.647, 73.784), &zone));
    }

    #[test]
    fn closing_repeat_does_not_count_as_vertex() {
        let mut zone = zone_xy("line", &[(0.0, 0.0), (1.0, 0.0), (0.0, 0.0)]);
        zone.radius_m = 10.0;
        assert!(zone.is_degenerate());
        assert!(contains(&at(0.0, 0.0), &zone));
        assert!(!contains(&at(0.5, 0.0), &zone));
    }

    #[test]
    fn unsupported_geometry_does_not_panic() {
        let antimeridian = zone_xy(
            "dateline",
            &[(179.0, -1.0), (-179.0, -1.0), (-179.0, 1.0), (179.0, 1.0)],
        );
        let _ = contains(&at(180.0, 0.0), &antimeridian);

        let polar = zone_xy("pole", &[(0.0, 89.0), (120.0, 89.0), (240.0, 89.0)]);
        let _ = contains(&at(0.0, 90.0), &polar);

        assert!(!contains(&at(f64::NAN, 0.0), &antimeridian));
        let mut circle = jay_ganesh_vision();
        circle.vertices.clear();
        circle.radius_m = f64::INFINITY;
        assert!(!contains(&GeoPoint::new(18.647, 73.784), &circle));
    }

    #[test]
    fn index_matches_linear_scan() {
        let mut circle = jay_ganesh_vision();
        circle.id = "circle".to_string();
        circle.vertices.clear();

        let zones = vec![
            jay_ganesh_vision(),
            zone_xy("u", U_SHAPE),
            circle,
            zone_xy("far", &[(100.0, 10.0), (101.0, 10.0), (101.0, 11.0)]),
        ];
        let index = ZoneIndex::new(zones.clone());
        assert_eq!(index.len(), 4);

        let points = [
            GeoPoint::new(18.647, 73.784),
            GeoPoint::new(18.658, 73.784),
            GeoPoint::new(18.700, 73.784),
            at(0.5, 2.0),
            at(1.5, 2.0),
            at(100.9, 10.1),
        ];
        for point in &points {
            let expected: Vec<&str> = zones
                .iter()
                .filter(|z| contains(point, z))
                .map(|z| z.id.as_str())
                .collect();
            let actual: Vec<&str> = index
                .zones_containing(point)
                .into_iter()
                .map(|z| z.id.as_str())
                .collect();
            assert_eq!(actual, expected, "point {point:?}");
        }
    }

    #[test]
    fn index_lookup_by_id() {
        let index = ZoneIndex::new(vec![jay_ganesh_vision()]);
        assert!(index.get("jay-ganesh-vision").is_some());
        assert!(index.get("missing").is_none());
        assert!(!index.is_empty());
    }
}
