//! Normalization of backend geofence records into [`GeofenceArea`].
//!
//! The backend is inconsistent about shapes: responses may be a bare list,
//! wrapped in `data`/`results`, or a single profile-style object carrying
//! `assigned_geofence`. `polygon_json` arrives as a `GeoJSON` `Polygon`, a
//! list of coordinate pairs in either axis order, or an object with a
//! `coordinates` list, and any of these may be JSON-encoded as a string.

use geojson::Geometry;
use patrol_geofence_models::{GeoPoint, GeofenceArea};
use serde_json::Value;

use crate::GeofenceError;

/// Absolute values above this cannot be a latitude, so the pair is taken
/// to be `[lng, lat]`.
const MAX_LATITUDE: f64 = 90.0;

/// Extracts every well-formed zone from a backend response body.
///
/// Records that fail to parse are dropped with a warning; the rest are
/// returned.
#[must_use]
pub fn areas_from_response(body: &Value) -> Vec<GeofenceArea> {
    let records: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => {
            if let Some(inner) = ["data", "results", "geofences"]
                .iter()
                .find_map(|k| map.get(*k).filter(|v| v.is_array() || v.is_object()))
            {
                return areas_from_response(inner);
            }
            vec![
                map.get("assigned_geofence")
                    .or_else(|| map.get("geofence"))
                    .unwrap_or(body),
            ]
        }
        _ => Vec::new(),
    };

    records
        .into_iter()
        .filter_map(|record| match parse_area(record) {
            Ok(area) => Some(area),
            Err(e) => {
                log::warn!("Dropping malformed geofence record: {e}");
                None
            }
        })
        .collect()
}

/// Parses a single backend geofence record.
///
/// # Errors
///
/// Returns [`GeofenceError::Parse`] if the record is not an object or has
/// no identifier.
pub fn parse_area(record: &Value) -> Result<GeofenceArea, GeofenceError> {
    let Value::Object(map) = record else {
        return Err(GeofenceError::Parse {
            message: format!("expected object, got {}", type_name(record)),
        });
    };

    let id = map
        .get("geofence_id")
        .or_else(|| map.get("id"))
        .and_then(id_string)
        .ok_or_else(|| GeofenceError::Parse {
            message: "record has no id or geofence_id".to_string(),
        })?;

    let name = map
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Unnamed Geofence")
        .to_string();

    let vertices = map
        .get("polygon_json")
        .or_else(|| map.get("coordinates"))
        .map(|v| match parse_polygon(v) {
            Ok(vertices) => vertices,
            Err(e) => {
                log::warn!("Geofence {id}: unreadable polygon ({e}), using radius only");
                Vec::new()
            }
        })
        .unwrap_or_default();

    let mut area = GeofenceArea {
        id,
        name,
        description: map
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        center: GeoPoint::new(0.0, 0.0),
        vertices,
        radius_m: map.get("radius").and_then(number).unwrap_or(0.0),
        active_users_count: map
            .get("active_users_count")
            .and_then(number)
            .map_or(0, |n| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let count = n.max(0.0) as u32;
                count
            }),
        area_size_km2: map.get("area_size").and_then(number).unwrap_or(0.0),
    };

    area.center = map
        .get("center_point")
        .or_else(|| map.get("center"))
        .and_then(|v| parse_point(&decode_string(v)))
        .filter(|p| p.latitude != 0.0 || p.longitude != 0.0)
        .or_else(|| area.vertex_centroid())
        .unwrap_or(area.center);

    if area.vertices.is_empty() {
        log::warn!("Geofence {} ({}) has no polygon vertices", area.id, area.name);
    }

    Ok(area)
}

/// Parses any supported `polygon_json` shape into an ordered ring.
///
/// # Errors
///
/// Returns [`GeofenceError::Parse`] if the value is none of the supported
/// shapes or contains unreadable coordinates.
pub fn parse_polygon(value: &Value) -> Result<Vec<GeoPoint>, GeofenceError> {
    let value = decode_string(value);

    match &value {
        Value::Object(map) if map.get("type").and_then(Value::as_str).is_some() => {
            parse_geojson_ring(&value)
        }
        Value::Object(map) => map.get("coordinates").map_or_else(
            || {
                Err(GeofenceError::Parse {
                    message: "polygon object has no coordinates".to_string(),
                })
            },
            parse_polygon,
        ),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                parse_point(item).ok_or_else(|| GeofenceError::Parse {
                    message: format!("unreadable coordinate: {item}"),
                })
            })
            .collect(),
        other => Err(GeofenceError::Parse {
            message: format!("unsupported polygon shape: {}", type_name(other)),
        }),
    }
}

/// Reads the outer ring of a `GeoJSON` `Polygon` (or the first polygon of
/// a `MultiPolygon`). `GeoJSON` positions are `[lng, lat]`.
fn parse_geojson_ring(value: &Value) -> Result<Vec<GeoPoint>, GeofenceError> {
    let geometry = Geometry::from_json_value(value.clone()).map_err(|e| GeofenceError::Parse {
        message: format!("invalid GeoJSON: {e}"),
    })?;

    let ring = match geometry.value {
        geojson::Value::Polygon(rings) => rings.into_iter().next(),
        geojson::Value::MultiPolygon(polygons) => polygons
            .into_iter()
            .next()
            .and_then(|rings| rings.into_iter().next()),
        _ => {
            return Err(GeofenceError::Parse {
                message: "expected Polygon or MultiPolygon geometry".to_string(),
            });
        }
    };

    Ok(ring
        .unwrap_or_default()
        .iter()
        .filter(|pos| pos.len() >= 2)
        .map(|pos| GeoPoint::new(pos[1], pos[0]))
        .collect())
}

/// Reads a point from `[a, b]` (axis order detected) or an object with
/// `latitude`/`lat` and `longitude`/`lng` keys.
fn parse_point(value: &Value) -> Option<GeoPoint> {
    match value {
        Value::Array(pair) if pair.len() >= 2 => {
            let a = number(&pair[0])?;
            let b = number(&pair[1])?;
            if a.abs() > MAX_LATITUDE {
                Some(GeoPoint::new(b, a))
            } else {
                Some(GeoPoint::new(a, b))
            }
        }
        Value::Object(map) => {
            let lat = map
                .get("latitude")
                .or_else(|| map.get("lat"))
                .and_then(number)?;
            let lng = map
                .get("longitude")
                .or_else(|| map.get("lng"))
                .or_else(|| map.get("lon"))
                .and_then(number)?;
            Some(GeoPoint::new(lat, lng))
        }
        _ => None,
    }
}

/// Unwraps a JSON document that was itself encoded as a string.
fn decode_string(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

/// Accepts numbers and numeric strings (the backend serializes decimals
/// as strings).
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
