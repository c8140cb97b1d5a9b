//! Z-value stripping for polygon geometries.
//!
//! The remote vector ingestion only accepts 2D positions. `strip_z` rewrites
//! every ring of a `Polygon` / `MultiPolygon` with `[x, y]` positions and keeps
//! ring order, winding and hole structure untouched.

use geojson::{Feature, PolygonType, Position, Value};

/// Returns `true` for the geometry types `strip_z` rewrites.
#[inline]
pub fn is_supported(value: &Value) -> bool {
    matches!(value, Value::Polygon(_) | Value::MultiPolygon(_))
}

/// Returns `true` if any position of the geometry carries a third component.
pub fn has_z(value: &Value) -> bool {
    fn any_z(positions: &[Position]) -> bool {
        positions.iter().any(|p| p.len() > 2)
    }

    match value {
        Value::Point(p) => p.len() > 2,
        Value::MultiPoint(ps) | Value::LineString(ps) => any_z(ps),
        Value::MultiLineString(lines) => lines.iter().any(|l| any_z(l)),
        Value::Polygon(rings) => rings.iter().any(|r| any_z(r)),
        Value::MultiPolygon(polys) => polys.iter().flatten().any(|r| any_z(r)),
        Value::GeometryCollection(geoms) => geoms.iter().any(|g| has_z(&g.value)),
    }
}

/// Drops the z component from every ring of a polygon or multipolygon.
///
/// Geometries without z values are returned unchanged. Any other geometry
/// type passes through untouched; callers that care can check
/// [`is_supported`] first.
pub fn strip_z(value: Value) -> Value {
    if !has_z(&value) {
        return value;
    }

    match value {
        Value::Polygon(rings) => Value::Polygon(strip_polygon(rings)),
        Value::MultiPolygon(polys) => {
            Value::MultiPolygon(polys.into_iter().map(strip_polygon).collect())
        }
        other => {
            tracing::debug!(
                geometry_type = geometry_type(&other),
                "z values kept: geometry type is not stripped"
            );
            other
        }
    }
}

/// GeoJSON type name of a geometry value.
pub fn geometry_type(value: &Value) -> &'static str {
    match value {
        Value::Point(_) => "Point",
        Value::MultiPoint(_) => "MultiPoint",
        Value::LineString(_) => "LineString",
        Value::MultiLineString(_) => "MultiLineString",
        Value::Polygon(_) => "Polygon",
        Value::MultiPolygon(_) => "MultiPolygon",
        Value::GeometryCollection(_) => "GeometryCollection",
    }
}

/// Applies [`strip_z`] to a feature's geometry in place.
pub fn strip_z_feature(feature: &mut Feature) {
    if let Some(geometry) = feature.geometry.as_mut() {
        let value = std::mem::replace(&mut geometry.value, Value::GeometryCollection(Vec::new()));
        geometry.value = strip_z(value);
    }
}

/// Length of the geometry's top-level coordinate list.
///
/// Mirrors `geometry.coordinates().size()` on the remote side: the number of
/// rings for a polygon, parts for a multi-geometry, components for a point.
/// Zero marks a degenerate geometry.
pub fn coordinates_len(value: &Value) -> usize {
    match value {
        Value::Point(p) => p.len(),
        Value::MultiPoint(ps) | Value::LineString(ps) => ps.len(),
        Value::MultiLineString(lines) => lines.len(),
        Value::Polygon(rings) => rings.len(),
        Value::MultiPolygon(polys) => polys.len(),
        Value::GeometryCollection(geoms) => geoms.len(),
    }
}

#[inline]
fn strip_polygon(rings: PolygonType) -> PolygonType {
    rings
        .into_iter()
        .map(|ring| ring.into_iter().map(strip_position).collect())
        .collect()
}

#[inline]
fn strip_position(mut position: Position) -> Position {
    position.truncate(2);
    position
}
