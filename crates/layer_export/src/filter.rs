//! Emptiness Filter: drops features whose geometry has no coordinates.
//!
//! Degenerate geometries make the platform's export step fail, so the merged
//! collection is tagged and filtered server-side before the final export.

use crate::expr::CollectionExpr;

/// Property set to 1 on empty geometries and 0 otherwise.
pub const EMPTY_FLAG_PROPERTY: &str = "empty_buffer";

/// Tags every feature with [`EMPTY_FLAG_PROPERTY`] and keeps those tagged 0.
pub fn drop_empty_geometries(collection: CollectionExpr) -> CollectionExpr {
    collection
        .flag_empty(EMPTY_FLAG_PROPERTY)
        .filter_eq(EMPTY_FLAG_PROPERTY, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetId;
    use crate::platform::InMemoryPlatform;
    use geojson::{Feature, Geometry, Value};

    fn feature(value: Option<Value>) -> Feature {
        Feature {
            bbox: None,
            geometry: value.map(Geometry::new),
            id: None,
            properties: None,
            foreign_members: None,
        }
    }

    #[test]
    fn wraps_flag_then_filter() {
        let source = CollectionExpr::asset(AssetId::new("projects/p/assets/m"));
        let expr = drop_empty_geometries(source.clone());
        let CollectionExpr::FilterEq { source: flagged, property, value } = expr else {
            panic!("expected a filter");
        };
        assert_eq!(property, EMPTY_FLAG_PROPERTY);
        assert_eq!(value, 0);
        assert_eq!(*flagged, source.flag_empty(EMPTY_FLAG_PROPERTY));
    }

    #[test]
    fn removes_only_degenerate_features() {
        let platform = InMemoryPlatform::new("projects/p");
        let line = Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
        let features = vec![
            feature(Some(line.clone())),
            feature(Some(Value::Polygon(vec![]))),
            feature(Some(Value::MultiPolygon(vec![]))),
            feature(Some(Value::LineString(vec![]))),
            feature(Some(line)),
        ];

        let kept = platform
            .evaluate(&drop_empty_geometries(CollectionExpr::inline(features)))
            .unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept
            .iter()
            .all(|f| f.property(EMPTY_FLAG_PROPERTY).and_then(|v| v.as_i64()) == Some(0)));
    }
}
