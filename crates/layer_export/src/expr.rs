//! Server-side collection expressions.
//!
//! Collections are never materialised locally after upload: merges, the
//! empty-geometry flag and the filter are described as a `CollectionExpr`
//! tree, serialised into the platform's value-graph encoding and evaluated
//! remotely when a task or a compute call references them.
//!
//! Encoding shape:
//!
//! ```text
//! { "result": "<key>",
//!   "values": { "<key>": { "functionInvocationValue": {
//!                 "functionName": "...", "arguments": { name: <node>, .. } } } } }
//! ```
//!
//! Nodes are nested inline; function bodies live in `values` and are
//! referenced by key.

use crate::asset::AssetId;
use geojson::{Feature, Geometry, Value as GeoValue};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Name of the variable bound by per-feature map functions.
const MAP_VAR: &str = "_MAPPING_VAR_0_0";

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionExpr {
    /// Features shipped with the request.
    Inline(Arc<Vec<Feature>>),
    /// A table asset already stored on the platform.
    Asset(AssetId),
    /// Concatenation, left features first.
    Merge(Box<CollectionExpr>, Box<CollectionExpr>),
    /// Sets `property` to 1 on features whose geometry has no coordinates
    /// and to 0 otherwise.
    FlagEmpty {
        source: Box<CollectionExpr>,
        property: String,
    },
    /// Keeps features whose `property` equals `value`.
    FilterEq {
        source: Box<CollectionExpr>,
        property: String,
        value: i64,
    },
}

impl CollectionExpr {
    pub fn inline(features: Vec<Feature>) -> Self {
        Self::Inline(Arc::new(features))
    }

    pub fn asset(id: AssetId) -> Self {
        Self::Asset(id)
    }

    pub fn merge(self, other: CollectionExpr) -> Self {
        Self::Merge(Box::new(self), Box::new(other))
    }

    pub fn flag_empty(self, property: impl Into<String>) -> Self {
        Self::FlagEmpty {
            source: Box::new(self),
            property: property.into(),
        }
    }

    pub fn filter_eq(self, property: impl Into<String>, value: i64) -> Self {
        Self::FilterEq {
            source: Box::new(self),
            property: property.into(),
            value,
        }
    }

    /// Number of `Merge` nodes in the tree.
    pub fn merge_count(&self) -> usize {
        match self {
            Self::Inline(_) | Self::Asset(_) => 0,
            Self::Merge(a, b) => 1 + a.merge_count() + b.merge_count(),
            Self::FlagEmpty { source, .. } | Self::FilterEq { source, .. } => source.merge_count(),
        }
    }

    /// Asset leaves in concatenation order.
    pub fn assets(&self) -> Vec<&AssetId> {
        let mut out = Vec::new();
        self.collect_assets(&mut out);
        out
    }

    fn collect_assets<'a>(&'a self, out: &mut Vec<&'a AssetId>) {
        match self {
            Self::Inline(_) => {}
            Self::Asset(id) => out.push(id),
            Self::Merge(a, b) => {
                a.collect_assets(out);
                b.collect_assets(out);
            }
            Self::FlagEmpty { source, .. } | Self::FilterEq { source, .. } => {
                source.collect_assets(out)
            }
        }
    }

    /// Full value graph for this collection.
    pub fn to_graph(&self) -> Value {
        let mut encoder = Encoder::default();
        let root = self.encode(&mut encoder);
        encoder.finish(root)
    }

    /// Value graph of `Collection.size(self)`.
    pub fn size_graph(&self) -> Value {
        let mut encoder = Encoder::default();
        let collection = self.encode(&mut encoder);
        let root = invoke("Collection.size", [("collection", collection)]);
        encoder.finish(root)
    }

    fn encode(&self, enc: &mut Encoder) -> Value {
        match self {
            Self::Inline(features) => invoke(
                "Collection",
                [(
                    "features",
                    array(features.iter().map(encode_feature).collect()),
                )],
            ),
            Self::Asset(id) => invoke("Collection.loadTable", [("tableId", constant(id.as_str()))]),
            Self::Merge(a, b) => invoke(
                "Collection.merge",
                [("collection1", a.encode(enc)), ("collection2", b.encode(enc))],
            ),
            Self::FlagEmpty { source, property } => {
                let feature = json!({ "argumentReference": MAP_VAR });
                let coordinates = invoke(
                    "Geometry.coordinates",
                    [(
                        "geometry",
                        invoke("Feature.geometry", [("feature", feature.clone())]),
                    )],
                );
                let is_empty = invoke(
                    "Number.eq",
                    [
                        ("left", invoke("List.size", [("list", coordinates)])),
                        ("right", constant(0)),
                    ],
                );
                let body = invoke(
                    "Element.set",
                    [
                        ("object", feature),
                        ("key", constant(property.as_str())),
                        ("value", is_empty),
                    ],
                );
                let body_ref = enc.push(body);
                invoke(
                    "Collection.map",
                    [
                        ("collection", source.encode(enc)),
                        (
                            "baseAlgorithm",
                            json!({ "functionDefinitionValue": {
                                "argumentNames": [MAP_VAR],
                                "body": body_ref,
                            }}),
                        ),
                    ],
                )
            }
            Self::FilterEq {
                source,
                property,
                value,
            } => invoke(
                "Collection.filter",
                [
                    ("collection", source.encode(enc)),
                    (
                        "filter",
                        invoke(
                            "Filter.equals",
                            [
                                ("leftField", constant(property.as_str())),
                                ("rightValue", constant(*value)),
                            ],
                        ),
                    ),
                ],
            ),
        }
    }
}

#[derive(Default)]
struct Encoder {
    values: Map<String, Value>,
}

impl Encoder {
    fn push(&mut self, node: Value) -> String {
        let key = self.values.len().to_string();
        self.values.insert(key.clone(), node);
        key
    }

    fn finish(mut self, root: Value) -> Value {
        let result = self.push(root);
        json!({ "result": result, "values": self.values })
    }
}

fn invoke<const N: usize>(name: &str, args: [(&str, Value); N]) -> Value {
    let arguments: Map<String, Value> = args
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
    json!({ "functionInvocationValue": { "functionName": name, "arguments": arguments } })
}

fn constant(v: impl Into<Value>) -> Value {
    json!({ "constantValue": v.into() })
}

fn array(values: Vec<Value>) -> Value {
    json!({ "arrayValue": { "values": values } })
}

fn encode_feature(feature: &Feature) -> Value {
    let geometry = match &feature.geometry {
        Some(g) => encode_geometry(g),
        None => json!({ "constantValue": null }),
    };
    let properties = feature
        .properties
        .clone()
        .map(Value::Object)
        .unwrap_or(Value::Null);
    invoke(
        "Feature",
        [("geometry", geometry), ("metadata", constant(properties))],
    )
}

fn encode_geometry(geometry: &Geometry) -> Value {
    let (name, coordinates) = match &geometry.value {
        GeoValue::Point(p) => ("Point", json!(p)),
        GeoValue::MultiPoint(ps) => ("MultiPoint", json!(ps)),
        GeoValue::LineString(ps) => ("LineString", json!(ps)),
        GeoValue::MultiLineString(ls) => ("MultiLineString", json!(ls)),
        GeoValue::Polygon(rings) => ("Polygon", json!(rings)),
        GeoValue::MultiPolygon(polys) => ("MultiPolygon", json!(polys)),
        GeoValue::GeometryCollection(geoms) => {
            return invoke(
                "GeometryConstructors.MultiGeometry",
                [(
                    "geometries",
                    array(geoms.iter().map(encode_geometry).collect()),
                )],
            );
        }
    };
    invoke(
        &format!("GeometryConstructors.{name}"),
        [("coordinates", constant(coordinates))],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> AssetId {
        AssetId::batch("projects/p", "roads", n)
    }

    fn root(graph: &Value) -> &Value {
        let key = graph["result"].as_str().unwrap();
        &graph["values"][key]
    }

    #[test]
    fn merge_tree_counts_and_order() {
        let expr = CollectionExpr::asset(id(1))
            .merge(CollectionExpr::asset(id(2)))
            .merge(CollectionExpr::asset(id(3)));
        assert_eq!(expr.merge_count(), 2);
        let leaves: Vec<String> = expr.assets().iter().map(|a| a.to_string()).collect();
        assert_eq!(
            leaves,
            vec![id(1).to_string(), id(2).to_string(), id(3).to_string()]
        );
    }

    #[test]
    fn asset_and_merge_encoding() {
        let graph = CollectionExpr::asset(id(1))
            .merge(CollectionExpr::asset(id(2)))
            .to_graph();
        let call = &root(&graph)["functionInvocationValue"];
        assert_eq!(call["functionName"], "Collection.merge");
        let left = &call["arguments"]["collection1"]["functionInvocationValue"];
        assert_eq!(left["functionName"], "Collection.loadTable");
        assert_eq!(
            left["arguments"]["tableId"]["constantValue"],
            "projects/p/assets/roads_batch_1"
        );
    }

    #[test]
    fn flag_and_filter_encoding_references_map_body() {
        let graph = CollectionExpr::asset(id(1))
            .flag_empty("empty_buffer")
            .filter_eq("empty_buffer", 0)
            .to_graph();

        let filter = &root(&graph)["functionInvocationValue"];
        assert_eq!(filter["functionName"], "Collection.filter");
        let eq = &filter["arguments"]["filter"]["functionInvocationValue"];
        assert_eq!(eq["functionName"], "Filter.equals");
        assert_eq!(eq["arguments"]["leftField"]["constantValue"], "empty_buffer");
        assert_eq!(eq["arguments"]["rightValue"]["constantValue"], 0);

        let map = &filter["arguments"]["collection"]["functionInvocationValue"];
        assert_eq!(map["functionName"], "Collection.map");
        let body_key = map["arguments"]["baseAlgorithm"]["functionDefinitionValue"]["body"]
            .as_str()
            .unwrap();
        let body = &graph["values"][body_key]["functionInvocationValue"];
        assert_eq!(body["functionName"], "Element.set");
        assert_eq!(body["arguments"]["key"]["constantValue"], "empty_buffer");
    }

    #[test]
    fn inline_features_encode_geometry_and_metadata() {
        let mut props = serde_json::Map::new();
        props.insert("feature_ty".into(), "PLANT".into());
        let feature = Feature {
            bbox: None,
            geometry: Some(Geometry::new(GeoValue::Polygon(vec![vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![0.0, 0.0],
            ]]))),
            id: None,
            properties: Some(props),
            foreign_members: None,
        };
        let graph = CollectionExpr::inline(vec![feature]).size_graph();

        let size = &root(&graph)["functionInvocationValue"];
        assert_eq!(size["functionName"], "Collection.size");
        let collection = &size["arguments"]["collection"]["functionInvocationValue"];
        let first = &collection["arguments"]["features"]["arrayValue"]["values"][0];
        let feature = &first["functionInvocationValue"];
        assert_eq!(feature["functionName"], "Feature");
        assert_eq!(
            feature["arguments"]["geometry"]["functionInvocationValue"]["functionName"],
            "GeometryConstructors.Polygon"
        );
        assert_eq!(
            feature["arguments"]["metadata"]["constantValue"]["feature_ty"],
            "PLANT"
        );
    }
}
