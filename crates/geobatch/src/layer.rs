//! Layer loading: GeoJSON source -> cleaned, filtered feature list.

use crate::crs::Crs;
use crate::sanitize::strip_z_feature;
use crate::{GeoBatchError, Result};
use geojson::{Feature, GeoJson, JsonObject, JsonValue};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// How a layer source is turned into rows.
#[derive(Debug, Clone, Default)]
pub struct LayerOptions {
    /// Attribute columns to keep, matched after name cleaning. Empty keeps all.
    pub columns: Vec<String>,
    /// Strip z values from polygon geometries while loading.
    pub strip_z: bool,
    /// Overrides the CRS declared by the source.
    pub crs: Option<Crs>,
    /// Keeps only rows whose attribute equals a value.
    pub filter: Option<AttributeFilter>,
}

/// `column == value` row filter, matched against cleaned attribute names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeFilter {
    pub column: String,
    pub value: String,
}

impl AttributeFilter {
    pub fn new(column: &str, value: impl Into<String>) -> Self {
        Self {
            column: clean_name(column),
            value: value.into(),
        }
    }

    /// Strings compare as-is; numbers and booleans by their JSON text.
    pub fn matches(&self, props: &JsonObject) -> bool {
        match props.get(&self.column) {
            Some(JsonValue::String(s)) => *s == self.value,
            Some(v @ (JsonValue::Number(_) | JsonValue::Bool(_))) => v.to_string() == self.value,
            _ => false,
        }
    }
}

/// Counters collected while loading a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows_read: usize,
    pub dropped_missing_geometry: usize,
    /// Rows rejected by the attribute filter.
    pub dropped_by_filter: usize,
    /// Requested columns that no row carried.
    pub missing_columns: Vec<String>,
}

/// A named feature collection, read once and not modified afterwards.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub crs: Crs,
    pub features: Vec<Feature>,
    pub stats: LoadStats,
}

impl Layer {
    /// Reads and parses a GeoJSON `FeatureCollection` file.
    pub fn read<P: AsRef<Path>>(name: &str, path: P, options: &LayerOptions) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| GeoBatchError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(name, &text, options)
    }

    /// Parses GeoJSON text into a layer.
    pub fn parse(name: &str, text: &str, options: &LayerOptions) -> Result<Self> {
        let collection = match text.parse::<GeoJson>()? {
            GeoJson::FeatureCollection(fc) => fc,
            GeoJson::Feature(_) => return Err(GeoBatchError::NotAFeatureCollection("Feature")),
            GeoJson::Geometry(_) => return Err(GeoBatchError::NotAFeatureCollection("Geometry")),
        };

        let crs = match options.crs {
            Some(crs) => crs,
            None => declared_crs(collection.foreign_members.as_ref())?,
        };

        let wanted: Vec<String> = options.columns.iter().map(|c| clean_name(c)).collect();
        let mut seen = BTreeSet::new();
        let mut stats = LoadStats {
            rows_read: collection.features.len(),
            ..Default::default()
        };

        let mut features = Vec::with_capacity(collection.features.len());
        for mut feature in collection.features {
            if feature.geometry.is_none() {
                stats.dropped_missing_geometry += 1;
                continue;
            }

            let props = feature
                .properties
                .take()
                .map(|props| clean_properties(name, props))
                .unwrap_or_default();
            if let Some(filter) = &options.filter {
                if !filter.matches(&props) {
                    stats.dropped_by_filter += 1;
                    continue;
                }
            }

            let props = select_columns(props, &wanted);
            seen.extend(props.keys().cloned());
            feature.properties = Some(props);

            if options.strip_z {
                strip_z_feature(&mut feature);
            }
            features.push(feature);
        }

        stats.missing_columns = wanted.into_iter().filter(|c| !seen.contains(c)).collect();
        if !stats.missing_columns.is_empty() {
            tracing::warn!(
                layer = name,
                columns = ?stats.missing_columns,
                "Requested columns not present in any row"
            );
        }

        Ok(Self {
            name: name.to_owned(),
            crs,
            features,
            stats,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Normalises an attribute name the way pyjanitor's `clean_names` does:
/// lowercase, separators and punctuation (` /:,?().-`) become `_`,
/// apostrophes are dropped, and runs of `_` collapse to one. Leading and
/// trailing underscores are kept.
///
/// `"Feature Ty"` -> `"feature_ty"`, `"SRC-Agency "` -> `"src_agency_"`.
pub fn clean_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let ch = match ch {
            ' ' | '/' | ':' | ',' | '?' | '(' | ')' | '.' | '-' | '\u{a0}' => '_',
            '\'' | '\u{2019}' => continue,
            c => c,
        };
        if ch == '_' {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// Cleans every attribute name. When two names clean to the same key only
/// the first in map order is kept and the collision is logged.
fn clean_properties(layer: &str, props: JsonObject) -> JsonObject {
    let mut cleaned = JsonObject::with_capacity(props.len());
    for (key, value) in props {
        let clean = clean_name(&key);
        if cleaned.contains_key(&clean) {
            tracing::warn!(layer, column = %key, cleaned = %clean, "Column name collides after cleaning; keeping the first");
            continue;
        }
        cleaned.insert(clean, value);
    }
    cleaned
}

fn select_columns(props: JsonObject, wanted: &[String]) -> JsonObject {
    props
        .into_iter()
        .filter(|(k, _)| wanted.is_empty() || wanted.contains(k))
        .collect()
}

/// Reads the legacy `crs` member; no member means RFC 7946 lon/lat.
fn declared_crs(foreign: Option<&JsonObject>) -> Result<Crs> {
    let name = foreign
        .and_then(|m| m.get("crs"))
        .and_then(|crs| crs.get("properties"))
        .and_then(|props| props.get("name"))
        .and_then(|name| name.as_str());

    match name {
        Some(name) => Crs::from_name(name),
        None => Ok(Crs::Wgs84),
    }
}
