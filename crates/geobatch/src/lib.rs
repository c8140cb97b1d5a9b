//! geobatch: the local half of a layer export.
//!
//! - Loads a named vector layer from a GeoJSON `FeatureCollection` file.
//! - Normalises attribute names, filters rows on an attribute value and
//!   keeps a configured subset of columns.
//! - Drops rows whose geometry is `null`.
//! - Optionally strips z values from polygon geometries.
//! - Reprojects from the layer CRS to EPSG:4326 (identity or Web Mercator).
//! - Partitions the rows into fixed-size, 1-based batches.
//!
//! Everything here is synchronous and side-effect free apart from reading the
//! source file.

pub mod batch;
pub mod crs;
pub mod layer;
pub mod sanitize;

pub use batch::{batch_count, partition, Batch};
pub use crs::Crs;
pub use layer::{clean_name, AttributeFilter, Layer, LayerOptions, LoadStats};

use thiserror::Error;

/// Errors raised while loading or batching a layer.
#[derive(Debug, Error)]
pub enum GeoBatchError {
    #[error("failed to read layer source '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("layer source is not a FeatureCollection (found {0})")]
    NotAFeatureCollection(&'static str),

    #[error("unsupported coordinate reference system '{0}'")]
    UnsupportedCrs(String),

    #[error("batch size must be greater than zero")]
    ZeroBatchSize,
}

pub type Result<T> = std::result::Result<T, GeoBatchError>;
