//! layer_export: the remote half of a layer export.
//!
//! Batches of a [`geobatch::Layer`] are exported as table assets, merged
//! server-side, stripped of degenerate geometries, exported once more as
//! `<layer>_merged`, and the intermediate assets are deleted.

pub mod asset;
pub mod cleanup;
pub mod config;
pub mod expr;
pub mod filter;
pub mod merger;
pub mod metrics;
pub mod pipeline;
pub mod platform;
pub mod uploader;
pub mod waiter;

pub use asset::AssetId;
pub use config::{Config, LayerSpec, LogFormat, RunSettings};
pub use expr::CollectionExpr;
pub use metrics::Metrics;
pub use pipeline::{LayerExporter, LayerReport};
pub use platform::{InMemoryPlatform, Platform, RestPlatform};
