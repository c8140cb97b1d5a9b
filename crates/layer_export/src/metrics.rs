use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::path::Path;

/// A container for all Prometheus metric collectors of an export run.
///
/// Shared behind an `Arc`. The run is one-shot, so instead of serving a
/// `/metrics` endpoint the text exposition is rendered once at exit.
pub struct Metrics {
    pub registry: Registry,
    /// Rows read from layer sources (before dropping missing geometries).
    pub features_read_total: IntCounter,
    /// Rows dropped because their geometry was null.
    pub features_dropped_total: IntCounter,
    /// Batch export tasks submitted.
    pub batches_submitted_total: IntCounter,
    /// Batches skipped because their asset already existed.
    pub batches_skipped_total: IntCounter,
    /// Tasks that ended in FAILED.
    pub tasks_failed_total: IntCounter,
    /// Task status requests issued.
    pub task_polls_total: IntCounter,
    /// Batch assets deleted after a merged export.
    pub assets_deleted_total: IntCounter,
    /// Batch asset deletions that failed.
    pub asset_deletions_failed_total: IntCounter,
    /// Layers whose merged asset was exported.
    pub layers_completed_total: IntCounter,
}

impl Metrics {
    /// Creates a new `Metrics` struct, initializing and registering all collectors.
    pub fn new() -> Self {
        // Create a custom registry to avoid conflicts with default metrics.
        let registry = Registry::new_custom(Some("layer_export".into()), None)
            .expect("Failed to create custom metrics registry");

        // A helper macro to create, register, and return a metric collector.
        macro_rules! reg {
            ($name:expr, $help:expr) => {{
                let collector = IntCounter::new($name, $help).expect("Invalid metric definition");
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            features_read_total: reg!("features_read_total", "Rows read from layer sources"),
            features_dropped_total: reg!(
                "features_dropped_total",
                "Rows dropped because their geometry was missing"
            ),
            batches_submitted_total: reg!(
                "batches_submitted_total",
                "Batch export tasks submitted"
            ),
            batches_skipped_total: reg!(
                "batches_skipped_total",
                "Batches skipped because the asset already existed"
            ),
            tasks_failed_total: reg!("tasks_failed_total", "Tasks that ended in FAILED"),
            task_polls_total: reg!("task_polls_total", "Task status requests issued"),
            assets_deleted_total: reg!("assets_deleted_total", "Batch assets deleted"),
            asset_deletions_failed_total: reg!(
                "asset_deletions_failed_total",
                "Batch asset deletions that failed"
            ),
            layers_completed_total: reg!(
                "layers_completed_total",
                "Layers whose merged asset was exported"
            ),
            registry,
        }
    }

    /// Renders all collectors in the Prometheus text format.
    pub fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Writes the rendered metrics to `path`.
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.render()?)?;
        Ok(())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_prefixed_counters() {
        let metrics = Metrics::new();
        metrics.batches_submitted_total.inc_by(3);
        let text = metrics.render().unwrap();
        assert!(text.contains("layer_export_batches_submitted_total 3"));
        assert!(text.contains("layer_export_assets_deleted_total 0"));
    }

    #[test]
    fn write_to_file() {
        let metrics = Metrics::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        metrics.write_to(&path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("layer_export_"));
    }
}
