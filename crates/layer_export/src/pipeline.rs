//! The per-layer export sequence and the run over all configured layers.
//!
//! upload batches -> wait -> merge -> drop empty geometries -> export merged
//! -> wait -> delete batch assets

use crate::asset::{merged_description, AssetId};
use crate::cleanup::{delete_assets, CleanupReport};
use crate::config::{LayerSpec, RunSettings};
use crate::filter::drop_empty_geometries;
use crate::merger::merge_collections;
use crate::metrics::Metrics;
use crate::platform::{AssetProbe, Platform};
use crate::uploader::{upload_batches, UploadOptions};
use crate::waiter::{wait_for_tasks, WaitOptions};
use anyhow::Context;
use geobatch::{batch_count, AttributeFilter, Layer, LayerOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What happened to one layer.
#[derive(Debug, Clone)]
pub struct LayerReport {
    pub layer: String,
    pub rows: usize,
    pub batches: usize,
    pub submitted: usize,
    pub skipped: usize,
    /// Feature count of the merged collection before the emptiness filter.
    /// `None` when the merged export was not run.
    pub merged_feature_count: Option<u64>,
    /// `None` when the layer had no rows.
    pub merged_asset_id: Option<AssetId>,
    /// `None` when cleanup was skipped.
    pub cleanup: Option<CleanupReport>,
}

/// Runs the export sequence for each layer, one at a time.
pub struct LayerExporter<P> {
    platform: P,
    settings: RunSettings,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl<P: Platform> LayerExporter<P> {
    pub fn new(
        platform: P,
        settings: RunSettings,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            platform,
            settings,
            metrics,
            cancel,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            poll_interval: self.settings.poll_interval,
            max_wait: self.settings.max_wait,
            accept_cancelled: self.settings.accept_cancelled,
        }
    }

    /// Per-layer options, falling back to the global flags.
    fn layer_options(&self, spec: &LayerSpec) -> LayerOptions {
        LayerOptions {
            columns: spec
                .columns
                .clone()
                .unwrap_or_else(|| self.settings.columns.clone()),
            strip_z: spec.strip_z.unwrap_or(self.settings.strip_z),
            crs: None,
            filter: spec
                .filter
                .as_ref()
                .map(|f| AttributeFilter::new(&f.column, f.value.clone())),
        }
    }

    /// Processes every configured layer in order. The first error stops the
    /// run; later layers are not attempted.
    pub async fn run(&self) -> anyhow::Result<Vec<LayerReport>> {
        let mut reports = Vec::with_capacity(self.settings.layers.len());
        for spec in &self.settings.layers {
            let layer = self.load(spec).await?;
            let report = self
                .process_layer(&layer)
                .await
                .with_context(|| format!("Failed to process layer '{}'", spec.name))?;
            reports.push(report);
        }
        tracing::info!(layers = reports.len(), "All layers have been processed successfully");
        Ok(reports)
    }

    /// Reads a layer source from disk.
    pub async fn load(&self, spec: &LayerSpec) -> anyhow::Result<Layer> {
        let text = tokio::fs::read_to_string(&spec.path)
            .await
            .with_context(|| format!("Failed to read layer source '{}'", spec.path.display()))?;
        let layer = Layer::parse(&spec.name, &text, &self.layer_options(spec))
            .with_context(|| format!("Failed to parse layer '{}'", spec.name))?;

        self.metrics
            .features_read_total
            .inc_by(layer.stats.rows_read as u64);
        self.metrics
            .features_dropped_total
            .inc_by(layer.stats.dropped_missing_geometry as u64);
        Ok(layer)
    }

    /// Checks whether `id` exists; lookup errors count as missing when configured to.
    async fn exists(&self, id: &AssetId) -> anyhow::Result<bool> {
        match self.platform.probe_asset(id).await {
            Ok(probe) => Ok(probe == AssetProbe::Exists),
            Err(e) if self.settings.probe_errors_as_missing => {
                tracing::warn!(asset_id = %id, error = %e, "Existence check failed; exporting anyway");
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Existence check for {} failed", id)),
        }
    }

    /// Runs the whole export sequence for one loaded layer.
    ///
    /// A layer whose merged asset already exists is not uploaded again; only
    /// its leftover batch assets are cleaned up.
    pub async fn process_layer(&self, layer: &Layer) -> anyhow::Result<LayerReport> {
        let name = layer.name.as_str();
        let project = self.settings.project.as_str();
        tracing::info!(
            layer = name,
            rows = layer.len(),
            dropped_missing_geometry = layer.stats.dropped_missing_geometry,
            dropped_by_filter = layer.stats.dropped_by_filter,
            crs = %layer.crs,
            "Processing layer"
        );

        let mut report = LayerReport {
            layer: name.to_owned(),
            rows: layer.len(),
            batches: batch_count(layer.len(), self.settings.batch_size),
            submitted: 0,
            skipped: 0,
            merged_feature_count: None,
            merged_asset_id: None,
            cleanup: None,
        };

        if layer.is_empty() {
            tracing::warn!(layer = name, "Layer has no rows; nothing to export");
            return Ok(report);
        }

        let merged_id = AssetId::merged(project, name);
        report.merged_asset_id = Some(merged_id.clone());

        if self.exists(&merged_id).await? {
            tracing::info!(asset_id = %merged_id, "Merged asset already exists; skipping upload and export");
            self.metrics.layers_completed_total.inc();
            let batch_ids = AssetId::batches(project, name, report.batches);
            report.cleanup = self.cleanup(name, &batch_ids).await;
            return Ok(report);
        }

        // 1. Upload
        let upload_options = UploadOptions {
            batch_size: self.settings.batch_size,
            probe_errors_as_missing: self.settings.probe_errors_as_missing,
        };
        let plan = upload_batches(&self.platform, project, layer, &upload_options, &self.metrics)
            .await
            .context("Batch upload failed")?;
        report.submitted = plan.tasks.len();
        report.skipped = plan.skipped;

        // 2. Wait for the batch exports
        tracing::info!(layer = name, tasks = plan.tasks.len(), "Waiting for batch export tasks");
        wait_for_tasks(
            &self.platform,
            &plan.tasks,
            &self.wait_options(),
            &self.cancel,
            &self.metrics,
        )
        .await
        .context("Batch export tasks did not complete")?;
        tracing::info!(layer = name, "All batch export tasks completed successfully");

        // 3. Merge
        let merged = merge_collections(name, &plan.batch_asset_ids, self.settings.merge_group_cap)
            .context("Nothing to merge")?;

        let total = self
            .platform
            .collection_size(&merged.collection)
            .await
            .context("Failed to count merged features")?;
        report.merged_feature_count = Some(total);
        tracing::info!(layer = name, features = total, "Done merging batches");

        // 4. Drop empty geometries and export the merged collection
        let filtered = drop_empty_geometries(merged.collection);
        let description = merged_description(name);
        let task = self
            .platform
            .export_table(&filtered, &description, &merged_id)
            .await
            .with_context(|| format!("Failed to submit export of {}", merged_id))?;
        tracing::info!(asset_id = %merged_id, task = %task.id, "Exporting merged asset");

        wait_for_tasks(
            &self.platform,
            std::slice::from_ref(&task),
            &self.wait_options(),
            &self.cancel,
            &self.metrics,
        )
        .await
        .context("Merged export task did not complete")?;
        tracing::info!(asset_id = %merged_id, "Merged asset export completed successfully");
        self.metrics.layers_completed_total.inc();

        // 5. Cleanup
        report.cleanup = self.cleanup(name, &plan.batch_asset_ids).await;

        tracing::info!(layer = name, "Finished processing layer");
        Ok(report)
    }

    /// Deletes the batch assets unless `--keep-batches` is set.
    async fn cleanup(&self, layer: &str, batch_ids: &[AssetId]) -> Option<CleanupReport> {
        if self.settings.keep_batches {
            tracing::info!(layer, "Keeping batch assets");
            return None;
        }

        tracing::info!(layer, assets = batch_ids.len(), "Deleting batch assets");
        let cleanup = delete_assets(&self.platform, batch_ids, &self.metrics).await;
        if !cleanup.is_clean() {
            tracing::warn!(
                layer,
                failed = cleanup.failed.len(),
                "Some batch assets could not be deleted"
            );
        }
        Some(cleanup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{InMemoryPlatform, TaskState};
    use geobatch::{Crs, LoadStats};
    use geojson::{Feature, Geometry, Value};
    use std::time::Duration;

    const PROJECT: &str = "projects/p";

    fn settings() -> RunSettings {
        RunSettings {
            project: PROJECT.into(),
            layers: Vec::new(),
            columns: Vec::new(),
            batch_size: 2,
            poll_interval: Duration::from_secs(10),
            max_wait: None,
            merge_group_cap: 100,
            strip_z: false,
            accept_cancelled: false,
            probe_errors_as_missing: false,
            keep_batches: false,
        }
    }

    fn layer(rows: usize) -> Layer {
        let features = (0..rows)
            .map(|i| Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![i as f64, 1.0]))),
                id: None,
                properties: None,
                foreign_members: None,
            })
            .collect();
        Layer {
            name: "wells".into(),
            crs: Crs::Wgs84,
            features,
            stats: LoadStats::default(),
        }
    }

    fn exporter(platform: InMemoryPlatform, settings: RunSettings) -> LayerExporter<InMemoryPlatform> {
        LayerExporter::new(platform, settings, Arc::new(Metrics::new()), CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_stops_before_merge() {
        let platform = InMemoryPlatform::new(PROJECT);
        platform.script_task("Wells Batch 2", vec![TaskState::Failed]);
        let exporter = exporter(platform, settings());

        let err = exporter.process_layer(&layer(5)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("The following tasks failed: Wells Batch 2"));

        let merged = AssetId::merged(PROJECT, "wells");
        assert!(exporter.platform().asset(&merged).is_none());
        assert!(exporter.platform().deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_merged_export_keeps_batches() {
        let platform = InMemoryPlatform::new(PROJECT);
        platform.script_task("Merged Wells", vec![TaskState::Running, TaskState::Failed]);
        let exporter = exporter(platform, settings());

        assert!(exporter.process_layer(&layer(4)).await.is_err());
        assert_eq!(exporter.platform().asset_ids(), AssetId::batches(PROJECT, "wells", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_batches_skips_cleanup() {
        let mut s = settings();
        s.keep_batches = true;
        let exporter = exporter(InMemoryPlatform::new(PROJECT), s);

        let report = exporter.process_layer(&layer(3)).await.unwrap();
        assert!(report.cleanup.is_none());
        assert_eq!(exporter.platform().asset_ids().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_layer_exports_nothing() {
        let exporter = exporter(InMemoryPlatform::new(PROJECT), settings());
        let report = exporter.process_layer(&layer(0)).await.unwrap();
        assert_eq!(report.batches, 0);
        assert!(report.merged_asset_id.is_none());
        assert!(exporter.platform().exports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_after_merged_export_only_cleans_up() {
        let platform = InMemoryPlatform::new(PROJECT);
        for id in AssetId::batches(PROJECT, "wells", 2) {
            platform.insert_asset(id, Vec::new());
        }
        platform.insert_asset(AssetId::merged(PROJECT, "wells"), Vec::new());
        let exporter = exporter(platform, settings());

        let report = exporter.process_layer(&layer(4)).await.unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(report.batches, 2);
        assert!(exporter.platform().exports().is_empty());
        assert_eq!(report.cleanup.unwrap().deleted.len(), 2);
        assert_eq!(
            exporter.platform().asset_ids(),
            vec![AssetId::merged(PROJECT, "wells")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_layer_is_not_uploaded_again() {
        let platform = InMemoryPlatform::new(PROJECT);
        platform.insert_asset(AssetId::merged(PROJECT, "wells"), Vec::new());
        let exporter = exporter(platform, settings());

        let report = exporter.process_layer(&layer(4)).await.unwrap();

        assert_eq!(report.submitted, 0);
        assert_eq!(report.merged_feature_count, None);
        assert!(exporter.platform().exports().is_empty());
        assert_eq!(exporter.platform().status_polls(), 0);

        let cleanup = report.cleanup.unwrap();
        assert!(cleanup.deleted.is_empty());
        assert_eq!(cleanup.absent, AssetId::batches(PROJECT, "wells", 2));
        assert!(cleanup.is_clean());
        assert_eq!(
            exporter.platform().asset_ids(),
            vec![AssetId::merged(PROJECT, "wells")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn layer_spec_options_override_global_flags() {
        let mut s = settings();
        s.columns = vec!["feature_ty".into()];
        s.strip_z = false;
        let exporter = exporter(InMemoryPlatform::new(PROJECT), s);

        let plain = LayerSpec {
            name: "roads".into(),
            ..Default::default()
        };
        let options = exporter.layer_options(&plain);
        assert_eq!(options.columns, vec!["feature_ty"]);
        assert!(!options.strip_z);
        assert!(options.filter.is_none());

        let fires = LayerSpec {
            name: "fires".into(),
            columns: Some(vec!["fire_id".into(), "rep_date".into()]),
            strip_z: Some(true),
            filter: Some(crate::config::RowFilter {
                column: "SRC Agency".into(),
                value: "AB".into(),
            }),
            ..Default::default()
        };
        let options = exporter.layer_options(&fires);
        assert_eq!(options.columns, vec!["fire_id", "rep_date"]);
        assert!(options.strip_z);
        assert_eq!(options.filter, Some(AttributeFilter::new("src_agency", "AB")));
    }
}
