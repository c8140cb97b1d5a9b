//! Batch Uploader: one export task per batch, skipping batches whose asset
//! already exists so that re-runs only redo what is missing.

use crate::asset::{batch_description, AssetId};
use crate::expr::CollectionExpr;
use crate::metrics::Metrics;
use crate::platform::{AssetProbe, Platform, PlatformError, TaskHandle};
use geobatch::{partition, GeoBatchError, Layer};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub batch_size: usize,
    /// Legacy behaviour: a failed existence check counts as "missing".
    pub probe_errors_as_missing: bool,
}

/// What the uploader did for one layer.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    /// Tasks started in this run, in batch order.
    pub tasks: Vec<TaskHandle>,
    /// Every expected batch asset, submitted or pre-existing, in batch order.
    pub batch_asset_ids: Vec<AssetId>,
    /// Batches skipped because their asset already existed.
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Partition(#[from] GeoBatchError),

    #[error("existence check for {asset_id} failed ({} task(s) already running): {source}", .submitted.len())]
    Probe {
        asset_id: AssetId,
        #[source]
        source: PlatformError,
        /// Tasks started before the failure; they keep running remotely.
        submitted: Vec<TaskHandle>,
    },

    #[error("failed to submit export of {asset_id} ({} task(s) already running): {source}", .submitted.len())]
    Submit {
        asset_id: AssetId,
        #[source]
        source: PlatformError,
        submitted: Vec<TaskHandle>,
    },
}

/// Splits `layer` into batches and starts an export task for every batch
/// whose asset does not exist yet.
pub async fn upload_batches<P: Platform>(
    platform: &P,
    project: &str,
    layer: &Layer,
    options: &UploadOptions,
    metrics: &Metrics,
) -> Result<UploadPlan, UploadError> {
    let batches = partition(&layer.features, layer.crs, options.batch_size)?;
    tracing::info!(
        layer = %layer.name,
        batches = batches.len(),
        batch_size = options.batch_size,
        "Total of batches to export"
    );

    let mut plan = UploadPlan {
        tasks: Vec::new(),
        batch_asset_ids: Vec::with_capacity(batches.len()),
        skipped: 0,
    };

    for batch in batches {
        let asset_id = AssetId::batch(project, &layer.name, batch.index);
        plan.batch_asset_ids.push(asset_id.clone());

        let exists = match platform.probe_asset(&asset_id).await {
            Ok(probe) => probe == AssetProbe::Exists,
            Err(e) if options.probe_errors_as_missing => {
                tracing::warn!(%asset_id, error = %e, "Existence check failed; exporting anyway");
                false
            }
            Err(source) => {
                log_orphaned(&layer.name, &plan.tasks);
                return Err(UploadError::Probe {
                    asset_id,
                    source,
                    submitted: plan.tasks,
                });
            }
        };

        if exists {
            tracing::info!(%asset_id, batch = batch.index, "Export skipped: asset already exists");
            plan.skipped += 1;
            metrics.batches_skipped_total.inc();
            continue;
        }

        let rows = batch.len();
        let collection = CollectionExpr::inline(batch.features);
        let description = batch_description(&layer.name, batch.index);
        let task = match platform.export_table(&collection, &description, &asset_id).await {
            Ok(task) => task,
            Err(source) => {
                log_orphaned(&layer.name, &plan.tasks);
                return Err(UploadError::Submit {
                    asset_id,
                    source,
                    submitted: plan.tasks,
                });
            }
        };

        tracing::info!(%asset_id, batch = batch.index, rows, task = %task.id, "Export task started");
        metrics.batches_submitted_total.inc();
        plan.tasks.push(task);
    }

    Ok(plan)
}

/// Names the tasks left running remotely when the upload stops early.
fn log_orphaned(layer: &str, tasks: &[TaskHandle]) {
    for task in tasks {
        tracing::warn!(
            layer,
            task = %task.id,
            description = %task.description,
            "Upload stopped; task is still running remotely"
        );
    }
}
