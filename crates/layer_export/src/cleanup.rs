//! Asset Cleanup: best-effort deletion of the per-batch assets.

use crate::asset::AssetId;
use crate::metrics::Metrics;
use crate::platform::{Platform, PlatformError};

/// Outcome of deleting a list of assets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub deleted: Vec<AssetId>,
    /// Assets that were already gone (HTTP 404).
    pub absent: Vec<AssetId>,
    /// Assets that could not be deleted, with the error message.
    pub failed: Vec<(AssetId, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes every asset in `asset_ids`. A failed deletion is logged and
/// recorded; it never stops the remaining ones.
pub async fn delete_assets<P: Platform>(
    platform: &P,
    asset_ids: &[AssetId],
    metrics: &Metrics,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    for asset_id in asset_ids {
        match platform.delete_asset(asset_id).await {
            Ok(()) => {
                tracing::info!(%asset_id, "Successfully deleted");
                metrics.assets_deleted_total.inc();
                report.deleted.push(asset_id.clone());
            }
            Err(PlatformError::Status { status: 404, .. }) => {
                tracing::info!(%asset_id, "Already deleted");
                report.absent.push(asset_id.clone());
            }
            Err(e) => {
                tracing::warn!(%asset_id, error = %e, "Failed to delete");
                metrics.asset_deletions_failed_total.inc();
                report.failed.push((asset_id.clone(), e.to_string()));
            }
        }
    }

    report
}
