//! Collection Merger: unions many assets while keeping each group under the
//! platform's per-call collection cap.

use crate::asset::AssetId;
use crate::expr::CollectionExpr;

/// Default number of collections merged into one group.
pub const DEFAULT_GROUP_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct Merged {
    pub collection: CollectionExpr,
    /// Groups of at most `group_cap` inputs.
    pub group_count: usize,
    /// Pairwise merges folding the groups into the running total.
    pub cross_group_merges: usize,
}

/// Builds the union of `asset_ids` as one server-side collection.
///
/// Inside each group of `group_cap` IDs the assets are merged pairwise in
/// order; each finished group is then merged onto the running total.
/// Returns `None` for an empty input or a zero `group_cap`.
pub fn merge_collections(layer: &str, asset_ids: &[AssetId], group_cap: usize) -> Option<Merged> {
    if group_cap == 0 {
        tracing::error!(layer, "Merge group cap must be greater than zero");
        return None;
    }
    tracing::info!(layer, inputs = asset_ids.len(), "Merging collections");

    let total_groups = asset_ids.len().div_ceil(group_cap);
    let mut merged: Option<CollectionExpr> = None;
    let mut cross_group_merges = 0;

    for (i, group) in asset_ids.chunks(group_cap).enumerate() {
        let group_fc = group
            .iter()
            .map(|id| CollectionExpr::asset(id.clone()))
            .reduce(CollectionExpr::merge)?;

        merged = Some(match merged {
            None => group_fc,
            Some(total) => {
                cross_group_merges += 1;
                total.merge(group_fc)
            }
        });

        tracing::info!(layer, "Merged batch {} of {}", i + 1, total_groups);
    }

    merged.map(|collection| Merged {
        collection,
        group_count: total_groups,
        cross_group_merges,
    })
}
