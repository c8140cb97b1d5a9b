//! Remote asset identifiers and the naming scheme for batch/merged assets.
//!
//! The names must stay bit-exact: re-runs find previously exported batches by
//! recomputing them.

use std::fmt;

/// An identifier in the remote asset namespace,
/// e.g. `projects/ee-ronnyale/assets/industrials_batch_3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<project>/assets/<layer>_batch_<index>`, `index` 1-based.
    pub fn batch(project: &str, layer: &str, index: usize) -> Self {
        Self(format!("{}/assets/{}_batch_{}", trim_project(project), layer, index))
    }

    /// `<project>/assets/<layer>_merged`.
    pub fn merged(project: &str, layer: &str) -> Self {
        Self(format!("{}/assets/{}_merged", trim_project(project), layer))
    }

    /// Every batch ID of a layer split into `count` batches, in order.
    pub fn batches(project: &str, layer: &str, count: usize) -> Vec<Self> {
        (1..=count).map(|i| Self::batch(project, layer, i)).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AssetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[inline]
fn trim_project(project: &str) -> &str {
    project.trim_end_matches('/')
}

/// First letter upper-cased, the rest lower-cased: `"industrials"` -> `"Industrials"`.
pub fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Task description of a batch export: `"Industrials Batch 2"`.
pub fn batch_description(layer: &str, index: usize) -> String {
    format!("{} Batch {}", capitalize(layer), index)
}

/// Task description of the merged export: `"Merged Industrials"`.
pub fn merged_description(layer: &str) -> String {
    format!("Merged {}", capitalize(layer))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = "projects/ee-ronnyale";

    #[test]
    fn names_are_bit_exact() {
        assert_eq!(
            AssetId::batch(PROJECT, "industrials", 1).as_str(),
            "projects/ee-ronnyale/assets/industrials_batch_1"
        );
        assert_eq!(
            AssetId::merged(PROJECT, "industrials").as_str(),
            "projects/ee-ronnyale/assets/industrials_merged"
        );
        assert_eq!(
            AssetId::batch("projects/ee-ronnyale/", "roads", 12).to_string(),
            "projects/ee-ronnyale/assets/roads_batch_12"
        );
    }

    #[test]
    fn batch_list_is_one_based_and_ordered() {
        let ids = AssetId::batches(PROJECT, "roads", 3);
        let names: Vec<&str> = ids.iter().map(AssetId::as_str).collect();
        assert_eq!(
            names,
            vec![
                "projects/ee-ronnyale/assets/roads_batch_1",
                "projects/ee-ronnyale/assets/roads_batch_2",
                "projects/ee-ronnyale/assets/roads_batch_3",
            ]
        );
        assert!(AssetId::batches(PROJECT, "roads", 0).is_empty());
    }

    #[test]
    fn descriptions() {
        assert_eq!(capitalize("industrials"), "Industrials");
        assert_eq!(capitalize("ROADS"), "Roads");
        assert_eq!(capitalize(""), "");
        assert_eq!(batch_description("fires", 4), "Fires Batch 4");
        assert_eq!(merged_description("fires"), "Merged Fires");
    }
}
