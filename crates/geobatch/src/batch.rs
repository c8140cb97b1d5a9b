//! Fixed-size batching of a layer's rows.

use crate::crs::{Crs, TARGET_EPSG};
use crate::{GeoBatchError, Result};
use geojson::Feature;

/// Number of batches `rows` split into with `batch_size` rows each.
#[inline]
pub fn batch_count(rows: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    rows.div_ceil(batch_size)
}

/// A contiguous slice of a layer, already in EPSG:4326.
#[derive(Debug, Clone)]
pub struct Batch {
    /// 1-based position of this batch within the layer.
    pub index: usize,
    pub features: Vec<Feature>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Splits `features` into consecutive batches of `batch_size` rows and
/// reprojects each one from `crs` to EPSG:4326.
///
/// The final batch carries the remainder. An empty input yields no batches.
pub fn partition(features: &[Feature], crs: Crs, batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(GeoBatchError::ZeroBatchSize);
    }

    let batches = features
        .chunks(batch_size)
        .enumerate()
        .map(|(i, chunk)| {
            let mut features = chunk.to_vec();
            if crs.epsg() != TARGET_EPSG {
                for geometry in features.iter_mut().filter_map(|f| f.geometry.as_mut()) {
                    crs.to_wgs84(&mut geometry.value);
                }
            }
            Batch {
                index: i + 1,
                features,
            }
        })
        .collect();

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::{Geometry, Value};

    fn point_feature(x: f64, y: f64) -> Feature {
        Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::Point(vec![x, y]))),
            id: None,
            properties: None,
            foreign_members: None,
        }
    }

    #[test]
    fn counts_round_up() {
        assert_eq!(batch_count(0, 500), 0);
        assert_eq!(batch_count(1, 500), 1);
        assert_eq!(batch_count(500, 500), 1);
        assert_eq!(batch_count(501, 500), 2);
        assert_eq!(batch_count(1200, 500), 3);
        assert_eq!(batch_count(10, 0), 0);
    }

    #[test]
    fn partition_sizes_and_indices() {
        let features: Vec<Feature> = (0..1200).map(|i| point_feature(i as f64, 0.0)).collect();
        let batches = partition(&features, Crs::Wgs84, 500).unwrap();

        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        let indices: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);

        // Rows stay in order across batch boundaries.
        let first_of_second = batches[1].features[0].geometry.as_ref().unwrap();
        assert_eq!(first_of_second.value, Value::Point(vec![500.0, 0.0]));
    }

    #[test]
    fn partition_reprojects_mercator() {
        let features = vec![point_feature(0.0, 0.0), point_feature(20_037_508.342789244, 0.0)];
        let batches = partition(&features, Crs::WebMercator, 10).unwrap();
        let Some(Geometry { value: Value::Point(p), .. }) = &batches[0].features[1].geometry else {
            panic!("expected point");
        };
        assert!((p[0] - 180.0).abs() < 1e-9);

        // The source slice is left untouched.
        assert_eq!(
            features[1].geometry.as_ref().unwrap().value,
            Value::Point(vec![20_037_508.342789244, 0.0])
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(
            partition(&[], Crs::Wgs84, 0),
            Err(GeoBatchError::ZeroBatchSize)
        ));
        assert!(partition(&[], Crs::Wgs84, 500).unwrap().is_empty());
    }
}
