//! Connected-component labeling and per-object measurement.
//!
//! Labels are always renumbered to `1..=n` in row-major order of each
//! object's first pixel, so the same mask produces the same numbering on
//! every run and every machine.

use std::collections::HashMap;

use imageproc::region_labelling::{Connectivity, connected_components};

use crate::calibration::Calibration;
use crate::types::{BinaryMask, BoundingBox, LabelMask, ObjectRecord, Point};

/// Label the 8-connected foreground components of a binary mask.
#[must_use = "returns the labeled mask"]
pub fn label_components(mask: &BinaryMask) -> LabelMask {
    let dimensions = mask.dimensions();
    if mask.is_empty() {
        return LabelMask::new(dimensions);
    }
    let components = connected_components(
        &mask.to_gray_image(),
        Connectivity::Eight,
        image::Luma([0u8]),
    );
    let raw = LabelMask::from_raw(dimensions, components.into_raw())
        .unwrap_or_else(|_| LabelMask::new(dimensions));
    relabel_sequential(&raw)
}

/// Renumber labels to `1..=n` in row-major order of first occurrence.
///
/// Pixels keep their grouping; only the label values change.
#[must_use = "returns the relabeled mask"]
pub fn relabel_sequential(labels: &LabelMask) -> LabelMask {
    let mut mapping: HashMap<u32, u32> = HashMap::new();
    let mut next = 0u32;
    let relabeled = labels
        .as_slice()
        .iter()
        .map(|&label| {
            if label == 0 {
                return 0;
            }
            *mapping.entry(label).or_insert_with(|| {
                next += 1;
                next
            })
        })
        .collect();
    LabelMask::from_raw(labels.dimensions(), relabeled)
        .unwrap_or_else(|_| LabelMask::new(labels.dimensions()))
}

/// Remove objects smaller than `min_size_px` pixels and renumber the rest.
#[must_use = "returns the filtered mask"]
pub fn filter_by_size(labels: &LabelMask, min_size_px: u64) -> LabelMask {
    let areas = label_areas(labels);
    let kept = labels
        .as_slice()
        .iter()
        .map(|&label| {
            if label != 0 && areas.get(&label).copied().unwrap_or(0) >= min_size_px {
                label
            } else {
                0
            }
        })
        .collect();
    let filtered = LabelMask::from_raw(labels.dimensions(), kept)
        .unwrap_or_else(|_| LabelMask::new(labels.dimensions()));
    relabel_sequential(&filtered)
}

/// Pixel count of every non-zero label.
#[must_use]
pub fn label_areas(labels: &LabelMask) -> HashMap<u32, u64> {
    let mut areas = HashMap::new();
    for &label in labels.as_slice() {
        if label != 0 {
            *areas.entry(label).or_insert(0) += 1;
        }
    }
    areas
}

/// Running sums for one object.
struct Accumulator {
    label: u32,
    area: u64,
    sum_x: u64,
    sum_y: u64,
    bbox: BoundingBox,
}

/// Measure every object of a label mask.
///
/// Records come out in row-major order of each object's first pixel and
/// carry the mask's own label values, so they can be looked up in
/// `labels` afterwards. For a mask produced by this crate that order is
/// simply ascending label id. An empty mask yields no records.
#[must_use = "returns the object measurements"]
#[allow(clippy::cast_precision_loss)]
pub fn measure(labels: &LabelMask, calibration: &Calibration) -> Vec<ObjectRecord> {
    let width = labels.dimensions().width as usize;
    let mut index: HashMap<u32, usize> = HashMap::new();
    let mut objects: Vec<Accumulator> = Vec::new();

    for (i, &label) in labels.as_slice().iter().enumerate() {
        if label == 0 {
            continue;
        }
        #[allow(clippy::cast_possible_truncation)]
        let (x, y) = ((i % width) as u32, (i / width) as u32);
        let slot = *index.entry(label).or_insert_with(|| {
            objects.push(Accumulator {
                label,
                area: 0,
                sum_x: 0,
                sum_y: 0,
                bbox: BoundingBox {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                },
            });
            objects.len() - 1
        });
        let acc = &mut objects[slot];
        acc.area += 1;
        acc.sum_x += u64::from(x);
        acc.sum_y += u64::from(y);
        acc.bbox.min_x = acc.bbox.min_x.min(x);
        acc.bbox.min_y = acc.bbox.min_y.min(y);
        acc.bbox.max_x = acc.bbox.max_x.max(x);
        acc.bbox.max_y = acc.bbox.max_y.max(y);
    }

    objects
        .into_iter()
        .map(|acc| ObjectRecord {
            label_id: acc.label,
            area_px: acc.area,
            area_calibrated: calibration.area(acc.area),
            centroid: Point::new(
                acc.sum_x as f64 / acc.area as f64,
                acc.sum_y as f64 / acc.area as f64,
            ),
            bbox: acc.bbox,
            parent_nucleus_id: None,
        })
        .collect()
}

/// Label a binary mask and measure its components.
#[must_use = "returns the object measurements"]
pub fn measure_binary(mask: &BinaryMask, calibration: &Calibration) -> Vec<ObjectRecord> {
    measure(&label_components(mask), calibration)
}
