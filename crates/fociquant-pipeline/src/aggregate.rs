//! Per-nucleus aggregation of foci and colocalization objects.
//!
//! Every object is assigned to the nucleus holding the plurality of its
//! pixels. Objects outside every nucleus stay unassigned: they count
//! toward the image-level [`ChannelSummary`] but not toward any nucleus.
//! A nucleus's foci area only counts object pixels that lie inside it, so
//! an object straddling the border adds just its overlap.
//! Per-channel statistics are then left-joined onto the nucleus list, so
//! every nucleus carries a [`ChannelStats`] entry for every channel set,
//! zero-filled where it has no objects.

use std::collections::{BTreeMap, HashMap};

use crate::types::{
    ChannelResult, ChannelStats, ChannelSummary, LabelMask, NucleusRecord, ObjectRecord,
    PipelineError,
};

/// Objects of one channel set together with the mask they were measured on.
#[derive(Debug, Clone)]
pub struct ChannelObjects<'a> {
    /// Channel set identifier.
    pub channel: String,
    /// `true` for a colocalization set.
    pub colocalization: bool,
    /// Label mask the objects' `label_id`s refer to.
    pub labels: &'a LabelMask,
    /// Measured objects.
    pub objects: Vec<ObjectRecord>,
}

/// Object label id -> pixels of that object inside its parent nucleus.
pub type ParentOverlap = HashMap<u32, u64>;

/// Stamp each object with the nucleus holding the plurality of its pixels.
///
/// Ties go to the lowest nucleus id. Objects with no nucleus pixel get
/// `None` and no overlap entry.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if `labels` and `nuclei`
/// differ in shape.
pub fn assign_parents(
    nuclei: &LabelMask,
    labels: &LabelMask,
    objects: &mut [ObjectRecord],
) -> Result<ParentOverlap, PipelineError> {
    if labels.dimensions() != nuclei.dimensions() {
        return Err(PipelineError::DimensionMismatch {
            expected: nuclei.dimensions(),
            found: labels.dimensions(),
        });
    }

    // label -> nucleus -> overlapping pixel count
    let mut overlap: HashMap<u32, BTreeMap<u32, u64>> = HashMap::new();
    for (&label, &nucleus) in labels.as_slice().iter().zip(nuclei.as_slice()) {
        if label != 0 && nucleus != 0 {
            *overlap.entry(label).or_default().entry(nucleus).or_insert(0) += 1;
        }
    }

    let mut inside = ParentOverlap::new();
    for object in objects {
        let parent = overlap.get(&object.label_id).and_then(|counts| {
            // Ascending ids: on equal counts the first one stays.
            counts
                .iter()
                .fold(None, |best: Option<(u32, u64)>, (&nucleus, &count)| match best {
                    Some((_, best_count)) if best_count >= count => best,
                    _ => Some((nucleus, count)),
                })
        });
        object.parent_nucleus_id = parent.map(|(nucleus, _)| nucleus);
        if let Some((_, count)) = parent {
            inside.insert(object.label_id, count);
        }
    }
    Ok(inside)
}

/// Image-level totals for one channel set.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summarize_channel(channel: &str, objects: &[ObjectRecord]) -> ChannelSummary {
    let object_count = objects.len() as u64;
    let assigned_count = objects
        .iter()
        .filter(|o| o.parent_nucleus_id.is_some())
        .count() as u64;
    let total_area_px: u64 = objects.iter().map(|o| o.area_px).sum();
    let total_area_calibrated: f64 = objects.iter().map(|o| o.area_calibrated).sum();
    let mean_area_px = if object_count == 0 {
        0.0
    } else {
        total_area_px as f64 / object_count as f64
    };
    ChannelSummary {
        channel: channel.to_owned(),
        object_count,
        assigned_count,
        unassigned_count: object_count - assigned_count,
        total_area_px,
        total_area_calibrated,
        mean_area_px,
    }
}

/// `100 * foci_area_px / nucleus_area_px`.
///
/// A zero-area nucleus yields 0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percent_area_occupied(foci_area_px: u64, nucleus_area_px: u64) -> f64 {
    if nucleus_area_px == 0 {
        return 0.0;
    }
    100.0 * foci_area_px as f64 / nucleus_area_px as f64
}

/// Calibrated share of an object covering `inside_px` of its pixels.
#[allow(clippy::cast_precision_loss)]
fn calibrated_part(object: &ObjectRecord, inside_px: u64) -> f64 {
    if object.area_px == 0 {
        return 0.0;
    }
    object.area_calibrated * inside_px as f64 / object.area_px as f64
}

/// Roll channel results up onto each nucleus.
///
/// `overlaps[i]` holds the parent overlap of `channels[i]`, as returned by
/// [`assign_parents`]. Output is ordered by nucleus id; each record's
/// `channels` follow the order of `channels`.
#[must_use]
pub fn nucleus_records(
    nuclei: &[ObjectRecord],
    channels: &[ChannelResult],
    overlaps: &[ParentOverlap],
) -> Vec<NucleusRecord> {
    let mut records: Vec<NucleusRecord> = nuclei
        .iter()
        .map(|n| NucleusRecord {
            nucleus_id: n.label_id,
            area_px: n.area_px,
            area_calibrated: n.area_calibrated,
            centroid: n.centroid,
            channels: channels
                .iter()
                .map(|c| ChannelStats::empty(&c.channel))
                .collect(),
        })
        .collect();
    records.sort_by_key(|r| r.nucleus_id);

    let index: HashMap<u32, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.nucleus_id, i))
        .collect();

    for (slot, channel) in channels.iter().enumerate() {
        for object in &channel.objects {
            let Some(&i) = object.parent_nucleus_id.and_then(|id| index.get(&id)) else {
                continue;
            };
            let inside_px = overlaps
                .get(slot)
                .and_then(|overlap| overlap.get(&object.label_id))
                .copied()
                .unwrap_or(0);
            let stats = &mut records[i].channels[slot];
            stats.foci_count += 1;
            stats.foci_area_px += inside_px;
            stats.foci_area_calibrated += calibrated_part(object, inside_px);
        }
    }

    for record in &mut records {
        let nucleus_area = record.area_px;
        for stats in &mut record.channels {
            stats.percent_area_occupied = percent_area_occupied(stats.foci_area_px, nucleus_area);
        }
    }
    records
}

/// Assign parents for every channel set and build the per-nucleus table.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if any channel's mask
/// differs in shape from `nuclei`.
pub fn aggregate(
    nuclei: &LabelMask,
    nucleus_objects: &[ObjectRecord],
    channels: Vec<ChannelObjects<'_>>,
) -> Result<(Vec<NucleusRecord>, Vec<ChannelResult>), PipelineError> {
    let mut results = Vec::with_capacity(channels.len());
    let mut overlaps = Vec::with_capacity(channels.len());
    for mut channel in channels {
        overlaps.push(assign_parents(nuclei, channel.labels, &mut channel.objects)?);
        let summary = summarize_channel(&channel.channel, &channel.objects);
        results.push(ChannelResult {
            channel: channel.channel,
            colocalization: channel.colocalization,
            objects: channel.objects,
            summary,
        });
    }
    let records = nucleus_records(nucleus_objects, &results, &overlaps);
    Ok((records, results))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::label::{label_components, measure};
    use crate::types::{BinaryMask, Dimensions};

    fn cal() -> Calibration {
        Calibration::square(1.0, "px").unwrap()
    }

    fn rect(dims: Dimensions, x0: u32, y0: u32, x1: u32, y1: u32) -> BinaryMask {
        BinaryMask::from_fn(dims, |x, y| x >= x0 && x < x1 && y >= y0 && y < y1)
    }

    fn channel<'a>(name: &str, labels: &'a LabelMask) -> ChannelObjects<'a> {
        ChannelObjects {
            channel: name.to_owned(),
            colocalization: false,
            labels,
            objects: measure(labels, &cal()),
        }
    }

    #[test]
    fn focus_inside_nucleus_is_counted() {
        let dims = Dimensions::new(10, 10);
        let nuclei = label_components(&rect(dims, 2, 2, 8, 8));
        let foci = label_components(&rect(dims, 4, 4, 6, 6));
        let nucleus_objects = measure(&nuclei, &cal());

        let (records, results) =
            aggregate(&nuclei, &nucleus_objects, vec![channel("Foci_1", &foci)]).unwrap();
        assert_eq!(records.len(), 1);
        let stats = records[0].channel("Foci_1").unwrap();
        assert_eq!(records[0].area_px, 36);
        assert_eq!(stats.foci_count, 1);
        assert_eq!(stats.foci_area_px, 4);
        assert!((stats.percent_area_occupied - 100.0 * 4.0 / 36.0).abs() < 1e-9);
        assert_eq!(results[0].objects[0].parent_nucleus_id, Some(1));
    }

    #[test]
    fn object_outside_nuclei_is_unassigned_but_counted() {
        let dims = Dimensions::new(10, 10);
        let nuclei = label_components(&rect(dims, 0, 0, 4, 4));
        let foci = label_components(&rect(dims, 7, 7, 9, 9));
        let nucleus_objects = measure(&nuclei, &cal());

        let (records, results) =
            aggregate(&nuclei, &nucleus_objects, vec![channel("Foci_1", &foci)]).unwrap();
        let stats = records[0].channel("Foci_1").unwrap();
        assert_eq!(stats.foci_count, 0);
        assert!(stats.percent_area_occupied.abs() < f64::EPSILON);
        assert_eq!(results[0].summary.object_count, 1);
        assert_eq!(results[0].summary.unassigned_count, 1);
        assert_eq!(results[0].summary.assigned_count, 0);
    }

    #[test]
    fn straddling_object_goes_to_plurality_nucleus() {
        let dims = Dimensions::new(10, 1);
        let nuclei = LabelMask::from_raw(dims, vec![1, 1, 1, 1, 2, 2, 2, 2, 2, 2]).unwrap();
        let foci = LabelMask::from_raw(dims, vec![0, 0, 0, 1, 1, 1, 0, 0, 0, 0]).unwrap();
        let mut objects = measure(&foci, &cal());
        let inside = assign_parents(&nuclei, &foci, &mut objects).unwrap();
        assert_eq!(objects[0].parent_nucleus_id, Some(2));
        assert_eq!(inside[&1], 2);
    }

    #[test]
    fn plurality_tie_goes_to_lowest_nucleus() {
        let dims = Dimensions::new(6, 1);
        let nuclei = LabelMask::from_raw(dims, vec![0, 3, 3, 2, 2, 0]).unwrap();
        let foci = LabelMask::from_raw(dims, vec![0, 1, 1, 1, 1, 0]).unwrap();
        let mut objects = measure(&foci, &cal());
        assign_parents(&nuclei, &foci, &mut objects).unwrap();
        assert_eq!(objects[0].parent_nucleus_id, Some(2));
    }

    #[test]
    fn absent_channels_are_zero_filled() {
        let dims = Dimensions::new(12, 6);
        let nuclei = LabelMask::from_raw(
            dims,
            (0..72).map(|i| if i % 12 < 5 { 1 } else if i % 12 > 6 { 2 } else { 0 }).collect(),
        )
        .unwrap();
        let foci = label_components(&rect(dims, 1, 1, 3, 3));
        let nucleus_objects = measure(&nuclei, &cal());
        let (records, _) =
            aggregate(&nuclei, &nucleus_objects, vec![channel("Foci_1", &foci)]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].channel("Foci_1").unwrap().foci_count, 1);
        assert_eq!(records[1].channel("Foci_1").unwrap(), &ChannelStats::empty("Foci_1"));
    }

    #[test]
    fn several_channels_share_one_record() {
        let dims = Dimensions::new(10, 10);
        let nuclei = label_components(&rect(dims, 0, 0, 10, 10));
        let a = label_components(&rect(dims, 1, 1, 3, 3));
        let b = label_components(&rect(dims, 5, 5, 6, 6));
        let nucleus_objects = measure(&nuclei, &cal());
        let (records, results) = aggregate(
            &nuclei,
            &nucleus_objects,
            vec![channel("A", &a), channel("B", &b)],
        )
        .unwrap();
        assert_eq!(records[0].channels.len(), 2);
        assert_eq!(records[0].channels[0].foci_area_px, 4);
        assert_eq!(records[0].channels[1].foci_area_px, 1);
        assert_eq!(results[1].channel, "B");
    }

    #[test]
    fn mismatched_channel_mask_is_rejected() {
        let nuclei = LabelMask::new(Dimensions::new(4, 4));
        let foci = LabelMask::new(Dimensions::new(5, 4));
        assert!(matches!(
            aggregate(&nuclei, &[], vec![channel("A", &foci)]),
            Err(PipelineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn percent_is_plain_ratio() {
        assert!(percent_area_occupied(5, 0).abs() < f64::EPSILON);
        assert!(percent_area_occupied(0, 10).abs() < f64::EPSILON);
        assert!((percent_area_occupied(3, 12) - 25.0).abs() < 1e-12);
        assert!((percent_area_occupied(20, 10) - 200.0).abs() < 1e-12);
    }

    #[test]
    fn straddling_focus_counts_only_pixels_inside_its_nucleus() {
        // 36 px nucleus; 40 px focus with 30 px inside and 10 px below it.
        let dims = Dimensions::new(10, 10);
        let nuclei = label_components(&rect(dims, 2, 2, 8, 8));
        let foci = label_components(&BinaryMask::from_fn(dims, |x, y| {
            ((2..8).contains(&x) && (3..8).contains(&y)) || ((2..7).contains(&x) && y >= 8)
        }));
        let nucleus_objects = measure(&nuclei, &cal());

        let (records, results) =
            aggregate(&nuclei, &nucleus_objects, vec![channel("Foci_1", &foci)]).unwrap();
        let stats = records[0].channel("Foci_1").unwrap();
        assert_eq!(results[0].objects[0].area_px, 40);
        assert_eq!(results[0].summary.total_area_px, 40);
        assert_eq!(stats.foci_count, 1);
        assert_eq!(stats.foci_area_px, 30);
        assert!((stats.foci_area_calibrated - 30.0).abs() < 1e-9);
        assert!((stats.percent_area_occupied - 100.0 * 30.0 / 36.0).abs() < 1e-9);
        assert!(stats.percent_area_occupied <= 100.0);
    }

    #[test]
    fn channel_summary_reports_mean_area() {
        let dims = Dimensions::new(10, 10);
        let foci = LabelMask::from_raw(
            dims,
            (0..100u32)
                .map(|i| match i {
                    0 | 1 => 1,
                    50..=53 => 2,
                    _ => 0,
                })
                .collect(),
        )
        .unwrap();
        let summary = summarize_channel("A", &measure(&foci, &cal()));
        assert_eq!(summary.object_count, 2);
        assert_eq!(summary.total_area_px, 6);
        assert!((summary.mean_area_px - 3.0).abs() < 1e-12);

        let empty = summarize_channel("A", &[]);
        assert!(empty.mean_area_px.abs() < f64::EPSILON);
    }
}
