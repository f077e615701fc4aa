//! CSV table serializers.
//!
//! Three tables are produced:
//!
//! - a per-image, per-channel-set object table
//!   ([`objects_csv`]): one row per detected object;
//! - the run-level nucleus table ([`nuclei_summary_csv`]): one row per
//!   nucleus, with a count/area/area/percent block per channel set;
//! - the run-level channel table ([`channel_summary_csv`]): one row per
//!   image and channel set, including objects outside every nucleus.
//!
//! Calibrated columns are labeled with the calibration unit, e.g.
//! `Area (micron²)`. When the images of a run disagree on the unit the
//! label falls back to `calibrated²`.
//!
//! These are pure functions with no I/O -- they return `String`s.

use std::fmt::Write;

use fociquant_pipeline::{ChannelResult, ImageSummary};

/// Unit label used when a run mixes calibration units.
const MIXED_UNIT: &str = "calibrated";

/// File name for the object table of one image and channel set:
/// `objects_<image>_<set>.csv`.
///
/// Characters outside `[A-Za-z0-9._+-]` are replaced with `_`.
#[must_use]
pub fn objects_file_name(image_id: &str, channel_set: &str) -> String {
    format!(
        "objects_{}_{}.csv",
        sanitize_file_component(image_id),
        sanitize_file_component(channel_set),
    )
}

fn sanitize_file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Serialize the objects of one channel set of one image.
///
/// Columns: `Object`, `Area (pixels)`, `Area (<unit>²)`, `Centroid X`,
/// `Centroid Y`, `Nucleus` (empty for objects outside every nucleus).
#[must_use]
pub fn objects_csv(image: &ImageSummary, channel: &ChannelResult) -> String {
    let unit = &image.calibration.unit;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Object,Area (pixels),{},Centroid X,Centroid Y,Nucleus",
        escape_field(&format!("Area ({unit}²)")),
    );
    for object in &channel.objects {
        let nucleus = object
            .parent_nucleus_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{},{},{},{:.3},{:.3},{nucleus}",
            object.label_id,
            object.area_px,
            format_area(object.area_calibrated),
            object.centroid.x,
            object.centroid.y,
        );
    }
    out
}

/// Serialize the run-level nucleus table.
///
/// The channel-set columns are the union over all images, in order of
/// first appearance. Images lacking a channel set get zeros there.
#[must_use]
pub fn nuclei_summary_csv(images: &[ImageSummary]) -> String {
    let unit = common_unit(images);
    let sets = channel_set_union(images);

    let mut header = vec![
        "Image".to_owned(),
        "Nucleus".to_owned(),
        "Nucleus Area (pixels)".to_owned(),
        format!("Nucleus Area ({unit}²)"),
    ];
    for set in &sets {
        header.push(format!("Foci Count ({set})"));
        header.push(format!("Total Foci Area (pixels) ({set})"));
        header.push(format!("Total Foci Area ({unit}²) ({set})"));
        header.push(format!("Relative Foci Area (%) ({set})"));
    }

    let mut out = String::new();
    write_row(&mut out, header.iter().map(String::as_str));

    for image in images {
        for nucleus in &image.nuclei {
            let mut row = vec![
                escape_field(&image.image_id),
                nucleus.nucleus_id.to_string(),
                nucleus.area_px.to_string(),
                format_area(nucleus.area_calibrated),
            ];
            for set in &sets {
                match nucleus.channel(set) {
                    Some(stats) => {
                        row.push(stats.foci_count.to_string());
                        row.push(stats.foci_area_px.to_string());
                        row.push(format_area(stats.foci_area_calibrated));
                        row.push(format!("{:.2}", stats.percent_area_occupied));
                    }
                    None => row.extend(["0", "0", "0.0000", "0.00"].map(str::to_owned)),
                }
            }
            let _ = writeln!(out, "{}", row.join(","));
        }
    }
    out
}

/// Serialize the run-level channel summary table.
///
/// Columns: `Image`, `Channel`, `Count`, `Assigned`, `Unassigned`,
/// `Total Area (pixels)`, `Total Area (<unit>²)`, `Average Size (pixels)`.
#[must_use]
pub fn channel_summary_csv(images: &[ImageSummary]) -> String {
    let unit = common_unit(images);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Image,Channel,Count,Assigned,Unassigned,Total Area (pixels),{},Average Size (pixels)",
        escape_field(&format!("Total Area ({unit}²)")),
    );
    for image in images {
        for channel in &image.channels {
            let s = &channel.summary;
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{:.2}",
                escape_field(&image.image_id),
                escape_field(&s.channel),
                s.object_count,
                s.assigned_count,
                s.unassigned_count,
                s.total_area_px,
                format_area(s.total_area_calibrated),
                s.mean_area_px,
            );
        }
    }
    out
}

/// Quote a field if it contains a comma, quote, or line break.
#[must_use]
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

fn write_row<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    let row: Vec<String> = fields.map(escape_field).collect();
    let _ = writeln!(out, "{}", row.join(","));
}

fn format_area(area: f64) -> String {
    format!("{area:.4}")
}

/// The calibration unit shared by every image, or [`MIXED_UNIT`].
fn common_unit(images: &[ImageSummary]) -> &str {
    let mut units = images.iter().map(|i| i.calibration.unit.as_str());
    match units.next() {
        Some(first) if units.all(|u| u == first) => first,
        Some(_) => MIXED_UNIT,
        None => fociquant_pipeline::Calibration::DEFAULT_UNIT,
    }
}

/// Channel sets of all images, in order of first appearance.
fn channel_set_union(images: &[ImageSummary]) -> Vec<&str> {
    let mut sets: Vec<&str> = Vec::new();
    for set in images.iter().flat_map(|i| i.channel_sets.iter()) {
        if !sets.contains(&set.as_str()) {
            sets.push(set);
        }
    }
    sets
}
