//! Colocalization: pixel-wise intersection of foci channels.
//!
//! A colocalized focus is a region that is foreground in every channel of
//! a channel set. Intersections are separated and labeled exactly like a
//! single foci channel, so the aggregator treats a channel set and a
//! plain channel the same way.
//!
//! Channel sets are named by their sorted channel names joined with `+`
//! (see [`channel_set_id`]).

use serde::{Deserialize, Serialize};

use crate::types::{BinaryMask, LabelMask, PipelineError};
use crate::watershed::separate;

/// Which channel combinations to colocalize.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColocMode {
    /// Every pair of channels.
    #[default]
    Pairwise,

    /// Every subset with `min_size..=max_size` channels. `max_size` is
    /// clamped to the number of channels.
    AllSubsets {
        /// Smallest subset size (at least 2).
        min_size: usize,
        /// Largest subset size.
        max_size: usize,
    },

    /// Exactly the listed channel sets.
    Explicit(Vec<Vec<String>>),
}

impl ColocMode {
    /// Resolve this mode against the available channel names.
    ///
    /// Each returned set is sorted by name. Sets are ordered by size,
    /// then lexicographically; duplicates are removed. Fewer than two
    /// channels yield no sets for the generated modes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameter`] if a subset size is
    /// below 2 or inverted, or an explicit set names an unknown channel
    /// or has fewer than two distinct channels.
    pub fn channel_sets(&self, channels: &[String]) -> Result<Vec<Vec<String>>, PipelineError> {
        let mut names: Vec<String> = channels.to_vec();
        names.sort();
        names.dedup();

        let mut sets = match self {
            Self::Pairwise => combinations(&names, 2),
            Self::AllSubsets { min_size, max_size } => {
                if *min_size < 2 || min_size > max_size {
                    return Err(PipelineError::InvalidParameter(format!(
                        "colocalization subset sizes must satisfy 2 <= min <= max, got {min_size}..={max_size}",
                    )));
                }
                let max = (*max_size).min(names.len());
                (*min_size..=max)
                    .flat_map(|size| combinations(&names, size))
                    .collect()
            }
            Self::Explicit(requested) => requested
                .iter()
                .map(|set| validate_set(set, &names))
                .collect::<Result<Vec<_>, _>>()?,
        };
        sets.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        sets.dedup();
        Ok(sets)
    }
}

fn validate_set(set: &[String], known: &[String]) -> Result<Vec<String>, PipelineError> {
    let mut sorted = set.to_vec();
    sorted.sort();
    sorted.dedup();
    if let Some(unknown) = sorted.iter().find(|name| known.binary_search(*name).is_err()) {
        return Err(PipelineError::InvalidParameter(format!(
            "colocalization set names unknown channel '{unknown}'",
        )));
    }
    if sorted.len() < 2 {
        return Err(PipelineError::InvalidParameter(format!(
            "colocalization set '{}' needs at least two channels",
            channel_set_id(&sorted),
        )));
    }
    Ok(sorted)
}

/// Every `size`-element subset of `items`, in lexicographic index order.
fn combinations(items: &[String], size: usize) -> Vec<Vec<String>> {
    let n = items.len();
    if size == 0 || size > n {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut idx: Vec<usize> = (0..size).collect();
    loop {
        out.push(idx.iter().map(|&i| items[i].clone()).collect());
        // Rightmost index that can still advance.
        let Some(pos) = (0..size).rev().find(|&i| idx[i] != i + n - size) else {
            return out;
        };
        idx[pos] += 1;
        for i in pos + 1..size {
            idx[i] = idx[i - 1] + 1;
        }
    }
}

/// Identifier of a channel set: names sorted and joined with `+`.
#[must_use]
pub fn channel_set_id<S: AsRef<str>>(names: &[S]) -> String {
    let mut sorted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.join("+")
}

/// Logical AND of the binarized masks.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidParameter`] for fewer than two masks
/// and [`PipelineError::DimensionMismatch`] if any mask differs in shape
/// from the first.
pub fn intersect(masks: &[&LabelMask]) -> Result<BinaryMask, PipelineError> {
    let [first, rest @ ..] = masks else {
        return Err(PipelineError::InvalidParameter(
            "colocalization needs at least two channels".to_owned(),
        ));
    };
    if rest.is_empty() {
        return Err(PipelineError::InvalidParameter(
            "colocalization needs at least two channels".to_owned(),
        ));
    }
    let expected = first.dimensions();
    if let Some(other) = rest.iter().find(|m| m.dimensions() != expected) {
        return Err(PipelineError::DimensionMismatch {
            expected,
            found: other.dimensions(),
        });
    }
    let data: Vec<bool> = (0..expected.pixel_count())
        .map(|i| masks.iter().all(|m| m.as_slice()[i] != 0))
        .collect();
    BinaryMask::from_values(expected, &data)
}

/// Intersect the masks and split touching overlap regions.
///
/// # Errors
///
/// Same as [`intersect`].
pub fn colocalize(masks: &[&LabelMask], seed_tolerance: f64) -> Result<LabelMask, PipelineError> {
    Ok(separate(&intersect(masks)?, seed_tolerance))
}
