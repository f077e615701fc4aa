//! Touching-object separation by distance-transform watershed.
//!
//! Thresholded foci and binarized nuclei often merge neighbouring objects
//! into a single connected component. Splitting follows the classic
//! Euclidean-distance-map watershed:
//!
//! 1. Compute each foreground pixel's Euclidean distance to the nearest
//!    background pixel. Pixels outside the image count as background.
//! 2. Visit foreground pixels from the highest distance down (ties in
//!    row-major order). A pixel with no labeled 8-neighbour is a local
//!    maximum and seeds a new basin; seeds are numbered in the order they
//!    are created.
//! 3. A pixel touching one basin joins it. A pixel touching several first
//!    merges every basin whose peak rises less than `seed_tolerance`
//!    above the current level (plateaus and discretization ripples), then
//!    joins the basin whose seed is nearest, the lowest seed index winning
//!    ties.
//! 4. Basins are renumbered in row-major order of first pixel.
//!
//! Every foreground pixel ends up in exactly one basin, so areas are
//! preserved. A convex object has a single distance maximum and stays a
//! single label.

use imageproc::distance_transform::euclidean_squared_distance_transform;

use crate::label::relabel_sequential;
use crate::types::{BinaryMask, GrayImage, LabelMask};

/// Sentinel for pixels not yet assigned to a basin.
const UNASSIGNED: usize = usize::MAX;

/// 8-neighbourhood offsets.
const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Split touching objects of a binary mask into separate labels.
///
/// An empty mask yields an empty label mask.
#[must_use = "returns the separated label mask"]
pub fn separate(mask: &BinaryMask, seed_tolerance: f64) -> LabelMask {
    let dimensions = mask.dimensions();
    if mask.is_empty() {
        return LabelMask::new(dimensions);
    }
    let width = dimensions.width as usize;
    let height = dimensions.height as usize;
    let foreground = mask.as_slice();
    let distance = distance_map(mask);

    let mut order: Vec<usize> = (0..foreground.len()).filter(|&i| foreground[i]).collect();
    order.sort_by(|&a, &b| distance[b].total_cmp(&distance[a]).then(a.cmp(&b)));

    let mut basin_of = vec![UNASSIGNED; foreground.len()];
    let mut basins = Basins::default();
    let mut roots = Vec::with_capacity(NEIGHBOURS.len());

    for &idx in &order {
        let level = distance[idx];
        let (x, y) = (idx % width, idx / width);

        roots.clear();
        for n in neighbours(x, y, width, height) {
            if basin_of[n] != UNASSIGNED {
                roots.push(basins.find(basin_of[n]));
            }
        }
        roots.sort_unstable();
        roots.dedup();

        basin_of[idx] = match roots.as_slice() {
            [] => basins.seed(level, x, y),
            [only] => *only,
            _ => {
                basins.merge_shallow(&mut roots, level, seed_tolerance);
                basins.nearest(&roots, x, y)
            }
        };
    }

    let mut labels = vec![0u32; foreground.len()];
    for (i, &basin) in basin_of.iter().enumerate() {
        if basin != UNASSIGNED {
            // Root indices are bounded by the pixel count; relabeling
            // below compacts them.
            #[allow(clippy::cast_possible_truncation)]
            let root = basins.find(basin) as u32;
            labels[i] = root + 1;
        }
    }
    let raw = LabelMask::from_raw(dimensions, labels).unwrap_or_else(|_| LabelMask::new(dimensions));
    relabel_sequential(&raw)
}

/// Euclidean distance from each foreground pixel to the nearest
/// background pixel, row-major. Background pixels are 0.
///
/// The mask is padded by one background pixel on every side so objects
/// touching the image border still have a finite distance.
#[must_use]
pub fn distance_map(mask: &BinaryMask) -> Vec<f64> {
    let dimensions = mask.dimensions();
    let padded = GrayImage::from_fn(dimensions.width + 2, dimensions.height + 2, |x, y| {
        let inside = x >= 1 && y >= 1 && mask.get(x - 1, y - 1);
        // The transform measures distance to the nearest non-zero pixel,
        // so background is the non-zero side here.
        image::Luma([if inside { 0 } else { 255 }])
    });
    let squared = euclidean_squared_distance_transform(&padded);

    let mut distance = Vec::with_capacity(dimensions.pixel_count());
    for y in 0..dimensions.height {
        for x in 0..dimensions.width {
            distance.push(squared.get_pixel(x + 1, y + 1).0[0].sqrt());
        }
    }
    distance
}

/// In-bounds 8-neighbours of `(x, y)` as row-major indices.
fn neighbours(x: usize, y: usize, width: usize, height: usize) -> impl Iterator<Item = usize> {
    NEIGHBOURS.iter().filter_map(move |&(dx, dy)| {
        let nx = x.checked_add_signed(dx)?;
        let ny = y.checked_add_signed(dy)?;
        (nx < width && ny < height).then_some(ny * width + nx)
    })
}

/// Union-find over watershed basins.
///
/// Basin indices double as seed insertion order, so the lower index is
/// always the earlier seed.
#[derive(Default)]
struct Basins {
    parent: Vec<usize>,
    peak: Vec<f64>,
    seed: Vec<(usize, usize)>,
}

impl Basins {
    /// Create a new basin seeded at `(x, y)` and return its index.
    fn seed(&mut self, level: f64, x: usize, y: usize) -> usize {
        let index = self.parent.len();
        self.parent.push(index);
        self.peak.push(level);
        self.seed.push((x, y));
        index
    }

    fn find(&mut self, mut basin: usize) -> usize {
        while self.parent[basin] != basin {
            self.parent[basin] = self.parent[self.parent[basin]];
            basin = self.parent[basin];
        }
        basin
    }

    /// Merge every pair of contending basins where the lower peak rises
    /// less than `tolerance` above `level`. The earlier seed survives.
    ///
    /// `roots` is rewritten to the surviving roots, sorted.
    fn merge_shallow(&mut self, roots: &mut Vec<usize>, level: f64, tolerance: f64) {
        loop {
            let mut merged = false;
            'pairs: for i in 0..roots.len() {
                for j in i + 1..roots.len() {
                    let (a, b) = (roots[i], roots[j]);
                    if self.peak[a].min(self.peak[b]) - level < tolerance {
                        self.parent[b] = a;
                        self.peak[a] = self.peak[a].max(self.peak[b]);
                        merged = true;
                        break 'pairs;
                    }
                }
            }
            if !merged {
                return;
            }
            for root in roots.iter_mut() {
                *root = self.find(*root);
            }
            roots.sort_unstable();
            roots.dedup();
        }
    }

    /// The basin in `roots` whose seed is nearest to `(x, y)`; ties go to
    /// the lowest seed index.
    fn nearest(&self, roots: &[usize], x: usize, y: usize) -> usize {
        roots
            .iter()
            .copied()
            .min_by_key(|&root| {
                let (sx, sy) = self.seed[root];
                let dx = sx.abs_diff(x);
                let dy = sy.abs_diff(y);
                (dx * dx + dy * dy, root)
            })
            .unwrap_or(UNASSIGNED)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::label::label_areas;
    use crate::types::Dimensions;

    const TOLERANCE: f64 = 0.5;

    fn fill_rect(mask: &mut BinaryMask, x0: u32, y0: u32, x1: u32, y1: u32) {
        for y in y0..y1 {
            for x in x0..x1 {
                mask.set(x, y, true);
            }
        }
    }

    fn disk(mask: &mut BinaryMask, cx: i64, cy: i64, r: i64) {
        let dims = mask.dimensions();
        for y in 0..i64::from(dims.height) {
            for x in 0..i64::from(dims.width) {
                if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                    mask.set(u32::try_from(x).unwrap(), u32::try_from(y).unwrap(), true);
                }
            }
        }
    }

    fn sorted_areas(labels: &LabelMask) -> Vec<u64> {
        let mut areas: Vec<u64> = label_areas(labels).into_values().collect();
        areas.sort_unstable();
        areas
    }

    #[test]
    fn empty_mask_gives_empty_labels() {
        let mask = BinaryMask::new(Dimensions::new(6, 6));
        let labels = separate(&mask, TOLERANCE);
        assert_eq!(labels.max_label(), 0);
        assert_eq!(labels.dimensions(), Dimensions::new(6, 6));
    }

    #[test]
    fn convex_disk_stays_one_label() {
        let mut mask = BinaryMask::new(Dimensions::new(20, 20));
        disk(&mut mask, 10, 10, 6);
        let labels = separate(&mask, TOLERANCE);
        assert_eq!(labels.object_count(), 1);
        assert_eq!(labels.to_binary(), mask);
    }

    #[test]
    fn even_sided_square_stays_one_label() {
        // A 6x6 square has a 2x2 plateau of maxima.
        let mut mask = BinaryMask::new(Dimensions::new(20, 20));
        fill_rect(&mut mask, 4, 4, 10, 10);
        let labels = separate(&mask, TOLERANCE);
        assert_eq!(labels.object_count(), 1);
        assert_eq!(sorted_areas(&labels), vec![36]);
    }

    #[test]
    fn dumbbell_splits_in_two() {
        let mut mask = BinaryMask::new(Dimensions::new(30, 14));
        disk(&mut mask, 7, 7, 5);
        disk(&mut mask, 22, 7, 5);
        fill_rect(&mut mask, 7, 6, 23, 9);
        let labels = separate(&mask, TOLERANCE);
        assert_eq!(labels.object_count(), 2);
        assert_eq!(labels.get(7, 7), 1);
        assert_eq!(labels.get(22, 7), 2);
        // No pixel is lost at the split line.
        assert_eq!(labels.to_binary(), mask);
    }

    #[test]
    fn touching_squares_split_into_equal_halves() {
        // Two 5x5 squares sharing part of an edge. Fully aligned squares
        // would form a plain 10x5 rectangle with a single ridge.
        let mut mask = BinaryMask::new(Dimensions::new(14, 12));
        fill_rect(&mut mask, 1, 1, 6, 6);
        fill_rect(&mut mask, 6, 3, 11, 8);
        assert_eq!(crate::label::label_components(&mask).object_count(), 1);

        let labels = separate(&mask, TOLERANCE);
        assert_eq!(labels.object_count(), 2);
        assert_eq!(sorted_areas(&labels), vec![25, 25]);
        assert_eq!(labels.get(1, 1), 1);
        assert_eq!(labels.get(10, 7), 2);
    }

    #[test]
    fn separate_objects_keep_row_major_numbering() {
        let mut mask = BinaryMask::new(Dimensions::new(20, 10));
        fill_rect(&mut mask, 12, 1, 15, 4);
        fill_rect(&mut mask, 2, 5, 5, 8);
        let labels = separate(&mask, TOLERANCE);
        assert_eq!(labels.get(12, 1), 1);
        assert_eq!(labels.get(2, 5), 2);
    }

    #[test]
    fn distance_counts_image_border_as_background() {
        let mask = BinaryMask::from_fn(Dimensions::new(3, 3), |_, _| true);
        let distance = distance_map(&mask);
        assert!((distance[4] - 2.0).abs() < 1e-12);
        assert!((distance[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn distance_is_zero_on_background() {
        let mut mask = BinaryMask::new(Dimensions::new(5, 5));
        mask.set(2, 2, true);
        let distance = distance_map(&mask);
        assert!(distance[0].abs() < 1e-12);
        assert!((distance[12] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn nearest_seed_tie_goes_to_lowest_index() {
        let mut basins = Basins::default();
        let a = basins.seed(3.0, 0, 0);
        let b = basins.seed(3.0, 4, 0);
        // (2, 0) is equidistant from both seeds.
        assert_eq!(basins.nearest(&[a, b], 2, 0), a);
        assert_eq!(basins.nearest(&[a, b], 3, 0), b);
    }

    #[test]
    fn shallow_basins_merge_into_earlier_seed() {
        let mut basins = Basins::default();
        let a = basins.seed(3.0, 0, 0);
        let b = basins.seed(2.2, 5, 0);
        let mut roots = vec![a, b];
        basins.merge_shallow(&mut roots, 2.0, TOLERANCE);
        assert_eq!(roots, vec![a]);
        assert_eq!(basins.find(b), a);
    }

    #[test]
    fn deep_basins_stay_separate() {
        let mut basins = Basins::default();
        let a = basins.seed(3.0, 0, 0);
        let b = basins.seed(3.0, 8, 0);
        let mut roots = vec![a, b];
        basins.merge_shallow(&mut roots, 1.0, TOLERANCE);
        assert_eq!(roots, vec![a, b]);
    }
}
