//! Sparse image features: FAST corners, binary intensity-comparison
//! descriptors, and Hamming matching with a ratio test.
//!
//! Used by the texture modality and the feature-based detector on
//! texture-rich surfaces.

use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::image::Image;

/// Bresenham circle of radius 3: 16 (dx, dy) offsets, clockwise from
/// 12 o'clock.
#[rustfmt::skip]
const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    ( 0, -3), ( 1, -3), ( 2, -2), ( 3, -1),
    ( 3,  0), ( 3,  1), ( 2,  2), ( 1,  3),
    ( 0,  3), (-1,  3), (-2,  2), (-3,  1),
    (-3,  0), (-3, -1), (-2, -2), (-1, -3),
];

/// Contiguous arc length for FAST-9.
const ARC_LENGTH: usize = 9;

/// Descriptor patch half size; keypoints closer to the border are skipped.
const PATCH_RADIUS: isize = 15;

/// Max descriptor distance for acceptance (of 256 bits).
pub const MAX_HAMMING: u32 = 80;
/// Ratio test threshold (best/second best).
pub const NN_RATIO: f32 = 0.8;

#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

/// Keypoints with aligned descriptors.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureConfig {
    /// FAST intensity threshold.
    pub threshold: u8,
    /// Non-maximum suppression radius in pixels.
    pub nms_radius: usize,
    /// Cap on returned features (strongest first).
    pub max_features: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            threshold: 25,
            nms_radius: 7,
            max_features: 400,
        }
    }
}

/// FAST-9 corner detection followed by grid non-maximum suppression and
/// descriptor extraction.
pub fn detect_and_describe(gray: &Image<u8>, cfg: &FeatureConfig) -> FeatureSet {
    let mut corners = detect_corners(gray, cfg.threshold);
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));

    // Occupancy-grid suppression: strongest corner claims its cell
    // neighborhood.
    let cell = cfg.nms_radius.max(1);
    let grid_w = gray.width() / cell + 2;
    let grid_h = gray.height() / cell + 2;
    let mut occupied = vec![false; grid_w * grid_h];
    let mut set = FeatureSet::default();

    for kp in corners {
        if set.len() >= cfg.max_features {
            break;
        }
        let gx = kp.x as usize / cell;
        let gy = kp.y as usize / cell;
        if occupied[gy * grid_w + gx] {
            continue;
        }
        let Some(desc) = describe(gray, &kp) else {
            continue;
        };
        for dy in gy.saturating_sub(1)..=(gy + 1).min(grid_h - 1) {
            for dx in gx.saturating_sub(1)..=(gx + 1).min(grid_w - 1) {
                occupied[dy * grid_w + dx] = true;
            }
        }
        set.keypoints.push(kp);
        set.descriptors.push(desc);
    }
    set
}

fn detect_corners(gray: &Image<u8>, threshold: u8) -> Vec<Keypoint> {
    let mut corners = Vec::new();
    let t = threshold as i32;

    for y in 3..gray.height().saturating_sub(3) {
        for x in 3..gray.width().saturating_sub(3) {
            let center = gray.get(x, y) as i32;

            // Classify the 16 circle pixels: +1 brighter, -1 darker, 0.
            let mut classes = [0i8; 32];
            for (i, &(dx, dy)) in CIRCLE_OFFSETS.iter().enumerate() {
                let p = gray.get((x as isize + dx) as usize, (y as isize + dy) as usize) as i32;
                classes[i] = if p >= center + t {
                    1
                } else if p <= center - t {
                    -1
                } else {
                    0
                };
                classes[i + 16] = classes[i];
            }

            // Wrap-around run search over the doubled array.
            let mut run = 0usize;
            let mut run_class = 0i8;
            let mut is_corner = false;
            for &c in &classes {
                if c != 0 && c == run_class {
                    run += 1;
                } else {
                    run_class = c;
                    run = usize::from(c != 0);
                }
                if c != 0 && run >= ARC_LENGTH {
                    is_corner = true;
                    break;
                }
            }
            if !is_corner {
                continue;
            }

            let score: i32 = CIRCLE_OFFSETS
                .iter()
                .map(|&(dx, dy)| {
                    let p =
                        gray.get((x as isize + dx) as usize, (y as isize + dy) as usize) as i32;
                    ((p - center).abs() - t).max(0)
                })
                .sum();

            corners.push(Keypoint {
                x: x as f32,
                y: y as f32,
                score: score as f32,
            });
        }
    }
    corners
}

/// Fixed comparison pattern: 256 point pairs inside the patch, generated
/// once from a seeded RNG so descriptors are stable across runs.
fn comparison_pattern() -> &'static [(i8, i8, i8, i8)] {
    static PATTERN: OnceLock<Vec<(i8, i8, i8, i8)>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let r = PATCH_RADIUS as i32;
        (0..256)
            .map(|_| {
                (
                    rng.gen_range(-r..=r) as i8,
                    rng.gen_range(-r..=r) as i8,
                    rng.gen_range(-r..=r) as i8,
                    rng.gen_range(-r..=r) as i8,
                )
            })
            .collect()
    })
}

/// Binary descriptor at a keypoint; `None` when the patch leaves the image.
pub fn describe(gray: &Image<u8>, kp: &Keypoint) -> Option<Descriptor> {
    let (x, y) = (kp.x as isize, kp.y as isize);
    if !gray.in_bounds(x - PATCH_RADIUS, y - PATCH_RADIUS)
        || !gray.in_bounds(x + PATCH_RADIUS, y + PATCH_RADIUS)
    {
        return None;
    }

    let mut bits = [0u8; 32];
    for (i, &(ax, ay, bx, by)) in comparison_pattern().iter().enumerate() {
        let pa = gray.get((x + ax as isize) as usize, (y + ay as isize) as usize);
        let pb = gray.get((x + bx as isize) as usize, (y + by as isize) as usize);
        if pa < pb {
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    Some(Descriptor(bits))
}

/// Number of differing bits between two descriptors.
#[inline]
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Nearest-neighbor matching with a ratio test.
///
/// Returns `(query_idx, train_idx)` pairs where the best match is within
/// `max_distance` and beats the second best by the ratio margin.
pub fn match_descriptors(
    query: &[Descriptor],
    train: &[Descriptor],
    max_distance: u32,
    ratio: f32,
) -> Vec<(usize, usize)> {
    let mut matches = Vec::new();
    for (qi, q) in query.iter().enumerate() {
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        let mut best_idx = None;
        for (ti, t) in train.iter().enumerate() {
            let d = hamming(q, t);
            if d < best {
                second = best;
                best = d;
                best_idx = Some(ti);
            } else if d < second {
                second = d;
            }
        }
        if best > max_distance {
            continue;
        }
        if second != u32::MAX && best as f32 > ratio * second as f32 {
            continue;
        }
        if let Some(ti) = best_idx {
            matches.push((qi, ti));
        }
    }
    matches
}
