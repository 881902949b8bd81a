//! Region modality: silhouette boundary correspondences.
//!
//! Samples the rendered silhouette contour, searches along the contour
//! normal in the observed color image for the foreground/background step,
//! and turns the signed 1D offsets into a pose-update contribution. The
//! foreground/background color statistics are coarse RGB histograms kept
//! up to date with exponential forgetting.

use nalgebra::Vector2;
use serde::Deserialize;

use super::{sample_occluded, point_jacobian, projection_jacobian, ModalityInput, NormalEquations};
use crate::image::Image;
use crate::model::Body;

/// Histogram resolution: 16 bins per RGB channel.
const BINS_PER_CHANNEL: usize = 16;
const BIN_SHIFT: u32 = 4;
const HISTOGRAM_SIZE: usize = BINS_PER_CHANNEL * BINS_PER_CHANNEL * BINS_PER_CHANNEL;

/// Offsets (from the contour, along the normal) of the bands used to
/// update the color statistics.
const FG_BAND: std::ops::Range<isize> = -8..-3;
const BG_BAND: std::ops::Range<isize> = 4..9;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Contour points sampled per iteration.
    pub n_samples: usize,
    /// 1D search length along the normal, pixels each way.
    pub search_radius: usize,
    /// Below this many valid correspondences the contribution is zero.
    pub min_valid: usize,
    /// Exponential forgetting factor for the color histograms.
    pub learning_rate: f64,
    /// Minimum posterior drop that counts as a boundary.
    pub min_posterior_step: f64,
    /// Depth margin for occlusion tests, meters.
    pub occlusion_margin: f64,
    /// Huber threshold on the 1D residual, pixels.
    pub huber_px: f64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            n_samples: 200,
            search_radius: 12,
            min_valid: 10,
            learning_rate: 0.2,
            min_posterior_step: 0.15,
            occlusion_margin: 0.02,
            huber_px: 4.0,
        }
    }
}

pub struct RegionModality {
    cfg: RegionConfig,
    fg_hist: Vec<f64>,
    bg_hist: Vec<f64>,
    initialized: bool,
}

/// A contour pixel with its outward 2D normal.
struct ContourPoint {
    x: usize,
    y: usize,
    normal: Vector2<f64>,
}

impl RegionModality {
    pub fn new(cfg: RegionConfig) -> Self {
        Self {
            cfg,
            fg_hist: vec![0.0; HISTOGRAM_SIZE],
            bg_hist: vec![0.0; HISTOGRAM_SIZE],
            initialized: false,
        }
    }

    pub fn contribute(&mut self, body: &Body, input: &ModalityInput) -> NormalEquations {
        let contour = extract_contour(&input.render.silhouette);
        if contour.is_empty() {
            return NormalEquations::zero();
        }

        // Statistics follow the final pose of the previous pass: refresh
        // once per pass, not per iteration.
        if input.iteration == 0 {
            self.update_histograms(&contour, &input.frame.color);
        }

        let step = (contour.len() / self.cfg.n_samples.max(1)).max(1);
        let radius = self.cfg.search_radius as isize;
        let mut ne = NormalEquations::zero();

        for point in contour.iter().step_by(step) {
            let rendered = input.render.depth.get(point.x, point.y) as f64;
            if rendered <= 0.0 {
                continue;
            }
            if sample_occluded(
                body,
                input,
                point.x,
                point.y,
                rendered,
                self.cfg.occlusion_margin,
            ) {
                continue;
            }

            // Foreground posterior profile along the outward normal.
            // Samples leaving the image drop the whole correspondence.
            let mut posterior = Vec::with_capacity((2 * radius + 1) as usize);
            let mut in_bounds = true;
            for s in -radius..=radius {
                let px = point.x as f64 + s as f64 * point.normal.x;
                let py = point.y as f64 + s as f64 * point.normal.y;
                match input.frame.color.at(px.round() as isize, py.round() as isize) {
                    Some(color) => posterior.push(self.foreground_posterior(color)),
                    None => {
                        in_bounds = false;
                        break;
                    }
                }
            }
            if !in_bounds {
                continue;
            }

            // Strongest fg -> bg transition marks the observed boundary.
            // The boundary is the last foreground pixel, matching how the
            // rendered contour itself is defined; at an aligned pose the
            // offset is exactly zero.
            let mut best_step = 0.0;
            let mut best_idx = 0usize;
            for k in 0..posterior.len() - 1 {
                let drop = posterior[k] - posterior[k + 1];
                if drop > best_step {
                    best_step = drop;
                    best_idx = k;
                }
            }
            if best_step < self.cfg.min_posterior_step {
                continue;
            }
            let observed_offset = best_idx as f64 - radius as f64;

            let p_cam = input.intrinsics.unproject(point.x as f64, point.y as f64, rendered);
            let j_uv = projection_jacobian(input.intrinsics, &p_cam) * point_jacobian(&p_cam);
            let j = (point.normal.transpose() * j_uv).transpose();

            let r = -observed_offset;
            let w = if r.abs() <= self.cfg.huber_px {
                1.0
            } else {
                self.cfg.huber_px / r.abs()
            };
            ne.add_1d(&j, r, w);
        }

        if ne.count < self.cfg.min_valid {
            return NormalEquations::zero();
        }
        ne
    }

    fn foreground_posterior(&self, color: [u8; 3]) -> f64 {
        let b = bin_index(color);
        let fg = self.fg_hist[b];
        let bg = self.bg_hist[b];
        if fg + bg < 1e-12 {
            0.5
        } else {
            fg / (fg + bg)
        }
    }

    /// Blend fresh color statistics from bands on either side of the
    /// contour into the running histograms.
    fn update_histograms(&mut self, contour: &[ContourPoint], color: &Image<[u8; 3]>) {
        let mut fg = vec![0.0f64; HISTOGRAM_SIZE];
        let mut bg = vec![0.0f64; HISTOGRAM_SIZE];
        let (mut n_fg, mut n_bg) = (0.0f64, 0.0f64);

        for point in contour {
            for s in FG_BAND {
                let px = point.x as f64 + s as f64 * point.normal.x;
                let py = point.y as f64 + s as f64 * point.normal.y;
                if let Some(c) = color.at(px.round() as isize, py.round() as isize) {
                    fg[bin_index(c)] += 1.0;
                    n_fg += 1.0;
                }
            }
            for s in BG_BAND {
                let px = point.x as f64 + s as f64 * point.normal.x;
                let py = point.y as f64 + s as f64 * point.normal.y;
                if let Some(c) = color.at(px.round() as isize, py.round() as isize) {
                    bg[bin_index(c)] += 1.0;
                    n_bg += 1.0;
                }
            }
        }
        if n_fg < 1.0 || n_bg < 1.0 {
            return;
        }
        for v in fg.iter_mut() {
            *v /= n_fg;
        }
        for v in bg.iter_mut() {
            *v /= n_bg;
        }

        let lr = if self.initialized {
            self.cfg.learning_rate
        } else {
            1.0
        };
        for i in 0..HISTOGRAM_SIZE {
            self.fg_hist[i] = (1.0 - lr) * self.fg_hist[i] + lr * fg[i];
            self.bg_hist[i] = (1.0 - lr) * self.bg_hist[i] + lr * bg[i];
        }
        self.initialized = true;
    }
}

#[inline]
fn bin_index([r, g, b]: [u8; 3]) -> usize {
    let (r, g, b) = (
        (r >> BIN_SHIFT) as usize,
        (g >> BIN_SHIFT) as usize,
        (b >> BIN_SHIFT) as usize,
    );
    (r * BINS_PER_CHANNEL + g) * BINS_PER_CHANNEL + b
}

/// Silhouette pixels with at least one background 4-neighbor, with outward
/// normals from the mask gradient. Pixels at the image border count as
/// contour; their correspondences die in the out-of-bounds check later.
fn extract_contour(silhouette: &Image<u8>) -> Vec<ContourPoint> {
    let mut contour = Vec::new();
    let (w, h) = (silhouette.width(), silhouette.height());

    for y in 0..h {
        for x in 0..w {
            if silhouette.get(x, y) == 0 {
                continue;
            }
            let (xi, yi) = (x as isize, y as isize);
            let neighbors = [
                silhouette.at(xi - 1, yi).unwrap_or(0),
                silhouette.at(xi + 1, yi).unwrap_or(0),
                silhouette.at(xi, yi - 1).unwrap_or(0),
                silhouette.at(xi, yi + 1).unwrap_or(0),
            ];
            if neighbors.iter().all(|&n| n != 0) {
                continue;
            }

            // Mask gradient points into the object; outward is its negation.
            let gx = neighbors[1] as f64 - neighbors[0] as f64;
            let gy = neighbors[3] as f64 - neighbors[2] as f64;
            let g = Vector2::new(-gx, -gy);
            let norm = g.norm();
            if norm < 1e-9 {
                continue;
            }
            contour.push(ContourPoint {
                x,
                y,
                normal: g / norm,
            });
        }
    }
    contour
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn contour_of_a_filled_square() {
        let mut mask = Image::new(20, 20, 0u8);
        for y in 5..15 {
            for x in 5..15 {
                mask.set(x, y, 255);
            }
        }
        let contour = extract_contour(&mask);

        // 10x10 square: the border ring is 36 pixels.
        assert_eq!(contour.len(), 36);

        // Left-edge normals point left.
        let left = contour
            .iter()
            .find(|p| p.x == 5 && p.y == 10)
            .expect("left edge pixel");
        assert_relative_eq!(left.normal.x, -1.0, epsilon = 1e-12);
        assert_relative_eq!(left.normal.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn bin_index_is_dense_and_in_range() {
        assert_eq!(bin_index([0, 0, 0]), 0);
        assert_eq!(bin_index([255, 255, 255]), HISTOGRAM_SIZE - 1);
    }

    #[test]
    fn interior_pixels_are_not_contour() {
        let mut mask = Image::new(10, 10, 0u8);
        for y in 2..8 {
            for x in 2..8 {
                mask.set(x, y, 255);
            }
        }
        let contour = extract_contour(&mask);

        assert!(!contour.iter().any(|p| p.x == 5 && p.y == 5));
    }
}
