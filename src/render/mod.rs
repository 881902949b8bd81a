//! Offscreen software rasterizer.
//!
//! Renders a hypothesized pose of a model into a depth map, a silhouette
//! mask, and a flat-shaded intensity view for comparison against sensor
//! data. One instance per body/worker; a render call borrows the instance
//! mutably and scratch buffers are reused across frames to stay inside the
//! per-frame budget.

use nalgebra::Vector3;

use crate::camera::Intrinsics;
use crate::error::{Result, TrackError};
use crate::geometry::SE3;
use crate::image::Image;
use crate::model::GeometricModel;

/// Geometry closer than this to the optical center is clipped, meters.
const NEAR_PLANE: f64 = 0.01;

/// Synthetic views of one body at one pose.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    /// Depth in meters; `0.0` where no surface was hit.
    pub depth: Image<f32>,
    /// 255 inside the projected silhouette, 0 outside.
    pub silhouette: Image<u8>,
    /// Flat-shaded Lambertian view.
    pub intensity: Image<u8>,
}

pub struct Renderer {
    intrinsics: Intrinsics,
    out: RenderOutput,
}

impl Renderer {
    pub fn new(intrinsics: Intrinsics) -> Self {
        let (w, h) = (intrinsics.width, intrinsics.height);
        Self {
            intrinsics,
            out: RenderOutput {
                depth: Image::new(w, h, 0.0),
                silhouette: Image::new(w, h, 0),
                intensity: Image::new(w, h, 0),
            },
        }
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    pub fn output(&self) -> &RenderOutput {
        &self.out
    }

    /// Render `model` at `pose` (body to camera) into the internal buffers.
    pub fn render(&mut self, model: &GeometricModel, pose: &SE3) -> Result<&RenderOutput> {
        if model.triangles().is_empty() {
            return Err(TrackError::ModelNotLoaded {
                body: model.name().to_string(),
            });
        }

        self.out.depth.fill(0.0);
        self.out.silhouette.fill(0);
        self.out.intensity.fill(0);

        // Vertices into the camera frame once per call.
        let cam_verts: Vec<Vector3<f64>> = model
            .vertices()
            .iter()
            .map(|v| pose.transform_point(v))
            .collect();

        for (tri_idx, &[ia, ib, ic]) in model.triangles().iter().enumerate() {
            let (a, b, c) = (
                cam_verts[ia as usize],
                cam_verts[ib as usize],
                cam_verts[ic as usize],
            );
            if a.z < NEAR_PLANE || b.z < NEAR_PLANE || c.z < NEAR_PLANE {
                continue;
            }

            // Backface cull against the view ray through the centroid.
            let normal_cam = pose.rotate(&model.triangle_normals()[tri_idx]);
            let centroid = (a + b + c) / 3.0;
            if normal_cam.dot(&centroid) >= 0.0 {
                continue;
            }
            let shade = {
                let lambert = (-normal_cam.dot(&centroid.normalize())).max(0.0);
                (40.0 + 215.0 * lambert) as u8
            };

            let (Some(pa), Some(pb), Some(pc)) = (
                self.intrinsics.project(&a),
                self.intrinsics.project(&b),
                self.intrinsics.project(&c),
            ) else {
                continue;
            };

            rasterize_triangle(
                &mut self.out,
                (pa, a.z),
                (pb, b.z),
                (pc, c.z),
                shade,
            );
        }

        Ok(&self.out)
    }

    /// Rasterize only the depth of `model` at `pose` into `target`,
    /// keeping the nearer surface per pixel. Used to build occlusion maps
    /// over several bodies.
    pub fn render_depth_min(
        &mut self,
        model: &GeometricModel,
        pose: &SE3,
        target: &mut Image<f32>,
    ) -> Result<()> {
        self.render(model, pose)?;
        for y in 0..target.height() {
            for x in 0..target.width() {
                let d = self.out.depth.get(x, y);
                if d > 0.0 {
                    let existing = target.get(x, y);
                    if existing == 0.0 || d < existing {
                        target.set(x, y, d);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Fill one projected triangle with z-buffering.
fn rasterize_triangle(
    out: &mut RenderOutput,
    (pa, za): ((f64, f64), f64),
    (pb, zb): ((f64, f64), f64),
    (pc, zc): ((f64, f64), f64),
    shade: u8,
) {
    let (w, h) = (out.depth.width() as isize, out.depth.height() as isize);

    let area = (pb.0 - pa.0) * (pc.1 - pa.1) - (pb.1 - pa.1) * (pc.0 - pa.0);
    if area.abs() < 1e-12 {
        return;
    }

    let min_x = pa.0.min(pb.0).min(pc.0).floor().max(0.0) as isize;
    let max_x = pa.0.max(pb.0).max(pc.0).ceil().min((w - 1) as f64) as isize;
    let min_y = pa.1.min(pb.1).min(pc.1).floor().max(0.0) as isize;
    let max_y = pa.1.max(pb.1).max(pc.1).ceil().min((h - 1) as f64) as isize;
    if min_x > max_x || min_y > max_y {
        return;
    }

    // Screen-space linear interpolation of inverse depth.
    let (wa, wb, wc) = (1.0 / za, 1.0 / zb, 1.0 / zc);

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let (px, py) = (x as f64, y as f64);
            let l0 = ((pb.0 - px) * (pc.1 - py) - (pb.1 - py) * (pc.0 - px)) / area;
            let l1 = ((pc.0 - px) * (pa.1 - py) - (pc.1 - py) * (pa.0 - px)) / area;
            let l2 = 1.0 - l0 - l1;
            if l0 < 0.0 || l1 < 0.0 || l2 < 0.0 {
                continue;
            }

            let z = 1.0 / (l0 * wa + l1 * wb + l2 * wc);
            let (xu, yu) = (x as usize, y as usize);
            let existing = out.depth.get(xu, yu);
            if existing == 0.0 || (z as f32) < existing {
                out.depth.set(xu, yu, z as f32);
                out.silhouette.set(xu, yu, 255);
                out.intensity.set(xu, yu, shade);
            }
        }
    }
}

/// Camera-space surface normal at a depth-map pixel, from central
/// differences of back-projected neighbors. Oriented toward the camera.
/// Returns `None` at depth discontinuities or missing measurements.
pub fn depth_normal(
    depth: &Image<f32>,
    intrinsics: &Intrinsics,
    x: usize,
    y: usize,
) -> Option<Vector3<f64>> {
    let (xi, yi) = (x as isize, y as isize);
    let center = depth.at(xi, yi).filter(|&d| d > 0.0)? as f64;
    let left = depth.at(xi - 1, yi).filter(|&d| d > 0.0)? as f64;
    let right = depth.at(xi + 1, yi).filter(|&d| d > 0.0)? as f64;
    let up = depth.at(xi, yi - 1).filter(|&d| d > 0.0)? as f64;
    let down = depth.at(xi, yi + 1).filter(|&d| d > 0.0)? as f64;

    // Reject discontinuities: neighbors must belong to the same surface.
    let max_jump = 0.05 * center;
    if (left - right).abs() > max_jump || (up - down).abs() > max_jump {
        return None;
    }

    let px = x as f64;
    let py = y as f64;
    let dx = intrinsics.unproject(px + 1.0, py, right) - intrinsics.unproject(px - 1.0, py, left);
    let dy = intrinsics.unproject(px, py + 1.0, down) - intrinsics.unproject(px, py - 1.0, up);

    let n = dx.cross(&dy);
    let len = n.norm();
    if len < 1e-12 {
        return None;
    }
    let n = n / len;

    // Visible surfaces face the camera at the origin.
    let p = intrinsics.unproject(px, py, center);
    Some(if n.dot(&p) < 0.0 { n } else { -n })
}
