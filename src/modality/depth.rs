//! Depth modality: point-to-plane correspondences between the rendered
//! and the sensed depth map.

use nalgebra::{Vector3, Vector6};
use serde::Deserialize;

use super::{sample_occluded, ModalityInput, NormalEquations};
use crate::model::Body;
use crate::render::depth_normal;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Pixel stride of the sample grid over the rendered depth map.
    pub stride: usize,
    /// Below this many valid correspondences the contribution is zero.
    pub min_valid: usize,
    /// Correspondences farther apart than this are rejected, meters.
    pub max_distance: f64,
    /// Depth margin for occlusion tests, meters.
    pub occlusion_margin: f64,
    /// Huber threshold on the point-to-plane residual, meters.
    pub huber_m: f64,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            stride: 6,
            min_valid: 10,
            max_distance: 0.05,
            occlusion_margin: 0.02,
            huber_m: 0.01,
        }
    }
}

pub struct DepthModality {
    cfg: DepthConfig,
}

impl DepthModality {
    pub fn new(cfg: DepthConfig) -> Self {
        Self { cfg }
    }

    pub fn contribute(&mut self, body: &Body, input: &ModalityInput) -> NormalEquations {
        // Requires a depth-capable camera; validated at setup, but a frame
        // without depth still degrades to a zero contribution.
        let Some(sensed) = &input.frame.depth else {
            return NormalEquations::zero();
        };

        let rendered = &input.render.depth;
        let stride = self.cfg.stride.max(1);
        let mut ne = NormalEquations::zero();

        for y in (stride..rendered.height().saturating_sub(stride)).step_by(stride) {
            for x in (stride..rendered.width().saturating_sub(stride)).step_by(stride) {
                let d_r = rendered.get(x, y) as f64;
                if d_r <= 0.0 {
                    continue;
                }
                let d_s = sensed.get(x, y) as f64;
                if d_s <= 0.0 {
                    continue;
                }
                if sample_occluded(body, input, x, y, d_r, self.cfg.occlusion_margin) {
                    continue;
                }
                let Some(n) = depth_normal(rendered, input.intrinsics, x, y) else {
                    continue;
                };

                let p_r = input.intrinsics.unproject(x as f64, y as f64, d_r);
                let p_s = input.intrinsics.unproject(x as f64, y as f64, d_s);
                if (p_s - p_r).norm() > self.cfg.max_distance {
                    continue;
                }

                let r = n.dot(&(p_r - p_s));
                let j = point_to_plane_jacobian(&p_r, &n);
                let w = if r.abs() <= self.cfg.huber_m {
                    1.0
                } else {
                    self.cfg.huber_m / r.abs()
                };
                ne.add_1d(&j, r, w);
            }
        }

        if ne.count < self.cfg.min_valid {
            return NormalEquations::zero();
        }
        ne
    }
}

/// Jacobian of `n · p(ξ)` for a left twist perturbation: `[(p × n)ᵀ  nᵀ]`.
#[inline]
fn point_to_plane_jacobian(p: &Vector3<f64>, n: &Vector3<f64>) -> Vector6<f64> {
    let rot = p.cross(n);
    Vector6::new(rot.x, rot.y, rot.z, n.x, n.y, n.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Frame, Intrinsics};
    use crate::geometry::SE3;
    use crate::image::Image;
    use crate::model::mesh::cuboid;
    use crate::model::{GeometricModel, ModalityToggles};
    use crate::render::Renderer;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 160.0,
            cy: 120.0,
            width: 320,
            height: 240,
        }
    }

    fn depth_body() -> crate::model::Body {
        let (verts, tris) = cuboid(0.1, 0.1, 0.1);
        let model = GeometricModel::from_mesh("box", &verts, &tris, 1.0).unwrap();
        let toggles = ModalityToggles {
            use_region: false,
            use_depth: true,
            ..ModalityToggles::default()
        };
        let mut body = crate::model::Body::new("box", model, toggles);
        body.pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 0.5),
        };
        body
    }

    #[test]
    fn round_trip_residual_is_near_zero() {
        let body = depth_body();
        let intr = intrinsics();
        let mut renderer = Renderer::new(intr);
        let out = renderer.render(body.model(), &body.pose).unwrap().clone();

        // Sensed depth generated at the same pose.
        let frame = Frame {
            color: Image::new(intr.width, intr.height, [0u8; 3]),
            depth: Some(out.depth.clone()),
            timestamp_ns: 0,
        };
        let input = ModalityInput {
            frame: &frame,
            render: &out,
            intrinsics: &intr,
            occlusion: None,
            iteration: 0,
        };

        let mut modality = DepthModality::new(DepthConfig::default());
        let ne = modality.contribute(&body, &input);

        assert!(ne.count >= DepthConfig::default().min_valid);
        assert_relative_eq!(ne.mean_squared_error(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn all_invalid_depth_yields_zero_contribution() {
        let body = depth_body();
        let intr = intrinsics();
        let mut renderer = Renderer::new(intr);
        let out = renderer.render(body.model(), &body.pose).unwrap().clone();

        // Sensor reports no measurement anywhere.
        let frame = Frame {
            color: Image::new(intr.width, intr.height, [0u8; 3]),
            depth: Some(Image::new(intr.width, intr.height, 0.0f32)),
            timestamp_ns: 0,
        };
        let input = ModalityInput {
            frame: &frame,
            render: &out,
            intrinsics: &intr,
            occlusion: None,
            iteration: 0,
        };

        let mut modality = DepthModality::new(DepthConfig::default());
        let ne = modality.contribute(&body, &input);

        assert_eq!(ne.count, 0);
        assert!(ne.jtr.iter().all(|v| v.is_finite()));
        assert_eq!(ne.mean_squared_error(), 0.0);
    }

    #[test]
    fn missing_depth_image_is_a_no_op() {
        let body = depth_body();
        let intr = intrinsics();
        let mut renderer = Renderer::new(intr);
        let out = renderer.render(body.model(), &body.pose).unwrap().clone();

        let frame = Frame {
            color: Image::new(intr.width, intr.height, [0u8; 3]),
            depth: None,
            timestamp_ns: 0,
        };
        let input = ModalityInput {
            frame: &frame,
            render: &out,
            intrinsics: &intr,
            occlusion: None,
            iteration: 0,
        };

        let mut modality = DepthModality::new(DepthConfig::default());
        assert_eq!(modality.contribute(&body, &input).count, 0);
    }

    #[test]
    fn translated_sensor_data_pulls_along_the_normal() {
        let body = depth_body();
        let intr = intrinsics();
        let mut renderer = Renderer::new(intr);
        let out = renderer.render(body.model(), &body.pose).unwrap().clone();

        // Sensed surface 5 mm farther away than rendered.
        let mut shifted = SE3::identity();
        shifted.translation = Vector3::new(0.0, 0.0, 0.505);
        let sensed = renderer.render(body.model(), &shifted).unwrap().clone();

        let frame = Frame {
            color: Image::new(intr.width, intr.height, [0u8; 3]),
            depth: Some(sensed.depth),
            timestamp_ns: 0,
        };
        let input = ModalityInput {
            frame: &frame,
            render: &out,
            intrinsics: &intr,
            occlusion: None,
            iteration: 0,
        };

        let mut modality = DepthModality::new(DepthConfig::default());
        let ne = modality.contribute(&body, &input);
        assert!(ne.count > 0);

        // Gradient must push the pose toward +z. With residual
        // r = n·(p_r - p_s) < 0 on the front face (n = -z), the normal
        // equations' right side carries a nonzero z-translation component.
        assert!(ne.jtr[5].abs() > 1e-6);
    }
}
