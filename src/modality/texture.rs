//! Texture modality: sparse keypoint reprojection residuals for
//! texture-rich surfaces.
//!
//! Keeps a per-body keyframe (descriptors + body-frame landmarks) per
//! viewpoint bucket and matches it against the current frame. Objects with
//! too little texture simply contribute nothing.

use nalgebra::{Vector2, Vector3};
use serde::Deserialize;

use super::{point_jacobian, projection_jacobian, ModalityInput, NormalEquations};
use crate::features::{
    detect_and_describe, match_descriptors, Descriptor, FeatureConfig, FeatureSet, MAX_HAMMING,
    NN_RATIO,
};
use crate::image::luma;
use crate::model::Body;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TextureConfig {
    /// FAST threshold for corner detection.
    pub fast_threshold: u8,
    /// Cap on features per frame.
    pub max_features: usize,
    /// Below this many matches the modality silently no-ops.
    pub min_matches: usize,
    /// Max descriptor Hamming distance.
    pub max_hamming: u32,
    /// Ratio test threshold (best/second best).
    pub nn_ratio: f32,
    /// Huber threshold on the reprojection residual, pixels.
    pub huber_px: f64,
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 25,
            max_features: 400,
            min_matches: 8,
            max_hamming: MAX_HAMMING,
            nn_ratio: NN_RATIO,
            huber_px: 4.0,
        }
    }
}

/// Reference appearance captured at a converged pose.
struct Keyframe {
    template_idx: usize,
    descriptors: Vec<Descriptor>,
    points_body: Vec<Vector3<f64>>,
}

/// Current-frame features, cached across the iterations of one pass.
struct CachedFeatures {
    timestamp_ns: u64,
    set: FeatureSet,
}

pub struct TextureModality {
    cfg: TextureConfig,
    keyframe: Option<Keyframe>,
    cached: Option<CachedFeatures>,
}

impl TextureModality {
    pub fn new(cfg: TextureConfig) -> Self {
        Self {
            cfg,
            keyframe: None,
            cached: None,
        }
    }

    pub fn contribute(&mut self, body: &Body, input: &ModalityInput) -> NormalEquations {
        self.refresh_features(input);
        let bucket = body.model().closest_template(&body.view_direction());

        // Capture or refresh the keyframe when the viewpoint bucket drifts.
        // Only between passes; mid-pass the reference must stay fixed.
        let needs_keyframe = self
            .keyframe
            .as_ref()
            .map_or(true, |kf| kf.template_idx != bucket);
        if needs_keyframe && input.iteration == 0 {
            self.keyframe = self.capture_keyframe(body, input, bucket);
        }

        let Some(keyframe) = &self.keyframe else {
            return NormalEquations::zero();
        };
        let Some(cached) = &self.cached else {
            return NormalEquations::zero();
        };

        let matches = match_descriptors(
            &keyframe.descriptors,
            &cached.set.descriptors,
            self.cfg.max_hamming,
            self.cfg.nn_ratio,
        );
        if matches.len() < self.cfg.min_matches {
            return NormalEquations::zero();
        }

        let mut ne = NormalEquations::zero();
        for (ki, ti) in matches {
            let p_cam = body.pose.transform_point(&keyframe.points_body[ki]);
            let Some((u, v)) = input.intrinsics.project(&p_cam) else {
                continue;
            };
            if !input.intrinsics.contains(u, v) {
                continue;
            }
            let kp = cached.set.keypoints[ti];
            let r = Vector2::new(u - kp.x as f64, v - kp.y as f64);

            let j = projection_jacobian(input.intrinsics, &p_cam) * point_jacobian(&p_cam);
            let norm = r.norm();
            let w = if norm <= self.cfg.huber_px {
                1.0
            } else {
                self.cfg.huber_px / norm
            };
            ne.add_2d(&j, &r, w);
        }

        if ne.count < self.cfg.min_matches {
            return NormalEquations::zero();
        }
        ne
    }

    fn refresh_features(&mut self, input: &ModalityInput) {
        let ts = input.frame.timestamp_ns;
        if self.cached.as_ref().is_some_and(|c| c.timestamp_ns == ts) {
            return;
        }
        let gray = luma(&input.frame.color);
        let cfg = FeatureConfig {
            threshold: self.cfg.fast_threshold,
            max_features: self.cfg.max_features,
            ..FeatureConfig::default()
        };
        self.cached = Some(CachedFeatures {
            timestamp_ns: ts,
            set: detect_and_describe(&gray, &cfg),
        });
    }

    /// Lift current-frame keypoints that land on the rendered surface into
    /// the body frame. Returns `None` for texture-poor views.
    fn capture_keyframe(
        &self,
        body: &Body,
        input: &ModalityInput,
        bucket: usize,
    ) -> Option<Keyframe> {
        let cached = self.cached.as_ref()?;
        let cam_to_body = body.pose.inverse();

        let mut descriptors = Vec::new();
        let mut points_body = Vec::new();
        for (kp, desc) in cached.set.keypoints.iter().zip(&cached.set.descriptors) {
            let (x, y) = (kp.x.round() as isize, kp.y.round() as isize);
            let Some(depth) = input.render.depth.at(x, y).filter(|&d| d > 0.0) else {
                continue;
            };
            let p_cam = input
                .intrinsics
                .unproject(kp.x as f64, kp.y as f64, depth as f64);
            descriptors.push(*desc);
            points_body.push(cam_to_body.transform_point(&p_cam));
        }

        if descriptors.len() < self.cfg.min_matches {
            return None;
        }
        Some(Keyframe {
            template_idx: bucket,
            descriptors,
            points_body,
        })
    }
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
    use nalgebra::UnitQuaternion;

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

    fn textured_body() -> crate::model::Body {
        let (verts, tris) = cuboid(0.12, 0.12, 0.12);
        let model = GeometricModel::from_mesh("box", &verts, &tris, 1.0).unwrap();
        let toggles = ModalityToggles {
            use_region: false,
            use_texture: true,
            ..ModalityToggles::default()
        };
        let mut body = crate::model::Body::new("box", model, toggles);
        body.pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 0.5),
        };
        body
    }

    /// Non-repeating texture: random intensity per 8x8 block, so every
    /// descriptor neighborhood is distinctive.
    fn textured_frame(ts: u64) -> Frame {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let blocks: Vec<u8> = (0..40 * 30).map(|_| rng.gen_range(30..230)).collect();
        let mut color = Image::new(320, 240, [0u8; 3]);
        for y in 0..240usize {
            for x in 0..320usize {
                let v = blocks[(y / 8) * 40 + x / 8];
                color.set(x, y, [v, v, v]);
            }
        }
        Frame {
            color,
            depth: None,
            timestamp_ns: ts,
        }
    }

    #[test]
    fn textured_view_at_captured_pose_has_small_residuals() {
        let body = textured_body();
        let intr = intrinsics();
        let mut renderer = Renderer::new(intr);
        let out = renderer.render(body.model(), &body.pose).unwrap().clone();
        let frame = textured_frame(1);

        let mut modality = TextureModality::new(TextureConfig::default());
        let input = ModalityInput {
            frame: &frame,
            render: &out,
            intrinsics: &intr,
            occlusion: None,
            iteration: 0,
        };

        // First pass captures the keyframe from this very frame, so every
        // match reprojects onto itself.
        let ne = modality.contribute(&body, &input);
        if ne.count > 0 {
            assert!(ne.mean_squared_error() < 1e-6);
        }
    }

    #[test]
    fn texture_poor_object_contributes_nothing() {
        let body = textured_body();
        let intr = intrinsics();
        let mut renderer = Renderer::new(intr);
        let out = renderer.render(body.model(), &body.pose).unwrap().clone();

        // Featureless frame: no corners anywhere.
        let frame = Frame {
            color: Image::new(320, 240, [128u8, 128, 128]),
            depth: None,
            timestamp_ns: 2,
        };

        let mut modality = TextureModality::new(TextureConfig::default());
        let input = ModalityInput {
            frame: &frame,
            render: &out,
            intrinsics: &intr,
            occlusion: None,
            iteration: 0,
        };

        let ne = modality.contribute(&body, &input);
        assert_eq!(ne.count, 0);
    }
}
