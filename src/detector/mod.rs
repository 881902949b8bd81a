//! Pose hypothesis producers that seed or recover tracking.
//!
//! `StaticDetector` replays a preconfigured pose for known-start-position
//! scenarios; `FeatureDetector` matches the observed frame against a cached
//! reference appearance and refines the reference pose by reprojection.

use nalgebra::{Vector2, Vector3};
use tracing::debug;

use crate::camera::{Frame, Intrinsics};
use crate::error::{Result, TrackError};
use crate::features::{
    detect_and_describe, match_descriptors, Descriptor, FeatureConfig, MAX_HAMMING, NN_RATIO,
};
use crate::geometry::SE3;
use crate::image::{luma, Image};
use crate::modality::{point_jacobian, projection_jacobian, NormalEquations};
use crate::model::Body;

/// Tagged registry of detector variants.
pub enum AnyDetector {
    Static(StaticDetector),
    Feature(FeatureDetector),
}

impl AnyDetector {
    /// Name of the body this detector produces hypotheses for.
    pub fn body_name(&self) -> &str {
        match self {
            AnyDetector::Static(d) => &d.body_name,
            AnyDetector::Feature(d) => &d.body_name,
        }
    }

    /// Produce a fresh pose hypothesis from the current frame.
    ///
    /// Fails with `DetectionFailed` when no confident estimate exists; the
    /// caller leaves the body's status unchanged and may retry later.
    pub fn produce_pose(&mut self, frame: &Frame, intrinsics: &Intrinsics) -> Result<SE3> {
        match self {
            AnyDetector::Static(d) => Ok(d.pose.clone()),
            AnyDetector::Feature(d) => d.produce_pose(frame, intrinsics),
        }
    }
}

/// Fixed, preconfigured pose; ignores sensor data.
pub struct StaticDetector {
    body_name: String,
    pose: SE3,
}

impl StaticDetector {
    pub fn new(body_name: &str, pose: SE3) -> Self {
        Self {
            body_name: body_name.to_string(),
            pose,
        }
    }
}

/// Reference appearance for feature-based re-detection: descriptors with
/// body-frame landmarks, captured at a known pose.
pub struct ReferenceView {
    pub pose: SE3,
    pub descriptors: Vec<Descriptor>,
    pub points_body: Vec<Vector3<f64>>,
}

impl ReferenceView {
    /// Capture a reference from an observed frame at a known body pose,
    /// keeping only keypoints that land on the rendered surface.
    pub fn capture(
        body: &Body,
        frame: &Frame,
        rendered_depth: &Image<f32>,
        intrinsics: &Intrinsics,
        cfg: &FeatureConfig,
    ) -> Option<Self> {
        let set = detect_and_describe(&luma(&frame.color), cfg);
        let cam_to_body = body.pose.inverse();

        let mut descriptors = Vec::new();
        let mut points_body = Vec::new();
        for (kp, desc) in set.keypoints.iter().zip(&set.descriptors) {
            let (x, y) = (kp.x.round() as isize, kp.y.round() as isize);
            let Some(depth) = rendered_depth.at(x, y).filter(|&d| d > 0.0) else {
                continue;
            };
            let p_cam = intrinsics.unproject(kp.x as f64, kp.y as f64, depth as f64);
            descriptors.push(*desc);
            points_body.push(cam_to_body.transform_point(&p_cam));
        }

        if descriptors.len() < 4 {
            return None;
        }
        Some(Self {
            pose: body.pose.clone(),
            descriptors,
            points_body,
        })
    }
}

/// Matches against a reference database and refines the reference pose.
pub struct FeatureDetector {
    body_name: String,
    reference: ReferenceView,
    /// Minimum matched fraction of the reference descriptors.
    min_confidence: f64,
    features: FeatureConfig,
    refine_iterations: usize,
}

impl FeatureDetector {
    pub fn new(body_name: &str, reference: ReferenceView, min_confidence: f64) -> Self {
        Self {
            body_name: body_name.to_string(),
            reference,
            min_confidence,
            features: FeatureConfig::default(),
            refine_iterations: 10,
        }
    }

    fn produce_pose(&mut self, frame: &Frame, intrinsics: &Intrinsics) -> Result<SE3> {
        let observed = detect_and_describe(&luma(&frame.color), &self.features);
        let matches = match_descriptors(
            &self.reference.descriptors,
            &observed.descriptors,
            MAX_HAMMING,
            NN_RATIO,
        );

        let confidence = matches.len() as f64 / self.reference.descriptors.len() as f64;
        if matches.len() < 4 || confidence < self.min_confidence {
            debug!(
                body = %self.body_name,
                matches = matches.len(),
                confidence,
                "no confident match"
            );
            return Err(TrackError::DetectionFailed {
                body: self.body_name.clone(),
            });
        }

        // Short reprojection Gauss-Newton from the reference pose.
        let mut pose = self.reference.pose.clone();
        for _ in 0..self.refine_iterations {
            let mut system = NormalEquations::zero();
            for &(ri, oi) in &matches {
                let p_cam = pose.transform_point(&self.reference.points_body[ri]);
                let Some((u, v)) = intrinsics.project(&p_cam) else {
                    continue;
                };
                let kp = observed.keypoints[oi];
                let r = Vector2::new(u - kp.x as f64, v - kp.y as f64);
                let j = projection_jacobian(intrinsics, &p_cam) * point_jacobian(&p_cam);
                system.add_2d(&j, &r, 1.0);
            }
            if system.count < 4 {
                return Err(TrackError::DetectionFailed {
                    body: self.body_name.clone(),
                });
            }

            let mut damped = system.jtj;
            for i in 0..6 {
                damped[(i, i)] += 1e-3 * damped[(i, i)].max(1e-6);
            }
            let Some(delta) = damped.lu().solve(&(-system.jtr)) else {
                return Err(TrackError::DetectionFailed {
                    body: self.body_name.clone(),
                });
            };
            pose = SE3::exp(&delta).compose(&pose);
            if delta.norm() < 1e-6 {
                break;
            }
        }
        Ok(pose)
    }
}
