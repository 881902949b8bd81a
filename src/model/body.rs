//! A trackable object instance and its per-body configuration.

use std::sync::Arc;

use nalgebra::Vector3;
use serde::Deserialize;

use super::GeometricModel;
use crate::geometry::SE3;

/// Per-body tracking status driven by the tracker's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStatus {
    /// No pose hypothesis yet.
    Unknown,
    /// A detector produced a hypothesis this step; not yet refined.
    Detecting,
    /// Refinement runs every step.
    Tracking,
    /// Refinement diverged; waiting for re-detection.
    Lost,
}

impl Default for BodyStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Which modalities contribute to this body's refinement, and how occlusions
/// are handled.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ModalityToggles {
    pub use_region: bool,
    pub use_depth: bool,
    pub use_texture: bool,
    /// Drop samples occluded by other tracked bodies (rendered occlusion
    /// map supplied by the tracker).
    pub model_occlusions: bool,
    /// Drop samples whose sensed depth lies in front of the rendered
    /// surface.
    pub measure_occlusions: bool,
}

impl Default for ModalityToggles {
    fn default() -> Self {
        Self {
            use_region: true,
            use_depth: false,
            use_texture: false,
            model_occlusions: false,
            measure_occlusions: false,
        }
    }
}

/// One tracked object: identity, shared model, current pose estimate.
///
/// The pose is T_cb (body to camera) and is mutated only by the optimizer
/// (refinement) and detectors (reinitialization); the tracker is the sole
/// arbiter scheduling those calls.
#[derive(Debug, Clone)]
pub struct Body {
    name: String,
    model: Arc<GeometricModel>,
    pub pose: SE3,
    pub status: BodyStatus,
    pub modalities: ModalityToggles,
}

impl Body {
    pub fn new(name: &str, model: Arc<GeometricModel>, modalities: ModalityToggles) -> Self {
        Self {
            name: name.to_string(),
            model,
            pose: SE3::identity(),
            status: BodyStatus::Unknown,
            modalities,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Arc<GeometricModel> {
        &self.model
    }

    /// Unit direction from the body origin toward the camera, expressed in
    /// the body frame. Indexes the viewpoint templates.
    pub fn view_direction(&self) -> Vector3<f64> {
        let cam_in_body = self.pose.inverse().translation;
        let norm = cam_in_body.norm();
        if norm > 1e-12 {
            cam_in_body / norm
        } else {
            Vector3::z()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mesh::cuboid;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn test_body() -> Body {
        let (verts, tris) = cuboid(0.1, 0.1, 0.1);
        let model = GeometricModel::from_mesh("box", &verts, &tris, 1.0).unwrap();
        Body::new("box", model, ModalityToggles::default())
    }

    #[test]
    fn new_body_starts_unknown_at_identity() {
        let body = test_body();

        assert_eq!(body.status, BodyStatus::Unknown);
        assert_relative_eq!(body.pose.translation, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn view_direction_points_from_body_to_camera() {
        let mut body = test_body();
        // Body straight ahead of the camera, no rotation: the camera sits at
        // -z in the body frame.
        body.pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 0.5),
        };

        assert_relative_eq!(
            body.view_direction(),
            Vector3::new(0.0, 0.0, -1.0),
            epsilon = 1e-12
        );
    }
}
