//! Sensor-data comparison strategies.
//!
//! Each modality compares the rendered hypothesis against the observed
//! frame and returns a weighted normal-equation contribution. Modalities
//! never mutate the pose; fusion and the update step belong to the
//! optimizer.

pub mod depth;
pub mod region;
pub mod texture;

pub use depth::{DepthConfig, DepthModality};
pub use region::{RegionConfig, RegionModality};
pub use texture::{TextureConfig, TextureModality};

use nalgebra::{Matrix2x6, Matrix3x6, Matrix6, Vector2, Vector3, Vector6};

use crate::camera::{Frame, Intrinsics};
use crate::geometry::so3::skew;
use crate::image::Image;
use crate::model::Body;
use crate::render::RenderOutput;

/// Weighted Gauss-Newton contribution: `JᵀWJ`, `JᵀWr`, and residual
/// statistics over the twist `ξ = [ω, v]`.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    pub jtj: Matrix6<f64>,
    pub jtr: Vector6<f64>,
    pub squared_error: f64,
    pub count: usize,
}

impl NormalEquations {
    pub fn zero() -> Self {
        Self {
            jtj: Matrix6::zeros(),
            jtr: Vector6::zeros(),
            squared_error: 0.0,
            count: 0,
        }
    }

    /// Accumulate a scalar residual with Jacobian row `j`.
    pub fn add_1d(&mut self, j: &Vector6<f64>, r: f64, w: f64) {
        self.jtj += w * j * j.transpose();
        self.jtr += w * r * j;
        self.squared_error += w * r * r;
        self.count += 1;
    }

    /// Accumulate a 2D residual with its 2x6 Jacobian.
    pub fn add_2d(&mut self, j: &Matrix2x6<f64>, r: &Vector2<f64>, w: f64) {
        self.jtj += w * j.transpose() * j;
        self.jtr += w * j.transpose() * r;
        self.squared_error += w * r.norm_squared();
        self.count += 1;
    }

    pub fn merge(&mut self, other: &NormalEquations) {
        self.jtj += other.jtj;
        self.jtr += other.jtr;
        self.squared_error += other.squared_error;
        self.count += other.count;
    }

    pub fn mean_squared_error(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.squared_error / self.count as f64
        }
    }
}

/// Everything a modality sees for one refinement iteration.
pub struct ModalityInput<'a> {
    pub frame: &'a Frame,
    pub render: &'a RenderOutput,
    pub intrinsics: &'a Intrinsics,
    /// Combined depth of the other tracked bodies, when modeled occlusion
    /// handling is on.
    pub occlusion: Option<&'a Image<f32>>,
    /// Refinement iteration index within the current pass (0-based).
    pub iteration: usize,
}

/// Tagged registry of modality variants bound to one body.
pub enum AnyModality {
    Region(RegionModality),
    Depth(DepthModality),
    Texture(TextureModality),
    /// Replays a fixed sequence of contributions; test instrumentation.
    #[cfg(test)]
    Scripted(ScriptedModality),
}

impl AnyModality {
    pub fn name(&self) -> &'static str {
        match self {
            AnyModality::Region(_) => "region",
            AnyModality::Depth(_) => "depth",
            AnyModality::Texture(_) => "texture",
            #[cfg(test)]
            AnyModality::Scripted(_) => "scripted",
        }
    }

    /// Whether this modality is enabled by the body's configuration.
    pub fn enabled_for(&self, body: &Body) -> bool {
        match self {
            AnyModality::Region(_) => body.modalities.use_region,
            AnyModality::Depth(_) => body.modalities.use_depth,
            AnyModality::Texture(_) => body.modalities.use_texture,
            #[cfg(test)]
            AnyModality::Scripted(_) => true,
        }
    }

    pub fn contribute(&mut self, body: &Body, input: &ModalityInput) -> NormalEquations {
        match self {
            AnyModality::Region(m) => m.contribute(body, input),
            AnyModality::Depth(m) => m.contribute(body, input),
            AnyModality::Texture(m) => m.contribute(body, input),
            #[cfg(test)]
            AnyModality::Scripted(m) => m.next(),
        }
    }
}

/// Pops a queued contribution per call; zero once the queue runs dry.
#[cfg(test)]
pub struct ScriptedModality {
    pub queue: std::collections::VecDeque<NormalEquations>,
}

#[cfg(test)]
impl ScriptedModality {
    pub fn new(queue: Vec<NormalEquations>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    fn next(&mut self) -> NormalEquations {
        self.queue.pop_front().unwrap_or_else(NormalEquations::zero)
    }
}

/// Derivative of a camera-frame point with respect to a left-multiplied
/// twist perturbation: `dp/dξ = [-[p]×  I]`.
pub(crate) fn point_jacobian(p_cam: &Vector3<f64>) -> Matrix3x6<f64> {
    let mut j = Matrix3x6::zeros();
    j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(p_cam)));
    j.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&nalgebra::Matrix3::identity());
    j
}

/// Derivative of the pinhole projection with respect to the camera-frame
/// point.
pub(crate) fn projection_jacobian(
    intrinsics: &Intrinsics,
    p_cam: &Vector3<f64>,
) -> nalgebra::Matrix2x3<f64> {
    let z_inv = 1.0 / p_cam.z;
    let z_inv_sq = z_inv * z_inv;
    nalgebra::Matrix2x3::new(
        intrinsics.fx * z_inv,
        0.0,
        -intrinsics.fx * p_cam.x * z_inv_sq,
        0.0,
        intrinsics.fy * z_inv,
        -intrinsics.fy * p_cam.y * z_inv_sq,
    )
}

/// Whether the sample at `(x, y)` with rendered depth `rendered` is hidden
/// by another body (modeled) or by an unexpected foreground object
/// (measured), subject to the body's occlusion toggles.
pub(crate) fn sample_occluded(
    body: &Body,
    input: &ModalityInput,
    x: usize,
    y: usize,
    rendered: f64,
    margin: f64,
) -> bool {
    if body.modalities.model_occlusions {
        if let Some(map) = input.occlusion {
            let other = map.get(x, y) as f64;
            if other > 0.0 && other < rendered - margin {
                return true;
            }
        }
    }
    if body.modalities.measure_occlusions {
        if let Some(sensed) = &input.frame.depth {
            let d = sensed.get(x, y) as f64;
            if d > 0.0 && d < rendered - margin {
                return true;
            }
        }
    }
    false
}
