//! Camera collaborators: pinhole intrinsics, frames, and the `FrameSource`
//! trait that external camera drivers implement.
//!
//! Actual sensor integration lives outside this crate; the tracker only sees
//! `FrameSource` objects and pulls the freshest frame through a single-slot
//! buffer (see [`capture`]).

pub mod capture;

use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;

use crate::error::Result;
use crate::image::Image;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: usize,
    pub height: usize,
}

impl Intrinsics {
    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the optical center.
    #[inline]
    pub fn project(&self, p: &Vector3<f64>) -> Option<(f64, f64)> {
        if p.z <= 1e-9 {
            return None;
        }
        Some((
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Back-project pixel `(u, v)` at depth `z` (meters) into the camera
    /// frame.
    #[inline]
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Whether pixel coordinates fall inside the image.
    #[inline]
    pub fn contains(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && v >= 0.0 && u < self.width as f64 && v < self.height as f64
    }
}

/// One captured frame: color image, optional aligned depth map, timestamp.
#[derive(Debug, Clone)]
pub struct Frame {
    pub color: Image<[u8; 3]>,
    /// Depth in meters, aligned to `color`; `0.0` marks invalid pixels.
    pub depth: Option<Image<f32>>,
    pub timestamp_ns: u64,
}

/// A live or replay image source.
///
/// Implementations block in `next_frame` for up to `timeout` and return
/// [`TrackError::CameraTimeout`](crate::error::TrackError) when nothing
/// arrives in time.
pub trait FrameSource: Send {
    /// Identifier used in logs and timeout events.
    fn name(&self) -> &str;

    fn intrinsics(&self) -> Intrinsics;

    /// Whether frames carry a depth map.
    fn provides_depth(&self) -> bool;

    fn next_frame(&mut self, timeout: Duration) -> Result<Arc<Frame>>;
}
