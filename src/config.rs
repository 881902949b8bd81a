//! Serde-backed configuration aggregate.
//!
//! Every tunable (iteration budgets, damping schedule, modality sampling)
//! lives in the per-module config structs; this module groups them so a
//! driver can deserialize one document with partial overrides.

use serde::Deserialize;

use crate::modality::{DepthConfig, RegionConfig, TextureConfig};
use crate::optimizer::OptimizerConfig;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Per-step budget for a camera to deliver a new frame, milliseconds.
    pub frame_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 500,
        }
    }
}

/// Full configuration document.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub tracker: TrackerConfig,
    pub optimizer: OptimizerConfig,
    pub region: RegionConfig,
    pub depth: DepthConfig,
    pub texture: TextureConfig,
}
