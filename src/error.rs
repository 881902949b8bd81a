//! Error taxonomy for the tracking pipeline.
//!
//! Setup errors are fatal and abort startup. Everything else is contained:
//! per-frame and per-body failures are reported as events in the step report
//! and never halt the other bodies or cameras.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackError {
    /// Fatal pre-flight failure (inconsistent wiring, missing resources).
    #[error("setup failed: {0}")]
    Setup(String),

    /// No frame arrived within the per-step budget. The frame is skipped and
    /// body state is left unchanged; the next step retries automatically.
    #[error("camera `{camera}` produced no frame within {timeout_ms} ms")]
    CameraTimeout { camera: String, timeout_ms: u64 },

    /// The detector found no confident match for this body. Its status is
    /// left unchanged; other bodies are unaffected.
    #[error("detection failed for body `{body}`")]
    DetectionFailed { body: String },

    /// Refinement residuals grew past the retry budget. The pose has been
    /// rolled back to its pre-step value and the body is Lost.
    #[error("refinement diverged for body `{body}`")]
    Diverged { body: String },

    /// The body references a model with no geometry. The body is excluded
    /// from processing until corrected; the process keeps running.
    #[error("no geometry loaded for body `{body}`")]
    ModelNotLoaded { body: String },
}

pub type Result<T> = std::result::Result<T, TrackError>;
