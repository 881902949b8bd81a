//! Top-level orchestrator.
//!
//! Owns cameras, bodies with their optimizers, detectors, and consumers,
//! and drives the per-frame pipeline: capture, detect on request, refine,
//! publish. Refinement for different bodies shares no mutable state and
//! runs in parallel; each body carries its own render engine instance.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::camera::capture::CaptureWorker;
use crate::camera::{Frame, FrameSource};
use crate::config::TrackerConfig;
use crate::detector::AnyDetector;
use crate::error::{Result, TrackError};
use crate::image::Image;
use crate::model::{Body, BodyStatus};
use crate::optimizer::{Optimizer, RefineState};
use crate::render::Renderer;

/// What one tracker step should do, mirroring the driver surface: which
/// bodies to (re)detect and which to start refining.
#[derive(Debug, Clone, Default)]
pub struct StepCommand {
    pub execute_detection: bool,
    pub start_tracking: bool,
    pub names_detecting: HashSet<String>,
    pub names_starting: HashSet<String>,
}

impl StepCommand {
    /// Detect and start tracking the given bodies.
    pub fn detect_and_track<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        Self {
            execute_detection: true,
            start_tracking: true,
            names_detecting: names.clone(),
            names_starting: names,
        }
    }
}

/// Contained per-frame/per-body failures surfaced by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    CameraTimeout { camera: String },
    DetectionFailed { body: String },
    Diverged { body: String },
    ModelNotLoaded { body: String },
}

/// Published per body per step.
#[derive(Debug, Clone)]
pub struct TrackUpdate {
    pub body: String,
    pub status: BodyStatus,
    pub pose: crate::geometry::SE3,
    pub timestamp_ns: u64,
}

#[derive(Debug, Default)]
pub struct StepReport {
    pub events: Vec<TrackEvent>,
    pub updates: Vec<TrackUpdate>,
}

/// Downstream consumer (viewer, recorder); purely observational.
pub trait TrackConsumer: Send {
    fn consume(&mut self, update: &TrackUpdate);
}

/// Forwards updates over a channel to another thread.
pub struct ChannelConsumer {
    sender: Sender<TrackUpdate>,
}

impl ChannelConsumer {
    pub fn new() -> (Self, Receiver<TrackUpdate>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl TrackConsumer for ChannelConsumer {
    fn consume(&mut self, update: &TrackUpdate) {
        let _ = self.sender.send(update.clone());
    }
}

/// One body with its exclusively-owned refinement resources.
struct TrackedBody {
    body: Body,
    optimizer: Optimizer,
    camera_index: usize,
    renderer: Option<Renderer>,
    /// Set when the body's model cannot be rendered; the body is skipped
    /// until corrected while the rest of the process continues.
    excluded: bool,
}

pub struct Tracker {
    cfg: TrackerConfig,
    pending_sources: Vec<Box<dyn FrameSource>>,
    cameras: Vec<CaptureWorker>,
    last_seen: Vec<Option<u64>>,
    bodies: Vec<TrackedBody>,
    detectors: Vec<AnyDetector>,
    consumers: Vec<Box<dyn TrackConsumer>>,
    is_set_up: bool,
}

impl Tracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            pending_sources: Vec::new(),
            cameras: Vec::new(),
            last_seen: Vec::new(),
            bodies: Vec::new(),
            detectors: Vec::new(),
            consumers: Vec::new(),
            is_set_up: false,
        }
    }

    /// Register a camera. Returns its index for `add_body`.
    pub fn add_camera(&mut self, source: Box<dyn FrameSource>) -> usize {
        self.pending_sources.push(source);
        self.pending_sources.len() - 1
    }

    /// Register a body with its optimizer, bound to one camera.
    pub fn add_body(&mut self, body: Body, optimizer: Optimizer, camera_index: usize) {
        self.bodies.push(TrackedBody {
            body,
            optimizer,
            camera_index,
            renderer: None,
            excluded: false,
        });
    }

    pub fn add_detector(&mut self, detector: AnyDetector) {
        self.detectors.push(detector);
    }

    pub fn add_consumer(&mut self, consumer: Box<dyn TrackConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn body(&self, name: &str) -> Option<&Body> {
        self.bodies
            .iter()
            .find(|tb| tb.body.name() == name)
            .map(|tb| &tb.body)
    }

    /// Validate the wiring, allocate render resources, and start the
    /// capture threads. Must be called exactly once before stepping.
    pub fn set_up(&mut self) -> Result<()> {
        if self.is_set_up {
            return Err(TrackError::Setup("set_up called twice".to_string()));
        }
        if self.pending_sources.is_empty() {
            return Err(TrackError::Setup("no camera registered".to_string()));
        }

        let mut names = HashSet::new();
        for tb in &self.bodies {
            if !names.insert(tb.body.name().to_string()) {
                return Err(TrackError::Setup(format!(
                    "duplicate body name `{}`",
                    tb.body.name()
                )));
            }
            if tb.camera_index >= self.pending_sources.len() {
                return Err(TrackError::Setup(format!(
                    "body `{}` references unknown camera {}",
                    tb.body.name(),
                    tb.camera_index
                )));
            }
            let source = &self.pending_sources[tb.camera_index];
            if (tb.body.modalities.use_depth || tb.body.modalities.measure_occlusions)
                && !source.provides_depth()
            {
                return Err(TrackError::Setup(format!(
                    "body `{}` needs depth but camera `{}` is color-only",
                    tb.body.name(),
                    source.name()
                )));
            }
        }
        for detector in &self.detectors {
            if !names.contains(detector.body_name()) {
                return Err(TrackError::Setup(format!(
                    "detector targets unknown body `{}`",
                    detector.body_name()
                )));
            }
        }

        self.cameras = self
            .pending_sources
            .drain(..)
            .map(CaptureWorker::spawn)
            .collect();
        self.last_seen = vec![None; self.cameras.len()];

        for tb in &mut self.bodies {
            if tb.body.model().triangles().is_empty() {
                warn!(body = tb.body.name(), "model has no geometry, excluding");
                tb.excluded = true;
                continue;
            }
            tb.renderer = Some(Renderer::new(self.cameras[tb.camera_index].intrinsics()));
        }

        self.is_set_up = true;
        info!(
            cameras = self.cameras.len(),
            bodies = self.bodies.len(),
            detectors = self.detectors.len(),
            "tracker set up"
        );
        Ok(())
    }

    /// One frame step: capture, detect on request, refine, publish.
    ///
    /// Per-body and per-camera failures are contained in the report; only
    /// setup misuse returns `Err`.
    pub fn step(&mut self, cmd: &StepCommand) -> Result<StepReport> {
        if !self.is_set_up {
            return Err(TrackError::Setup(
                "set_up must be called before stepping".to_string(),
            ));
        }

        let mut report = StepReport::default();
        let timeout = Duration::from_millis(self.cfg.frame_timeout_ms);

        // 1. Freshest frame per camera; a timeout skips that camera's
        //    bodies this step without touching their state.
        let mut frames: Vec<Option<Arc<Frame>>> = Vec::with_capacity(self.cameras.len());
        for (i, camera) in self.cameras.iter().enumerate() {
            match camera.latest(self.last_seen[i], timeout) {
                Ok(frame) => {
                    self.last_seen[i] = Some(frame.timestamp_ns);
                    frames.push(Some(frame));
                }
                Err(TrackError::CameraTimeout { camera, timeout_ms }) => {
                    debug!(camera = %camera, timeout_ms, "no new frame");
                    report.events.push(TrackEvent::CameraTimeout { camera });
                    frames.push(None);
                }
                Err(err) => return Err(err),
            }
        }

        // 2. Detection precedes refinement for the same body within the
        //    step. Failures only touch the affected body.
        if cmd.execute_detection {
            for detector in self.detectors.iter_mut() {
                let name = detector.body_name().to_string();
                if !cmd.names_detecting.contains(&name) {
                    continue;
                }
                let Some(tb) = self
                    .bodies
                    .iter_mut()
                    .find(|tb| tb.body.name() == name && !tb.excluded)
                else {
                    continue;
                };
                if !matches!(tb.body.status, BodyStatus::Unknown | BodyStatus::Lost) {
                    continue;
                }
                let Some(frame) = &frames[tb.camera_index] else {
                    continue;
                };
                let intrinsics = self.cameras[tb.camera_index].intrinsics();
                match detector.produce_pose(frame, &intrinsics) {
                    Ok(pose) => {
                        tb.body.pose = pose;
                        tb.body.status = BodyStatus::Detecting;
                        if cmd.start_tracking && cmd.names_starting.contains(&name) {
                            tb.body.status = BodyStatus::Tracking;
                        }
                        debug!(body = %name, status = ?tb.body.status, "detection seeded pose");
                    }
                    Err(err) => {
                        debug!(body = %name, error = %err, "detection failed");
                        report
                            .events
                            .push(TrackEvent::DetectionFailed { body: name });
                    }
                }
            }
        }

        // 3. Occlusion maps from the pre-refinement poses, then parallel
        //    per-body refinement. Bodies are independent; results land in
        //    body-index order so parallel and sequential execution agree.
        let occlusions = self.occlusion_maps(&frames);
        let body_events: Vec<Option<TrackEvent>> = self
            .bodies
            .par_iter_mut()
            .zip(occlusions.par_iter())
            .map(|(tb, occlusion)| {
                if tb.excluded || tb.body.status != BodyStatus::Tracking {
                    return None;
                }
                let frame = frames[tb.camera_index].as_deref()?;
                let renderer = tb.renderer.as_mut()?;
                match tb
                    .optimizer
                    .refine(&mut tb.body, frame, renderer, occlusion.as_ref())
                {
                    Ok(outcome) => {
                        if outcome.state == RefineState::Diverged {
                            tb.body.status = BodyStatus::Lost;
                            Some(TrackEvent::Diverged {
                                body: tb.body.name().to_string(),
                            })
                        } else {
                            None
                        }
                    }
                    Err(_) => {
                        tb.excluded = true;
                        Some(TrackEvent::ModelNotLoaded {
                            body: tb.body.name().to_string(),
                        })
                    }
                }
            })
            .collect();
        report.events.extend(body_events.into_iter().flatten());

        // 4. Publish.
        for tb in &self.bodies {
            if tb.excluded {
                continue;
            }
            let Some(frame) = &frames[tb.camera_index] else {
                continue;
            };
            report.updates.push(TrackUpdate {
                body: tb.body.name().to_string(),
                status: tb.body.status,
                pose: tb.body.pose.clone(),
                timestamp_ns: frame.timestamp_ns,
            });
        }
        for consumer in self.consumers.iter_mut() {
            for update in &report.updates {
                consumer.consume(update);
            }
        }

        Ok(report)
    }

    /// Run the step loop until `stop` is raised. The flag is honored
    /// between steps; in-flight refinements always complete first.
    pub fn run(&mut self, cmd: &StepCommand, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::SeqCst) {
            self.step(cmd)?;
        }
        info!("tracker loop stopped");
        Ok(())
    }

    /// Stop and join the capture threads.
    pub fn shutdown(&mut self) {
        for camera in &mut self.cameras {
            camera.shutdown();
        }
    }

    /// Per-body combined depth of the other active bodies on the same
    /// camera, for modeled occlusion handling.
    fn occlusion_maps(&mut self, frames: &[Option<Arc<Frame>>]) -> Vec<Option<Image<f32>>> {
        let n = self.bodies.len();
        let wants_occlusion = |tb: &TrackedBody| {
            !tb.excluded
                && tb.body.status == BodyStatus::Tracking
                && tb.body.modalities.model_occlusions
        };
        if !self.bodies.iter().any(wants_occlusion) {
            return vec![None; n];
        }

        // Depth of every active body at its pre-refinement pose.
        let mut depths: Vec<Option<Image<f32>>> = vec![None; n];
        for (i, tb) in self.bodies.iter_mut().enumerate() {
            if tb.excluded
                || !matches!(tb.body.status, BodyStatus::Tracking | BodyStatus::Detecting)
                || frames[tb.camera_index].is_none()
            {
                continue;
            }
            let Some(renderer) = tb.renderer.as_mut() else {
                continue;
            };
            if let Ok(out) = renderer.render(tb.body.model(), &tb.body.pose) {
                depths[i] = Some(out.depth.clone());
            }
        }

        (0..n)
            .map(|i| {
                if !wants_occlusion(&self.bodies[i]) {
                    return None;
                }
                let camera_index = self.bodies[i].camera_index;
                let renderer = self.bodies[i].renderer.as_ref()?;
                let intr = renderer.intrinsics();
                let mut map = Image::new(intr.width, intr.height, 0.0f32);
                let mut merged_any = false;
                for (j, depth) in depths.iter().enumerate() {
                    if j == i || self.bodies[j].camera_index != camera_index {
                        continue;
                    }
                    let Some(depth) = depth else { continue };
                    merged_any = true;
                    for y in 0..map.height() {
                        for x in 0..map.width() {
                            let d = depth.get(x, y);
                            if d > 0.0 {
                                let existing = map.get(x, y);
                                if existing == 0.0 || d < existing {
                                    map.set(x, y, d);
                                }
                            }
                        }
                    }
                }
                merged_any.then_some(map)
            })
            .collect()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
