//! Synthetic camera sources shared by the integration scenarios.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::{UnitQuaternion, Vector3};

use rust_modeltrack::camera::{Frame, FrameSource, Intrinsics};
use rust_modeltrack::error::{Result, TrackError};
use rust_modeltrack::geometry::SE3;
use rust_modeltrack::image::Image;
use rust_modeltrack::model::{mesh, GeometricModel};
use rust_modeltrack::render::Renderer;

/// Route crate logs into the test harness output.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn intrinsics() -> Intrinsics {
    Intrinsics {
        fx: 500.0,
        fy: 500.0,
        cx: 160.0,
        cy: 120.0,
        width: 320,
        height: 240,
    }
}

pub fn box_model(name: &str) -> Arc<GeometricModel> {
    let (verts, tris) = mesh::cuboid(0.1, 0.1, 0.1);
    GeometricModel::from_mesh(name, &verts, &tris, 1.0).unwrap()
}

pub fn pose_at(x: f64, z: f64, tilt: f64) -> SE3 {
    SE3 {
        rotation: UnitQuaternion::from_scaled_axis(Vector3::new(tilt, 0.0, 0.0)),
        translation: Vector3::new(x, 0.0, z),
    }
}

/// Renders a fixed scene of bodies on demand. Every call yields a frame
/// with a fresh timestamp; when `blackout` is raised the sensor goes dark
/// (uniform color, zero depth).
pub struct SceneCamera {
    name: String,
    intr: Intrinsics,
    renderer: Renderer,
    scene: Vec<(Arc<GeometricModel>, SE3)>,
    with_depth: bool,
    counter: u64,
    pub blackout: Arc<AtomicBool>,
}

impl SceneCamera {
    pub fn new(
        name: &str,
        scene: Vec<(Arc<GeometricModel>, SE3)>,
        with_depth: bool,
    ) -> (Self, Arc<AtomicBool>) {
        let blackout = Arc::new(AtomicBool::new(false));
        let camera = Self {
            name: name.to_string(),
            intr: intrinsics(),
            renderer: Renderer::new(intrinsics()),
            scene,
            with_depth,
            counter: 0,
            blackout: blackout.clone(),
        };
        let handle = camera.blackout.clone();
        (camera, handle)
    }
}

impl FrameSource for SceneCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn intrinsics(&self) -> Intrinsics {
        self.intr
    }

    fn provides_depth(&self) -> bool {
        self.with_depth
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Arc<Frame>> {
        // Pace the capture loop like a fast sensor.
        std::thread::sleep(Duration::from_millis(2));
        self.counter += 1;

        let (w, h) = (self.intr.width, self.intr.height);
        let mut color = Image::new(w, h, [25u8, 25, 25]);
        let mut depth = Image::new(w, h, 0.0f32);

        if !self.blackout.load(Ordering::SeqCst) {
            for (i, (model, pose)) in self.scene.iter().enumerate() {
                let out = self.renderer.render(model, pose).unwrap();
                let brightness = 180 + 25 * (i as u8 % 3);
                for y in 0..h {
                    for x in 0..w {
                        let d = out.depth.get(x, y);
                        if d > 0.0 {
                            let existing = depth.get(x, y);
                            if existing == 0.0 || d < existing {
                                depth.set(x, y, d);
                                color.set(x, y, [brightness; 3]);
                            }
                        }
                    }
                }
            }
        }

        Ok(Arc::new(Frame {
            color,
            depth: self.with_depth.then_some(depth),
            timestamp_ns: self.counter * 1_000_000,
        }))
    }
}

/// Never delivers a frame.
pub struct TimeoutCamera {
    name: String,
}

impl TimeoutCamera {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl FrameSource for TimeoutCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn intrinsics(&self) -> Intrinsics {
        intrinsics()
    }

    fn provides_depth(&self) -> bool {
        false
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Arc<Frame>> {
        std::thread::sleep(timeout);
        Err(TrackError::CameraTimeout {
            camera: self.name.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}
