//! Deterministic stand-ins for the external collaborators, plus a synthetic
//! scene generator, shared by the scenario tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nalgebra::{Isometry3, Point2, Point3, UnitQuaternion, Vector3};

use spoor::external::{
    FeatureExtractor, ImageAligner, PatternDetector, PoseOptimizer, TwoViewReconstruction,
    TwoViewSolver,
};
use spoor::{Descriptor, Externals, Frame, KeyFrame, KeyPoint, MapInner, SlamConfig};

pub type Keypoints = (Vec<KeyPoint>, Vec<Descriptor>);

/// Deterministic 256-bit descriptor for scene point `i`.
pub fn descriptor(i: usize) -> Descriptor {
    let mut state = (i as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut bytes = [0u8; 32];
    for b in bytes.iter_mut() {
        // splitmix64 step
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        *b = (z ^ (z >> 31)) as u8;
    }
    Descriptor(bytes)
}

/// A static cloud of world points with stable per-point descriptors.
pub struct Scene {
    pub points: Vec<Point3<f64>>,
}

impl Scene {
    /// `n` points on a grid at depth `z`, spread to fill a 640x480 / f=500
    /// view from the origin.
    pub fn grid(n: usize, z: f64) -> Scene {
        let cols = (n as f64).sqrt().ceil() as usize;
        let rows = n.div_ceil(cols);
        let mut points = Vec::with_capacity(n);
        for i in 0..n {
            let c = (i % cols) as f64 / (cols.max(2) - 1) as f64 - 0.5;
            let r = (i / cols) as f64 / (rows.max(2) - 1) as f64 - 0.5;
            points.push(Point3::new(c * 1.0 * z, r * 0.75 * z, z));
        }
        Scene { points }
    }

    /// Keypoints of the points visible from `t_cw`, restricted to the point
    /// indices for which `visible` returns true. Keypoint order follows scene
    /// order, so descriptors identify points across frames.
    pub fn view_filtered(
        &self,
        config: &SlamConfig,
        t_cw: &Isometry3<f64>,
        visible: impl Fn(usize) -> bool,
    ) -> Keypoints {
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        for (i, p) in self.points.iter().enumerate() {
            if !visible(i) {
                continue;
            }
            let pc = t_cw * p;
            if pc.z <= 0.0 {
                continue;
            }
            let u = config.fx * pc.x / pc.z + config.cx;
            let v = config.fy * pc.y / pc.z + config.cy;
            if u < 0.0 || u >= config.width as f64 || v < 0.0 || v >= config.height as f64 {
                continue;
            }
            keypoints.push(KeyPoint {
                pt: Point2::new(u, v),
                octave: 0,
                angle: 0.0,
            });
            descriptors.push(descriptor(i));
        }
        (keypoints, descriptors)
    }

    pub fn view(&self, config: &SlamConfig, t_cw: &Isometry3<f64>) -> Keypoints {
        self.view_filtered(config, t_cw, |_| true)
    }
}

/// Extractor fed from a queue of pre-scripted frames.
pub struct ScriptedExtractor(pub Arc<Mutex<VecDeque<Keypoints>>>);

impl FeatureExtractor for ScriptedExtractor {
    fn extract(&self, _image: &image::GrayImage) -> Keypoints {
        self.0.lock().unwrap().pop_front().unwrap_or_default()
    }
}

/// Optimizer that records the pose it was handed, marks nothing as outlier
/// and reports every association as an inlier.
pub struct RecordingOptimizer {
    pub poses: Arc<Mutex<Vec<Isometry3<f64>>>>,
}

impl PoseOptimizer for RecordingOptimizer {
    fn pose_optimization(&self, frame: &mut Frame, _map: &MapInner) -> usize {
        if let Some(pose) = frame.pose {
            self.poses.lock().unwrap().push(pose);
        }
        frame.n_matches()
    }

    fn global_ba(&self, _map: &mut MapInner, _iterations: usize) {}
}

/// Aligner with a switchable outcome. On failure it scribbles over the pose
/// so the caller's seed-restore is observable.
pub struct SwitchableAligner {
    pub succeed: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
}

impl ImageAligner for SwitchableAligner {
    fn compute_pose(&self, current: &mut Frame, _reference: &KeyFrame) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed.load(Ordering::SeqCst) {
            true
        } else {
            current.pose = Some(Isometry3::from_parts(
                nalgebra::Translation3::new(1e6, -1e6, 1e6),
                UnitQuaternion::from_scaled_axis(Vector3::new(1.0, 2.0, 3.0)),
            ));
            false
        }
    }
}

/// Two-view solver returning a fixed relative pose and triangulating matches
/// against a known scene (reference view at the identity).
pub struct ScriptedTwoView {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scene: Vec<Point3<f64>>,
    /// triangulate at most this many matches, the rest come back `None`
    pub max_triangulated: usize,
}

impl TwoViewSolver for ScriptedTwoView {
    fn solve(
        &self,
        reference: &Frame,
        _current: &Frame,
        matches: &[(usize, usize)],
        _ransac_iterations: usize,
    ) -> Option<TwoViewReconstruction> {
        // scripted keypoints follow scene order, so keypoint index i1 names
        // scene point i1
        let points = matches
            .iter()
            .enumerate()
            .map(|(m, &(i1, _))| {
                if m < self.max_triangulated && i1 < reference.len() {
                    self.scene.get(i1).copied()
                } else {
                    None
                }
            })
            .collect();
        Some(TwoViewReconstruction {
            rotation: self.rotation,
            translation: self.translation,
            points,
        })
    }
}

/// Solver for configurations that must never bootstrap from two views.
pub struct NoTwoView;

impl TwoViewSolver for NoTwoView {
    fn solve(
        &self,
        _reference: &Frame,
        _current: &Frame,
        _matches: &[(usize, usize)],
        _ransac_iterations: usize,
    ) -> Option<TwoViewReconstruction> {
        None
    }
}

/// Pattern detector that reports a fixed set of keypoint-index to
/// camera-frame-position pairs.
pub struct ScriptedPattern(pub Vec<(usize, Point3<f64>)>);

impl PatternDetector for ScriptedPattern {
    fn detect(&self, _frame: &Frame) -> Option<Vec<(usize, Point3<f64>)>> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}

/// Handles every shared stub state a test may want to poke.
pub struct Rig {
    pub frames: Arc<Mutex<VecDeque<Keypoints>>>,
    pub poses: Arc<Mutex<Vec<Isometry3<f64>>>>,
    pub align_ok: Arc<AtomicBool>,
    pub align_calls: Arc<AtomicUsize>,
}

/// Route tracker logs through `RUST_LOG` when a test is run by hand.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

impl Rig {
    pub fn new() -> Rig {
        init_logging();
        Rig {
            frames: Arc::new(Mutex::new(VecDeque::new())),
            poses: Arc::new(Mutex::new(Vec::new())),
            align_ok: Arc::new(AtomicBool::new(true)),
            align_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn externals(&self, two_view: Box<dyn TwoViewSolver>) -> Externals {
        self.externals_with_pattern(two_view, None)
    }

    pub fn externals_with_pattern(
        &self,
        two_view: Box<dyn TwoViewSolver>,
        pattern: Option<Box<dyn PatternDetector>>,
    ) -> Externals {
        Externals {
            extractor: Box::new(ScriptedExtractor(self.frames.clone())),
            optimizer: Box::new(RecordingOptimizer {
                poses: self.poses.clone(),
            }),
            aligner: Box::new(SwitchableAligner {
                succeed: self.align_ok.clone(),
                calls: self.align_calls.clone(),
            }),
            two_view,
            pattern,
        }
    }

    pub fn push_frame(&self, kps: Keypoints) {
        self.frames.lock().unwrap().push_back(kps);
    }

    pub fn last_recorded_pose(&self) -> Option<Isometry3<f64>> {
        self.poses.lock().unwrap().last().copied()
    }
}

/// Blank grayscale input; the scripted extractor ignores the pixels.
pub fn blank_image(config: &SlamConfig) -> image::GrayImage {
    image::GrayImage::new(config.width, config.height)
}
