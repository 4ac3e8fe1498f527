//! Types shared by every crate of the spoor visual tracking front-end.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Scalar type used throughout the workspace.
pub type MyFloat = f64;

/// Monotonically increasing per-input frame number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FrameId(pub u64);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable id of a promoted keyframe. Strictly monotone over the lifetime of a
/// map (survives arena slot reuse).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KeyframeId(pub u64);

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensor configuration the tracker was started with.
///
/// The per-frame payload (depth image, IMU sample) travels with the grab call;
/// this tag selects the bootstrap path and the mode-specific thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    /// Single grayscale camera.
    Monocular,
    /// Grayscale camera with a registered depth image.
    Rgbd,
    /// Grayscale camera fused with an inertial measurement unit.
    Fusion,
}

impl SensorKind {
    pub fn has_depth(&self) -> bool {
        matches!(self, SensorKind::Rgbd)
    }

    pub fn uses_imu(&self) -> bool {
        matches!(self, SensorKind::Fusion)
    }
}

/// One inertial measurement: linear acceleration and angular rate, both in
/// the sensor frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// m/s^2
    pub accel: Vector3<MyFloat>,
    /// rad/s
    pub gyro: Vector3<MyFloat>,
}

impl ImuSample {
    pub fn new(accel: Vector3<MyFloat>, gyro: Vector3<MyFloat>) -> Self {
        Self { accel, gyro }
    }
}

/// Pinhole intrinsics, Plumb-Bob distortion and the per-camera constants the
/// tracker needs alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub width: u32,
    pub height: u32,
    pub fx: MyFloat,
    pub fy: MyFloat,
    pub cx: MyFloat,
    pub cy: MyFloat,
    pub k1: MyFloat,
    pub k2: MyFloat,
    pub k3: MyFloat,
    pub p1: MyFloat,
    pub p2: MyFloat,
    /// Frames per second of the input stream.
    pub fps: MyFloat,
    /// Stereo baseline times fx, in pixel-meters. Zero for monocular input.
    pub bf: MyFloat,
}

/// Feature extractor tuning, forwarded verbatim to the extractor
/// implementation and used by the matcher for its scale pyramid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbParams {
    pub n_features: usize,
    pub scale_factor: MyFloat,
    pub n_levels: usize,
    pub ini_th_fast: u8,
    pub min_th_fast: u8,
}

impl OrbParams {
    /// Scale factor of pyramid level `level` relative to level 0.
    pub fn level_scale(&self, level: usize) -> MyFloat {
        self.scale_factor.powi(level as i32)
    }
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        }
    }
}
