//! Contracts of the external collaborators the tracker is driven against.
//!
//! Feature extraction, nonlinear optimization, direct image alignment, the
//! two-view bootstrap solver and the fiducial detector are injected so the
//! tracker can be exercised with deterministic stand-ins.

use image::GrayImage;
use nalgebra::{Point3, UnitQuaternion, Vector3};

use spoor_types::MyFloat;

use crate::frame::{Descriptor, Frame, KeyPoint};
use crate::map::{KeyFrame, MapInner};

/// Oriented FAST + rotated BRIEF extraction.
pub trait FeatureExtractor: Send {
    /// Keypoints in raw (distorted) pixel coordinates plus their descriptors.
    fn extract(&self, image: &GrayImage) -> (Vec<KeyPoint>, Vec<Descriptor>);
}

/// Nonlinear least-squares backend.
pub trait PoseOptimizer: Send {
    /// Motion-only bundle adjustment: refine `frame.pose` against its matched
    /// map points, set the per-keypoint outlier flags and return the inlier
    /// count.
    fn pose_optimization(&self, frame: &mut Frame, map: &MapInner) -> usize;

    /// Full bundle adjustment over the whole map.
    fn global_ba(&self, map: &mut MapInner, iterations: usize);
}

/// Direct photometric alignment of the current frame against a keyframe.
pub trait ImageAligner: Send {
    /// Refine `current.pose` starting from its current value. Returns false
    /// if alignment did not converge; `current.pose` may then hold garbage
    /// and the caller restores its seed.
    fn compute_pose(&self, current: &mut Frame, reference: &KeyFrame) -> bool;
}

/// Result of the homography/fundamental two-view solve.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// rotation of the second view relative to the first
    pub rotation: UnitQuaternion<MyFloat>,
    /// translation of the second view relative to the first
    pub translation: Vector3<MyFloat>,
    /// per-match triangulated point in the first camera frame; `None` where
    /// triangulation failed the parallax or cheirality checks
    pub points: Vec<Option<Point3<MyFloat>>>,
}

/// Homography/fundamental RANSAC decomposition for the monocular bootstrap.
pub trait TwoViewSolver: Send {
    fn solve(
        &self,
        reference: &Frame,
        current: &Frame,
        matches: &[(usize, usize)],
        ransac_iterations: usize,
    ) -> Option<TwoViewReconstruction>;
}

/// Fiducial pattern detector for the pattern bootstrap.
pub trait PatternDetector: Send {
    /// Detected pattern points: keypoint index and the known pattern-frame
    /// coordinate transformed into the camera frame.
    fn detect(&self, frame: &Frame) -> Option<Vec<(usize, Point3<MyFloat>)>>;
}
