use std::sync::Arc;

use nalgebra::{Isometry3, Point2};

use spoor_mvg::{DistortedPixel, PinholeCamera};
use spoor_types::{FrameId, MyFloat};

use crate::map::{KeyFrameHandle, MapPointHandle};

/// 16-bit depth image registered to the grayscale input.
pub type DepthImage = image::ImageBuffer<image::Luma<u16>, Vec<u16>>;

/// A detected feature location. Extractors report raw (distorted) pixel
/// coordinates; inside a [`Frame`] the coordinates are undistorted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub pt: Point2<MyFloat>,
    /// pyramid level the feature was detected on
    pub octave: usize,
    /// orientation in degrees, [0, 360)
    pub angle: MyFloat,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Hamming distance.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// A transient per-input observation. Only the previous frame is retained by
/// the tracker; older frames are discarded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: Option<MyFloat>,
    pub camera: Arc<PinholeCamera>,
    /// keypoints in undistorted pixel coordinates
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// per-keypoint depth in meters; `<= 0.0` means no valid depth. `None`
    /// for sensors without a depth channel.
    pub depths: Option<Vec<MyFloat>>,
    pub mappoints: Vec<Option<MapPointHandle>>,
    pub outlier: Vec<bool>,
    /// world-to-camera transform, set once tracking produced an estimate
    pub pose: Option<Isometry3<MyFloat>>,
    pub ref_keyframe: Option<KeyFrameHandle>,
}

impl Frame {
    /// Build a frame from extractor output. `raw_keypoints` are in distorted
    /// pixel coordinates and are undistorted here, once.
    pub fn new(
        id: FrameId,
        camera: Arc<PinholeCamera>,
        raw_keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        depths: Option<Vec<MyFloat>>,
        timestamp: Option<MyFloat>,
    ) -> Frame {
        debug_assert_eq!(raw_keypoints.len(), descriptors.len());
        let keypoints: Vec<KeyPoint> = raw_keypoints
            .into_iter()
            .map(|kp| KeyPoint {
                pt: camera.undistort(&DistortedPixel { coords: kp.pt }).coords,
                ..kp
            })
            .collect();
        let n = keypoints.len();
        Frame {
            id,
            timestamp,
            camera,
            keypoints,
            descriptors,
            depths,
            mappoints: vec![None; n],
            outlier: vec![false; n],
            pose: None,
            ref_keyframe: None,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn set_pose(&mut self, t_cw: Isometry3<MyFloat>) {
        self.pose = Some(t_cw);
    }

    /// Depth of keypoint `i` if the sensor provides one and it is valid.
    pub fn valid_depth(&self, i: usize) -> Option<MyFloat> {
        let z = *self.depths.as_ref()?.get(i)?;
        (z > 0.0).then_some(z)
    }

    /// Drop all map-point associations and outlier marks.
    pub fn clear_matches(&mut self) {
        self.mappoints.iter_mut().for_each(|m| *m = None);
        self.outlier.iter_mut().for_each(|o| *o = false);
    }

    /// Number of keypoints currently associated to a map point.
    pub fn n_matches(&self) -> usize {
        self.mappoints.iter().flatten().count()
    }
}
