use std::collections::BTreeMap;

use nalgebra::{Point3, Vector3};

use spoor_types::{FrameId, MyFloat, OrbParams};

use crate::frame::Descriptor;
use crate::map::{KeyFrameHandle, MapPointHandle};

/// A 3D world-space landmark owned by the map.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub position: Point3<MyFloat>,
    pub ref_keyframe: Option<KeyFrameHandle>,
    /// keyframe -> keypoint index observing this point
    pub observations: BTreeMap<KeyFrameHandle, usize>,
    pub descriptor: Descriptor,
    /// mean viewing direction, unit length once set
    pub normal: Vector3<MyFloat>,
    pub min_distance: MyFloat,
    pub max_distance: MyFloat,
    /// frames in which the point fell inside the frustum
    pub visible: u32,
    /// frames in which the point was actually matched
    pub found: u32,
    pub replaced_by: Option<MapPointHandle>,
    pub bad: bool,
    /// last frame that had this point in view (skip marker for projection search)
    pub last_seen_frame: FrameId,
    /// dedup marker for local-map assembly
    pub track_reference_frame: FrameId,
}

impl MapPoint {
    pub fn new(position: Point3<MyFloat>, descriptor: Descriptor) -> MapPoint {
        MapPoint {
            position,
            ref_keyframe: None,
            observations: BTreeMap::new(),
            descriptor,
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: MyFloat::INFINITY,
            visible: 1,
            found: 1,
            replaced_by: None,
            bad: false,
            last_seen_frame: FrameId(0),
            track_reference_frame: FrameId(0),
        }
    }

    /// Set viewing direction and scale-invariance distance bounds from the
    /// observing camera center and the detection pyramid level.
    pub fn set_scale_and_normal(
        &mut self,
        camera_center: &Point3<MyFloat>,
        octave: usize,
        orb: &OrbParams,
    ) {
        let v = self.position - camera_center;
        let dist = v.norm();
        if dist <= 0.0 {
            return;
        }
        self.normal = v / dist;
        self.max_distance = dist * orb.level_scale(octave);
        self.min_distance = self.max_distance / orb.level_scale(orb.n_levels.saturating_sub(1));
    }

    /// Pyramid level a detection of this point is expected on at `dist`.
    pub fn predicted_level(&self, dist: MyFloat, orb: &OrbParams) -> usize {
        if dist <= 0.0 || self.max_distance <= 0.0 {
            return 0;
        }
        let ratio = self.max_distance / dist;
        let level = (ratio.ln() / orb.scale_factor.ln()).ceil();
        if level < 0.0 {
            0
        } else {
            (level as usize).min(orb.n_levels.saturating_sub(1))
        }
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found += n;
    }

    pub fn found_ratio(&self) -> MyFloat {
        if self.visible == 0 {
            0.0
        } else {
            self.found as MyFloat / self.visible as MyFloat
        }
    }
}
