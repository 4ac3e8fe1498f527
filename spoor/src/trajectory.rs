//! Per-frame relative-pose trajectory, dumped in a YAML list. Each entry
//! stores the transform from the reference keyframe to the camera, so the
//! absolute trajectory can be recovered later from the (possibly optimized)
//! keyframe poses.

use std::path::Path;

use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

use spoor_types::{FrameId, KeyframeId, MyFloat};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub frame_id: FrameId,
    pub reference_keyframe: KeyframeId,
    /// `T_cr` as a row-major 4x4 matrix
    pub pose: Vec<MyFloat>,
    /// true when the tracker was not in the Ok state for this frame
    pub lost: bool,
}

impl TrajectoryEntry {
    pub fn new(
        frame_id: FrameId,
        reference_keyframe: KeyframeId,
        t_cr: &Isometry3<MyFloat>,
        lost: bool,
    ) -> TrajectoryEntry {
        let m = t_cr.to_homogeneous();
        let pose = (0..4)
            .flat_map(|r| (0..4).map(move |c| m[(r, c)]))
            .collect();
        TrajectoryEntry {
            frame_id,
            reference_keyframe,
            pose,
            lost,
        }
    }
}

pub fn save_trajectory<P: AsRef<Path>>(entries: &[TrajectoryEntry], path: P) -> Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    serde_yaml::to_writer(file, entries)?;
    Ok(())
}
