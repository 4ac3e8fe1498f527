//! Map bootstrap: depth unprojection, two-view monocular initialization and
//! fiducial-pattern seeding.

use nalgebra::{Isometry3, Point3, Translation3};
use tracing::{debug, info, warn};

use spoor_mvg::UndistortedPixel;
use spoor_types::{MyFloat, OrbParams};

use crate::external::{PatternDetector, PoseOptimizer, TwoViewSolver};
use crate::frame::Frame;
use crate::map::{KeyFrame, KeyFrameHandle, MapInner};
use crate::map_point::MapPoint;
use crate::matcher;

/// A depth bootstrap needs strictly more than this many valid-depth
/// keypoints.
const RGBD_BOOTSTRAP_MIN_POINTS: usize = 500;
const MIN_BOOTSTRAP_KEYPOINTS: usize = 100;
const MIN_BOOTSTRAP_MATCHES: usize = 100;
const RANSAC_ITERATIONS: usize = 200;
const GLOBAL_BA_ITERATIONS: usize = 20;
const SEARCH_WINDOW: MyFloat = 100.0;
const MATCH_RATIO: MyFloat = 0.9;

/// Bootstrap from a single depth frame: identity pose, one map point per
/// valid-depth keypoint.
pub fn bootstrap_rgbd(
    frame: &mut Frame,
    map: &mut MapInner,
    orb: &OrbParams,
) -> Option<KeyFrameHandle> {
    let valid = frame
        .depths
        .as_ref()
        .map(|d| d.iter().filter(|z| **z > 0.0).count())
        .unwrap_or(0);
    if valid <= RGBD_BOOTSTRAP_MIN_POINTS {
        debug!(valid, "not enough depth for bootstrap");
        return None;
    }

    frame.set_pose(Isometry3::identity());
    let kf_id = map.next_keyframe_id();
    let kf = KeyFrame::from_frame(frame, kf_id)?;
    let h = map.add_keyframe(kf);

    let origin = Point3::origin();
    for i in 0..frame.len() {
        let Some(depth) = frame.valid_depth(i) else {
            continue;
        };
        let px = UndistortedPixel {
            coords: frame.keypoints[i].pt,
        };
        // camera frame is the world frame here
        let position = frame.camera.unproject(&px, depth);
        let mut mp = MapPoint::new(position, frame.descriptors[i]);
        mp.set_scale_and_normal(&origin, frame.keypoints[i].octave, orb);
        let mp_h = map.add_mappoint(mp);
        map.add_observation(h, i, mp_h);
        frame.mappoints[i] = Some(mp_h);
    }
    map.update_connections(h);
    info!(
        keyframe = %kf_id,
        points = map.mappoints_in_map(),
        "depth bootstrap"
    );
    Some(h)
}

/// Bootstrap from a detected fiducial pattern: identity pose, one map point
/// per pattern point at its known camera-frame position.
pub fn bootstrap_pattern(
    frame: &mut Frame,
    map: &mut MapInner,
    detector: &dyn PatternDetector,
    orb: &OrbParams,
) -> Option<KeyFrameHandle> {
    let points = detector.detect(frame)?;
    if points.is_empty() {
        return None;
    }

    frame.set_pose(Isometry3::identity());
    let kf_id = map.next_keyframe_id();
    let kf = KeyFrame::from_frame(frame, kf_id)?;
    let h = map.add_keyframe(kf);

    let origin = Point3::origin();
    for (idx, position) in points {
        if idx >= frame.len() {
            continue;
        }
        let mut mp = MapPoint::new(position, frame.descriptors[idx]);
        mp.set_scale_and_normal(&origin, frame.keypoints[idx].octave, orb);
        let mp_h = map.add_mappoint(mp);
        map.add_observation(h, idx, mp_h);
        frame.mappoints[idx] = Some(mp_h);
    }
    map.update_connections(h);
    info!(keyframe = %kf_id, "pattern bootstrap");
    Some(h)
}

#[derive(Debug, Clone, Copy)]
pub struct MonocularBootstrap {
    pub initial: KeyFrameHandle,
    pub current: KeyFrameHandle,
}

/// Two-stage monocular bootstrap. Stage A latches the first
/// sufficiently-featured frame; stage B matches each following frame against
/// it and hands the correspondences to the two-view solver.
#[derive(Default)]
pub struct Initializer {
    initial_frame: Option<Frame>,
}

impl Initializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.initial_frame = None;
    }

    pub fn process(
        &mut self,
        current: &mut Frame,
        map: &mut MapInner,
        solver: &dyn TwoViewSolver,
        optimizer: &dyn PoseOptimizer,
        orb: &OrbParams,
    ) -> Option<MonocularBootstrap> {
        let Some(initial) = self.initial_frame.as_ref() else {
            if current.len() >= MIN_BOOTSTRAP_KEYPOINTS {
                debug!(frame = %current.id, "monocular bootstrap reference latched");
                self.initial_frame = Some(current.clone());
            }
            return None;
        };

        if current.len() < MIN_BOOTSTRAP_KEYPOINTS {
            debug!(frame = %current.id, "too few keypoints, restarting bootstrap");
            self.initial_frame = None;
            return None;
        }

        let matches = matcher::search_for_initialization(initial, current, SEARCH_WINDOW, MATCH_RATIO);
        if matches.len() < MIN_BOOTSTRAP_MATCHES {
            debug!(matches = matches.len(), "too few matches, restarting bootstrap");
            self.initial_frame = None;
            return None;
        }

        // the solve may fail on degenerate motion; keep the reference frame
        // and try again with the next input
        let recon = solver.solve(initial, current, &matches, RANSAC_ITERATIONS)?;

        let mut initial_frame = self.initial_frame.take()?;
        initial_frame.set_pose(Isometry3::identity());
        current.set_pose(Isometry3::from_parts(
            Translation3::from(recon.translation),
            recon.rotation,
        ));

        let kf1_id = map.next_keyframe_id();
        let kf1 = KeyFrame::from_frame(&initial_frame, kf1_id)?;
        let h1 = map.add_keyframe(kf1);
        let kf2_id = map.next_keyframe_id();
        let kf2 = KeyFrame::from_frame(current, kf2_id)?;
        let h2 = map.add_keyframe(kf2);

        let origin = Point3::origin();
        for (m, &(i1, i2)) in matches.iter().enumerate() {
            let Some(position) = recon.points.get(m).copied().flatten() else {
                continue;
            };
            if position.z <= 0.0 {
                continue;
            }
            let mut mp = MapPoint::new(position, current.descriptors[i2]);
            mp.set_scale_and_normal(&origin, initial_frame.keypoints[i1].octave, orb);
            let mp_h = map.add_mappoint(mp);
            map.add_observation(h1, i1, mp_h);
            map.add_observation(h2, i2, mp_h);
            current.mappoints[i2] = Some(mp_h);
        }
        map.update_connections(h1);
        map.update_connections(h2);

        optimizer.global_ba(map, GLOBAL_BA_ITERATIONS);

        let median = median_scene_depth(map, h1);
        let tracked = map.tracked_mappoints(h2, 1);
        if median <= 0.0 || tracked < MIN_BOOTSTRAP_MATCHES {
            warn!(median, tracked, "bootstrap rejected, clearing seed map");
            map.clear();
            current.clear_matches();
            return None;
        }

        // fix the gauge: median depth of the first keyframe becomes 1
        let scale = 1.0 / median;
        if let Some(kf2) = map.keyframe_mut(h2) {
            kf2.pose.translation.vector *= scale;
        }
        for mp_h in map.all_mappoints() {
            if let Some(mp) = map.mappoint_mut(mp_h) {
                mp.position.coords *= scale;
            }
        }
        if let Some(kf2) = map.keyframe(h2) {
            current.set_pose(kf2.pose);
        }

        info!(
            points = map.mappoints_in_map(),
            "monocular bootstrap complete"
        );
        Some(MonocularBootstrap {
            initial: h1,
            current: h2,
        })
    }
}

/// Median depth of the map as seen from `kf` (its optical axis).
fn median_scene_depth(map: &MapInner, kf: KeyFrameHandle) -> MyFloat {
    let Some(keyframe) = map.keyframe(kf) else {
        return -1.0;
    };
    let pose = keyframe.pose;
    let mut zs: Vec<MyFloat> = keyframe
        .mappoints
        .iter()
        .flatten()
        .filter_map(|h| map.mappoint(*h))
        .map(|mp| (pose * mp.position).z)
        .collect();
    if zs.is_empty() {
        return -1.0;
    }
    zs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    zs[(zs.len() - 1) / 2]
}
