//! The per-frame tracking state machine.
//!
//! `NoImages -> NotInitialized -> Ok <-> Lost`. Every grab call builds a
//! frame, takes the map's exclusive mutation lock for the full duration of
//! the track step, and returns the estimated world-to-camera transform (the
//! zero matrix while not tracking).

use std::sync::Arc;

use image::GrayImage;
use itertools::Itertools;
use nalgebra::{Isometry3, Matrix4};
use tracing::{debug, error, info, warn};

use spoor_motion::MotionModel;
use spoor_mvg::PinholeCamera;
use spoor_types::{FrameId, ImuSample, MyFloat, OrbParams, SensorKind};

use crate::config::SlamConfig;
use crate::error::{Error, Result};
use crate::external::{
    FeatureExtractor, ImageAligner, PatternDetector, PoseOptimizer, TwoViewSolver,
};
use crate::frame::{DepthImage, Frame};
use crate::initializer::{self, Initializer};
use crate::keyframe_policy::{need_new_keyframe, KeyframeInputs};
use crate::local_mapper::LocalMapperHandle;
use crate::map::{KeyFrame, KeyFrameHandle, Map, MapInner, MapPointHandle};
use crate::map_point::MapPoint;
use crate::matcher::{self, ProjectedCandidate};
use crate::trajectory::{save_trajectory, TrajectoryEntry};

/// Losing track with a map this small counts as a spurious bootstrap and
/// triggers a full reset.
const EARLY_LOSS_KEYFRAMES: usize = 5;
/// Default projection search radius in pixels, doubled on the fallback pass.
const SEARCH_RADIUS: MyFloat = 32.0;
const MIN_TRACK_MATCHES: usize = 20;
const MIN_TRACK_INLIERS: usize = 10;
const MIN_LOCAL_MAP_INLIERS: usize = 15;
const MAX_LOCAL_KEYFRAMES: usize = 80;
/// Angular distance between dead-reckoned and absolute orientation above
/// which the frame is considered inside a curve.
const CURVE_ANGLE_RAD: MyFloat = 0.02;
const VIEW_COS_MIN: MyFloat = 0.5;
/// Cap on depth-seeded map points per new keyframe.
const MAX_NEW_DEPTH_POINTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    NoImages,
    NotInitialized,
    Ok,
    Lost,
}

/// Per-frame sensor payload accompanying the grayscale image.
enum FrameSensorData {
    Monocular,
    Rgbd,
    Fusion { dt: MyFloat, imu: ImuSample },
}

/// The injected external collaborators.
pub struct Externals {
    pub extractor: Box<dyn FeatureExtractor>,
    pub optimizer: Box<dyn PoseOptimizer>,
    pub aligner: Box<dyn ImageAligner>,
    pub two_view: Box<dyn TwoViewSolver>,
    pub pattern: Option<Box<dyn PatternDetector>>,
}

pub struct Tracker {
    sensor: SensorKind,
    state: TrackingState,
    camera: Arc<PinholeCamera>,
    map: Arc<Map>,
    motion: MotionModel,
    extractor: Box<dyn FeatureExtractor>,
    optimizer: Box<dyn PoseOptimizer>,
    aligner: Box<dyn ImageAligner>,
    two_view: Box<dyn TwoViewSolver>,
    pattern: Option<Box<dyn PatternDetector>>,
    local_mapper: LocalMapperHandle,
    initializer: Initializer,
    orb: OrbParams,
    use_pattern: bool,
    max_frames: u64,
    min_frames: u64,
    close_depth: MyFloat,
    depth_map_factor: MyFloat,

    next_frame_id: u64,
    last_frame: Option<Frame>,
    ref_keyframe: Option<KeyFrameHandle>,
    last_keyframe_frame: FrameId,
    last_reloc_frame: FrameId,
    /// visual-odometry points owned by the tracker until the next frame
    temp_points: Vec<MapPointHandle>,
    local_keyframes: Vec<KeyFrameHandle>,
    local_mappoints: Vec<MapPointHandle>,
    matches_inliers: usize,
    only_tracking: bool,
    trajectory: Vec<TrajectoryEntry>,
}

impl Tracker {
    pub fn new(
        config: &SlamConfig,
        sensor: SensorKind,
        map: Arc<Map>,
        local_mapper: LocalMapperHandle,
        externals: Externals,
    ) -> Result<Tracker> {
        let mut config = config.clone();
        config.normalize();
        config.validate()?;
        let camera = Arc::new(PinholeCamera::new(&config.camera_params())?);
        let motion = if sensor.uses_imu() {
            MotionModel::imu(config.madgwick_gain)
        } else {
            MotionModel::constant_velocity()
        };
        Ok(Tracker {
            sensor,
            state: TrackingState::NoImages,
            camera,
            map,
            motion,
            extractor: externals.extractor,
            optimizer: externals.optimizer,
            aligner: externals.aligner,
            two_view: externals.two_view,
            pattern: externals.pattern,
            local_mapper,
            initializer: Initializer::new(),
            orb: config.orb_params(),
            use_pattern: config.use_pattern,
            max_frames: config.max_frames(),
            min_frames: 0,
            close_depth: config.close_depth(),
            depth_map_factor: config.depth_map_factor,
            next_frame_id: 1,
            last_frame: None,
            ref_keyframe: None,
            last_keyframe_frame: FrameId(0),
            last_reloc_frame: FrameId(0),
            temp_points: Vec::new(),
            local_keyframes: Vec::new(),
            local_mappoints: Vec::new(),
            matches_inliers: 0,
            only_tracking: false,
            trajectory: Vec::new(),
        })
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameHandle> {
        self.ref_keyframe
    }

    pub fn last_reloc_frame(&self) -> FrameId {
        self.last_reloc_frame
    }

    pub fn trajectory(&self) -> &[TrajectoryEntry] {
        &self.trajectory
    }

    /// The retained previous frame, if any.
    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    pub fn save_trajectory<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        save_trajectory(&self.trajectory, path)
    }

    /// Localization-only mode: keep estimating poses but stop growing the
    /// map (no keyframe admission).
    pub fn inform_only_tracking(&mut self, v: bool) {
        self.only_tracking = v;
    }

    pub fn grab_monocular(
        &mut self,
        image: &GrayImage,
        timestamp: Option<MyFloat>,
    ) -> Result<Matrix4<MyFloat>> {
        if self.sensor != SensorKind::Monocular {
            return Err(Error::InputViolation(
                "monocular input on a tracker configured for another sensor".into(),
            ));
        }
        let frame = self.make_frame(image, None, timestamp)?;
        Ok(self.track(frame, FrameSensorData::Monocular))
    }

    pub fn grab_rgbd(
        &mut self,
        image: &GrayImage,
        depth: &DepthImage,
        timestamp: Option<MyFloat>,
    ) -> Result<Matrix4<MyFloat>> {
        if self.sensor != SensorKind::Rgbd {
            return Err(Error::InputViolation(
                "depth input on a tracker configured for another sensor".into(),
            ));
        }
        let frame = self.make_frame(image, Some(depth), timestamp)?;
        Ok(self.track(frame, FrameSensorData::Rgbd))
    }

    pub fn grab_fusion(
        &mut self,
        image: &GrayImage,
        dt: MyFloat,
        imu: ImuSample,
        timestamp: Option<MyFloat>,
    ) -> Result<Matrix4<MyFloat>> {
        if self.sensor != SensorKind::Fusion {
            return Err(Error::InputViolation(
                "inertial input on a tracker configured for another sensor".into(),
            ));
        }
        let frame = self.make_frame(image, None, timestamp)?;
        Ok(self.track(frame, FrameSensorData::Fusion { dt, imu }))
    }

    /// Full system reset: empty map, cold motion model, state `NoImages`.
    pub fn reset(&mut self) {
        info!("system reset");
        self.local_mapper.request_reset();
        self.map.lock().clear();
        self.state = TrackingState::NoImages;
        self.motion.restart();
        self.initializer.reset();
        self.last_frame = None;
        self.ref_keyframe = None;
        self.last_keyframe_frame = FrameId(0);
        self.last_reloc_frame = FrameId(0);
        self.temp_points.clear();
        self.local_keyframes.clear();
        self.local_mappoints.clear();
        self.matches_inliers = 0;
        self.trajectory.clear();
    }

    fn make_frame(
        &mut self,
        image: &GrayImage,
        depth: Option<&DepthImage>,
        timestamp: Option<MyFloat>,
    ) -> Result<Frame> {
        if image.width() != self.camera.width() || image.height() != self.camera.height() {
            return Err(Error::InputViolation(format!(
                "image is {}x{}, camera is calibrated for {}x{}",
                image.width(),
                image.height(),
                self.camera.width(),
                self.camera.height()
            )));
        }
        if let Some(depth) = depth {
            if depth.width() != image.width() || depth.height() != image.height() {
                return Err(Error::InputViolation(
                    "depth image size disagrees with the grayscale image".into(),
                ));
            }
        }

        let (raw_keypoints, descriptors) = self.extractor.extract(image);
        let depths = depth.map(|depth| {
            raw_keypoints
                .iter()
                .map(|kp| {
                    let x = (kp.pt.x.round() as i64).clamp(0, depth.width() as i64 - 1) as u32;
                    let y = (kp.pt.y.round() as i64).clamp(0, depth.height() as i64 - 1) as u32;
                    let raw = depth.get_pixel(x, y).0[0];
                    if raw == 0 {
                        -1.0
                    } else {
                        raw as MyFloat / self.depth_map_factor
                    }
                })
                .collect()
        });

        let id = FrameId(self.next_frame_id);
        self.next_frame_id += 1;
        Ok(Frame::new(
            id,
            self.camera.clone(),
            raw_keypoints,
            descriptors,
            depths,
            timestamp,
        ))
    }

    fn track(&mut self, mut frame: Frame, data: FrameSensorData) -> Matrix4<MyFloat> {
        let map_arc = Arc::clone(&self.map);
        let mut needs_reset = false;
        let mut pose_out = Matrix4::zeros();
        {
            let mut map = map_arc.lock();

            // temporary VO points from the previous frame die when a new
            // frame starts, on every path
            self.destroy_temp_points(&mut map);

            if self.state == TrackingState::NoImages {
                self.state = TrackingState::NotInitialized;
                debug!(frame = %frame.id, "first image");
            }

            if self.state == TrackingState::NotInitialized {
                if self.initialize(&mut frame, &mut map) {
                    self.state = TrackingState::Ok;
                }
            } else {
                // chase replacements produced by local mapping since the
                // previous frame
                if let Some(last) = self.last_frame.as_mut() {
                    for slot in last.mappoints.iter_mut() {
                        if let Some(h) = *slot {
                            *slot = map.resolve(h);
                        }
                    }
                }

                if let FrameSensorData::Fusion { dt, imu } = &data {
                    self.motion.ingest_imu(imu, *dt);
                }

                let mut ok = match self.state {
                    TrackingState::Ok => {
                        let use_reference = !self.motion.started()
                            || frame.id.0 <= self.last_reloc_frame.0 + 2;
                        if use_reference {
                            self.track_reference_keyframe(&mut frame, &mut map)
                        } else if self.track_with_motion_model(&mut frame, &mut map) {
                            true
                        } else {
                            debug!(frame = %frame.id, "motion model failed, falling back");
                            self.motion.restart();
                            self.track_reference_keyframe(&mut frame, &mut map)
                        }
                    }
                    TrackingState::Lost => self.relocalize(&mut frame, &mut map),
                    _ => false,
                };

                if ok {
                    ok = self.track_local_map(&mut frame, &mut map);
                }

                if ok {
                    self.state = TrackingState::Ok;
                } else {
                    if self.state == TrackingState::Ok {
                        warn!(frame = %frame.id, "tracking lost");
                    }
                    self.state = TrackingState::Lost;
                }
                frame.ref_keyframe = self.ref_keyframe;

                if ok {
                    if let Some(pose) = frame.pose {
                        self.motion.update(&pose);
                    }
                    self.clean_vo_matches(&mut frame, &map);
                    self.destroy_temp_points(&mut map);
                    if !self.only_tracking {
                        self.maybe_insert_keyframe(&mut frame, &mut map);
                    }
                    // outlier slots must be clear before the frame is kept
                    for i in 0..frame.len() {
                        if frame.outlier[i] {
                            frame.mappoints[i] = None;
                            frame.outlier[i] = false;
                        }
                    }
                }

                if !ok && map.keyframes_in_map() <= EARLY_LOSS_KEYFRAMES {
                    error!("lost with a map of {} keyframes, resetting", map.keyframes_in_map());
                    needs_reset = true;
                }
            }

            self.record_trajectory(&frame, &map);
            if self.state == TrackingState::Ok {
                if let Some(pose) = frame.pose {
                    pose_out = pose.to_homogeneous();
                }
            }
            self.last_frame = Some(frame);
        }
        if needs_reset {
            self.reset();
        }
        pose_out
    }

    fn initialize(&mut self, frame: &mut Frame, map: &mut MapInner) -> bool {
        let bootstrap: Option<Vec<KeyFrameHandle>> = match self.sensor {
            SensorKind::Rgbd => {
                initializer::bootstrap_rgbd(frame, map, &self.orb).map(|h| vec![h])
            }
            SensorKind::Monocular | SensorKind::Fusion => {
                if self.use_pattern {
                    match self.pattern.as_deref() {
                        Some(detector) => {
                            initializer::bootstrap_pattern(frame, map, detector, &self.orb)
                                .map(|h| vec![h])
                        }
                        None => None,
                    }
                } else {
                    self.initializer
                        .process(
                            frame,
                            map,
                            self.two_view.as_ref(),
                            self.optimizer.as_ref(),
                            &self.orb,
                        )
                        .map(|b| vec![b.initial, b.current])
                }
            }
        };

        let Some(keyframes) = bootstrap else {
            return false;
        };
        let Some(&reference) = keyframes.last() else {
            return false;
        };
        for &h in &keyframes {
            self.local_mapper.insert_keyframe(h);
        }
        self.ref_keyframe = Some(reference);
        frame.ref_keyframe = Some(reference);
        self.last_keyframe_frame = frame.id;
        self.motion.restart();
        self.matches_inliers = frame.n_matches();
        let points = map.all_mappoints();
        map.set_reference_mappoints(points);
        true
    }

    /// Reference-keyframe tracking: seed from the last pose, optionally refine by
    /// direct alignment, then projection-match against the reference
    /// keyframe with a doubled-radius fallback against the last frame.
    fn track_reference_keyframe(&mut self, frame: &mut Frame, map: &mut MapInner) -> bool {
        let Some(ref_h) = self.ref_keyframe else {
            return false;
        };
        let Some(seed) = self.last_frame.as_ref().and_then(|f| f.pose) else {
            return false;
        };
        frame.set_pose(seed);

        match map.keyframe(ref_h) {
            Some(kf) => {
                if !self.aligner.compute_pose(frame, kf) {
                    // the seed must survive alignment failure bit-for-bit
                    frame.set_pose(seed);
                }
            }
            None => return false,
        }

        frame.clear_matches();
        let mut nmatches = match map.keyframe(ref_h) {
            Some(kf) => {
                matcher::search_keyframe_by_projection(frame, kf, map, SEARCH_RADIUS, &self.orb)
            }
            None => 0,
        };
        if nmatches < MIN_TRACK_MATCHES {
            if let Some(last) = self.last_frame.as_ref() {
                frame.clear_matches();
                nmatches = matcher::search_frame_by_projection(
                    frame,
                    last,
                    map,
                    2.0 * SEARCH_RADIUS,
                    &self.orb,
                );
            }
        }
        if nmatches < MIN_TRACK_MATCHES {
            debug!(frame = %frame.id, nmatches, "reference tracking: too few matches");
            return false;
        }

        self.optimizer.pose_optimization(frame, map);
        discard_outliers(frame, map) >= MIN_TRACK_INLIERS
    }

    /// Motion-model tracking: predict, match against the last frame, with the
    /// IMU curve replacement when the absolute orientation disagrees with
    /// dead reckoning.
    fn track_with_motion_model(&mut self, frame: &mut Frame, map: &mut MapInner) -> bool {
        self.seed_vo_points(map);

        let Some(last_pose) = self.last_frame.as_ref().and_then(|f| f.pose) else {
            return false;
        };
        let mut predicted = self.motion.predict(&last_pose);
        if let Some(orientation) = self.motion.orientation() {
            if last_pose.rotation.angle_to(&orientation) > CURVE_ANGLE_RAD {
                // inside a curve the gyro-backed orientation wins; keep the
                // predicted translation
                predicted = Isometry3::from_parts(predicted.translation, orientation);
            }
        }
        frame.set_pose(predicted);
        frame.clear_matches();

        let Some(last) = self.last_frame.as_ref() else {
            return false;
        };
        let mut nmatches =
            matcher::search_frame_by_projection(frame, last, map, SEARCH_RADIUS, &self.orb);
        if nmatches < MIN_TRACK_MATCHES {
            frame.clear_matches();
            nmatches = matcher::search_frame_by_projection(
                frame,
                last,
                map,
                2.0 * SEARCH_RADIUS,
                &self.orb,
            );
        }
        if nmatches < MIN_TRACK_MATCHES {
            debug!(frame = %frame.id, nmatches, "motion model: too few matches");
            return false;
        }

        self.optimizer.pose_optimization(frame, map);
        discard_outliers(frame, map) >= MIN_TRACK_INLIERS
    }

    /// Seed temporary visual-odometry points from the last frame's close
    /// depth samples so the motion-model search has geometry to match
    /// against. The points belong to the tracker, not the map.
    fn seed_vo_points(&mut self, map: &mut MapInner) {
        if !self.sensor.has_depth() || self.close_depth <= 0.0 {
            return;
        }
        let Some(mut last) = self.last_frame.take() else {
            return;
        };
        let Some(pose) = last.pose else {
            self.last_frame = Some(last);
            return;
        };

        let by_depth = (0..last.len())
            .filter_map(|i| last.valid_depth(i).map(|z| (z, i)))
            .sorted_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let center = spoor_mvg::camera_center(&pose);
        let mut seeded = 0usize;
        for (depth, i) in by_depth {
            let needs_point = match last.mappoints[i] {
                None => true,
                Some(h) => map
                    .resolve(h)
                    .and_then(|h| map.mappoint(h))
                    .map(|mp| mp.n_observations() < 1)
                    .unwrap_or(true),
            };
            if needs_point {
                let px = spoor_mvg::UndistortedPixel {
                    coords: last.keypoints[i].pt,
                };
                let position = last.camera.unproject_world(&pose, &px, depth);
                let mut mp = MapPoint::new(position, last.descriptors[i]);
                mp.set_scale_and_normal(&center, last.keypoints[i].octave, &self.orb);
                let h = map.add_mappoint(mp);
                last.mappoints[i] = Some(h);
                self.temp_points.push(h);
            }
            seeded += 1;
            if depth > self.close_depth && seeded > MAX_NEW_DEPTH_POINTS {
                break;
            }
        }
        self.last_frame = Some(last);
    }

    /// Local-map refinement: rebuild the local covisibility neighborhood, project
    /// its points, match, optimize once more and count map-backed inliers.
    fn track_local_map(&mut self, frame: &mut Frame, map: &mut MapInner) -> bool {
        self.update_local_keyframes(frame, map);
        self.update_local_points(frame, map);
        self.search_local_points(frame, map);

        self.optimizer.pose_optimization(frame, map);

        let mut inliers = 0usize;
        for i in 0..frame.len() {
            let Some(h) = frame.mappoints[i] else {
                continue;
            };
            if frame.outlier[i] {
                continue;
            }
            if let Some(mp) = map.mappoint_mut(h) {
                mp.increase_found(1);
                if mp.n_observations() >= 1 {
                    inliers += 1;
                }
            }
        }
        self.matches_inliers = inliers;
        map.set_reference_mappoints(self.local_mappoints.clone());

        if inliers < MIN_LOCAL_MAP_INLIERS {
            debug!(frame = %frame.id, inliers, "local map: too few inliers");
            return false;
        }
        true
    }

    /// Voters are keyframes observing any point matched in the frame; the
    /// strongest voter becomes the reference keyframe. The set is expanded
    /// with one covisibility neighbor, one spanning-tree child and the parent
    /// of each voter, capped at [`MAX_LOCAL_KEYFRAMES`].
    fn update_local_keyframes(&mut self, frame: &mut Frame, map: &MapInner) {
        let mut votes: std::collections::BTreeMap<KeyFrameHandle, usize> = Default::default();
        for (i, slot) in frame.mappoints.iter().enumerate() {
            let Some(h) = *slot else {
                continue;
            };
            if frame.outlier[i] {
                continue;
            }
            let Some(mp) = map.resolve(h).and_then(|h| map.mappoint(h)) else {
                continue;
            };
            for (&kf_h, _) in &mp.observations {
                *votes.entry(kf_h).or_insert(0) += 1;
            }
        }
        if votes.is_empty() {
            return;
        }

        let mut local: Vec<KeyFrameHandle> = Vec::new();
        let mut included: std::collections::BTreeSet<KeyFrameHandle> = Default::default();
        for (&kf_h, _) in &votes {
            if map.keyframe(kf_h).is_some() {
                local.push(kf_h);
                included.insert(kf_h);
            }
        }
        let best_voter = votes
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(h, _)| *h);
        if let Some(best) = best_voter {
            self.ref_keyframe = Some(best);
            frame.ref_keyframe = Some(best);
        }

        let voters = local.clone();
        for kf_h in voters {
            if local.len() >= MAX_LOCAL_KEYFRAMES {
                break;
            }
            let Some(kf) = map.keyframe(kf_h) else {
                continue;
            };
            if let Some(&n) = kf
                .ordered_neighbors
                .iter()
                .find(|n| !included.contains(n) && map.keyframe(**n).is_some())
            {
                local.push(n);
                included.insert(n);
            }
            if let Some(&c) = kf
                .children
                .iter()
                .find(|c| !included.contains(c) && map.keyframe(**c).is_some())
            {
                local.push(c);
                included.insert(c);
            }
            if let Some(p) = kf.parent {
                if !included.contains(&p) && map.keyframe(p).is_some() {
                    local.push(p);
                    included.insert(p);
                }
            }
        }
        self.local_keyframes = local;
    }

    /// Union of the local keyframes' points, deduplicated with the per-frame
    /// marker.
    fn update_local_points(&mut self, frame: &Frame, map: &mut MapInner) {
        self.local_mappoints.clear();
        for &kf_h in &self.local_keyframes {
            let slots: Vec<MapPointHandle> = match map.keyframe(kf_h) {
                Some(kf) => kf.mappoints.iter().flatten().copied().collect(),
                None => continue,
            };
            for mp_h in slots {
                if let Some(mp) = map.mappoint_mut(mp_h) {
                    if mp.bad || mp.track_reference_frame == frame.id {
                        continue;
                    }
                    mp.track_reference_frame = frame.id;
                    self.local_mappoints.push(mp_h);
                }
            }
        }
    }

    fn search_local_points(&mut self, frame: &mut Frame, map: &mut MapInner) {
        // points already matched in the frame are skipped by the search
        for slot in frame.mappoints.iter().flatten() {
            if let Some(mp) = map.mappoint_mut(*slot) {
                mp.last_seen_frame = frame.id;
                mp.increase_visible(1);
            }
        }
        let Some(pose) = frame.pose else {
            return;
        };
        let center = spoor_mvg::camera_center(&pose);

        let mut candidates: Vec<ProjectedCandidate> = Vec::new();
        for &h in &self.local_mappoints {
            let Some(mp) = map.mappoint_mut(h) else {
                continue;
            };
            if mp.bad || mp.last_seen_frame == frame.id {
                continue;
            }
            let Some(px) = frame.camera.project(&pose, &mp.position) else {
                continue;
            };
            let to_point = mp.position - center;
            let dist = to_point.norm();
            if dist < mp.min_distance || dist > mp.max_distance {
                continue;
            }
            if dist <= 0.0 || to_point.dot(&mp.normal) / dist < VIEW_COS_MIN {
                continue;
            }
            let level = mp.predicted_level(dist, &self.orb);
            mp.increase_visible(1);
            candidates.push(ProjectedCandidate {
                handle: h,
                proj: px.coords,
                level,
                view_cos: to_point.dot(&mp.normal) / dist,
            });
        }
        if candidates.is_empty() {
            return;
        }

        let mut th = if self.sensor.has_depth() { 3.0 } else { 1.0 };
        if self.last_reloc_frame.0 > 0 && frame.id.0 <= self.last_reloc_frame.0 + 2 {
            th = 5.0;
        }
        matcher::search_candidates_by_projection(frame, &candidates, map, th, &self.orb);
    }

    /// Relocalization: scan keyframes newest-first, align, re-match, and
    /// accept the first candidate that optimizes with enough inliers.
    fn relocalize(&mut self, frame: &mut Frame, map: &mut MapInner) -> bool {
        let candidates = map.all_keyframes();
        for &kf_h in candidates.iter().rev() {
            let aligned = match map.keyframe(kf_h) {
                Some(kf) => {
                    frame.set_pose(kf.pose);
                    self.aligner.compute_pose(frame, kf)
                }
                None => false,
            };
            if !aligned {
                continue;
            }
            frame.clear_matches();
            let nmatches = match map.keyframe(kf_h) {
                Some(kf) => matcher::search_keyframe_by_projection(
                    frame,
                    kf,
                    map,
                    SEARCH_RADIUS,
                    &self.orb,
                ),
                None => 0,
            };
            if nmatches < MIN_TRACK_MATCHES {
                continue;
            }
            self.optimizer.pose_optimization(frame, map);
            if discard_outliers(frame, map) < MIN_TRACK_INLIERS {
                continue;
            }
            self.last_reloc_frame = frame.id;
            self.ref_keyframe = Some(kf_h);
            info!(frame = %frame.id, "relocalized");
            return true;
        }
        false
    }

    /// Clear associations to points that never gained an observation (stale
    /// visual-odometry matches).
    fn clean_vo_matches(&self, frame: &mut Frame, map: &MapInner) {
        for slot in frame.mappoints.iter_mut() {
            let Some(h) = *slot else {
                continue;
            };
            let observed = map
                .resolve(h)
                .and_then(|h| map.mappoint(h))
                .map(|mp| mp.n_observations() >= 1)
                .unwrap_or(false);
            if !observed {
                *slot = None;
            }
        }
    }

    fn destroy_temp_points(&mut self, map: &mut MapInner) {
        for h in self.temp_points.drain(..) {
            map.remove_mappoint(h);
        }
    }

    fn maybe_insert_keyframe(&mut self, frame: &mut Frame, map: &mut MapInner) {
        let (tracked_close, untracked_close) = self.close_point_counts(frame);
        let ref_tracked = match self.ref_keyframe {
            Some(h) => {
                let min_obs = if map.keyframes_in_map() <= 2 { 2 } else { 3 };
                map.tracked_mappoints(h, min_obs)
            }
            None => 0,
        };
        let inputs = KeyframeInputs {
            sensor: self.sensor,
            keyframes_in_map: map.keyframes_in_map(),
            current_frame: frame.id.0,
            last_keyframe_frame: self.last_keyframe_frame.0,
            last_reloc_frame: self.last_reloc_frame.0,
            max_frames: self.max_frames,
            min_frames: self.min_frames,
            matches_inliers: self.matches_inliers,
            ref_tracked_points: ref_tracked,
            tracked_close,
            untracked_close,
            mapper_idle: self.local_mapper.accept_keyframes(),
            mapper_stopped: self.local_mapper.is_stopped() || self.local_mapper.stop_requested(),
            queue_len: self.local_mapper.keyframes_in_queue(),
        };
        let verdict = need_new_keyframe(&inputs);
        if verdict.interrupt_ba {
            self.local_mapper.interrupt_ba();
        }
        if !verdict.admit {
            return;
        }
        if !self.local_mapper.set_not_stop(true) {
            return;
        }
        self.create_new_keyframe(frame, map);
        self.local_mapper.set_not_stop(false);
    }

    fn close_point_counts(&self, frame: &Frame) -> (usize, usize) {
        if !self.sensor.has_depth() || self.close_depth <= 0.0 {
            return (0, 0);
        }
        let mut tracked = 0;
        let mut untracked = 0;
        for i in 0..frame.len() {
            let Some(depth) = frame.valid_depth(i) else {
                continue;
            };
            if depth >= self.close_depth {
                continue;
            }
            if frame.mappoints[i].is_some() && !frame.outlier[i] {
                tracked += 1;
            } else {
                untracked += 1;
            }
        }
        (tracked, untracked)
    }

    fn create_new_keyframe(&mut self, frame: &mut Frame, map: &mut MapInner) {
        let kf_id = map.next_keyframe_id();
        let Some(kf) = KeyFrame::from_frame(frame, kf_id) else {
            return;
        };
        let h = map.add_keyframe(kf);

        for i in 0..frame.len() {
            let Some(raw) = frame.mappoints[i] else {
                continue;
            };
            if frame.outlier[i] {
                continue;
            }
            if let Some(mp_h) = map.resolve(raw) {
                map.add_observation(h, i, mp_h);
            }
        }

        // depth sensors seed the closest untracked depth samples as new
        // points right away
        if self.sensor.has_depth() && self.close_depth > 0.0 {
            if let Some(pose) = frame.pose {
                let center = spoor_mvg::camera_center(&pose);
                let by_depth = (0..frame.len())
                    .filter_map(|i| frame.valid_depth(i).map(|z| (z, i)))
                    .filter(|&(z, i)| z < self.close_depth && frame.mappoints[i].is_none())
                    .sorted_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                for (depth, i) in by_depth.take(MAX_NEW_DEPTH_POINTS) {
                    let px = spoor_mvg::UndistortedPixel {
                        coords: frame.keypoints[i].pt,
                    };
                    let position = frame.camera.unproject_world(&pose, &px, depth);
                    let mut mp = MapPoint::new(position, frame.descriptors[i]);
                    mp.set_scale_and_normal(&center, frame.keypoints[i].octave, &self.orb);
                    let mp_h = map.add_mappoint(mp);
                    map.add_observation(h, i, mp_h);
                    frame.mappoints[i] = Some(mp_h);
                }
            }
        }

        map.update_connections(h);
        self.ref_keyframe = Some(h);
        frame.ref_keyframe = Some(h);
        self.last_keyframe_frame = frame.id;
        self.local_mapper.insert_keyframe(h);
        debug!(frame = %frame.id, keyframe = %kf_id, "keyframe inserted");
    }

    fn record_trajectory(&mut self, frame: &Frame, map: &MapInner) {
        let lost = self.state != TrackingState::Ok;
        if let (Some(pose), Some(ref_h)) = (frame.pose, frame.ref_keyframe) {
            if let Some(kf) = map.keyframe(ref_h) {
                let t_cr = pose * kf.pose.inverse();
                self.trajectory
                    .push(TrajectoryEntry::new(frame.id, kf.kf_id, &t_cr, lost));
                return;
            }
        }
        // no pose for this frame: repeat the previous relative pose, marked
        // lost, so the dump stays frame-dense
        if let Some(prev) = self.trajectory.last() {
            let mut entry = prev.clone();
            entry.frame_id = frame.id;
            entry.lost = true;
            self.trajectory.push(entry);
        }
    }
}

/// Drop outlier associations and count the remaining matches that are backed
/// by at least one keyframe observation.
fn discard_outliers(frame: &mut Frame, map: &MapInner) -> usize {
    let mut good = 0;
    for i in 0..frame.len() {
        let Some(h) = frame.mappoints[i] else {
            continue;
        };
        if frame.outlier[i] {
            frame.mappoints[i] = None;
            frame.outlier[i] = false;
        } else if map
            .mappoint(h)
            .map(|mp| mp.n_observations() >= 1)
            .unwrap_or(false)
        {
            good += 1;
        }
    }
    good
}
