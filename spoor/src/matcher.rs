//! Projection-guided descriptor matching.
//!
//! All searches associate current-frame keypoints to existing map points by
//! projecting the points into the frame and comparing descriptors inside a
//! scale-dependent window, followed by an orientation-consistency pass that
//! keeps only the three dominant rotation bins.

use nalgebra::Point2;

use spoor_types::{MyFloat, OrbParams};

use crate::frame::Frame;
use crate::map::{KeyFrame, MapInner, MapPointHandle};

pub(crate) const DESC_DIST_HIGH: u32 = 100;
pub(crate) const DESC_DIST_LOW: u32 = 50;
const HISTO_LENGTH: usize = 30;
const NN_RATIO: MyFloat = 0.9;

/// A local map point that passed the frustum test, ready for guided search.
#[derive(Debug, Clone)]
pub struct ProjectedCandidate {
    pub handle: MapPointHandle,
    pub proj: Point2<MyFloat>,
    pub level: usize,
    pub view_cos: MyFloat,
}

struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    fn new() -> Self {
        RotationHistogram {
            bins: (0..HISTO_LENGTH).map(|_| Vec::new()).collect(),
        }
    }

    fn push(&mut self, keypoint_idx: usize, angle_ref: MyFloat, angle_cur: MyFloat) {
        let mut rot = angle_ref - angle_cur;
        if rot < 0.0 {
            rot += 360.0;
        }
        let bin = ((rot * HISTO_LENGTH as MyFloat / 360.0).round() as usize) % HISTO_LENGTH;
        self.bins[bin].push(keypoint_idx);
    }

    /// Indices outside the three heaviest bins. A lesser bin must hold more
    /// than a tenth of the heaviest to survive.
    fn outliers(self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by_key(|&b| std::cmp::Reverse(self.bins[b].len()));
        let max1 = self.bins[order[0]].len();
        let keep: Vec<usize> = order
            .into_iter()
            .take(3)
            .filter(|&b| self.bins[b].len() * 10 > max1)
            .collect();
        self.bins
            .into_iter()
            .enumerate()
            .filter(|(b, _)| !keep.contains(b))
            .flat_map(|(_, v)| v)
            .collect()
    }
}

fn keypoints_in_area(
    frame: &Frame,
    center: &Point2<MyFloat>,
    radius: MyFloat,
    min_level: isize,
    max_level: isize,
) -> Vec<usize> {
    frame
        .keypoints
        .iter()
        .enumerate()
        .filter(|(_, kp)| {
            let level = kp.octave as isize;
            level >= min_level
                && level <= max_level
                && (kp.pt.x - center.x).abs() <= radius
                && (kp.pt.y - center.y).abs() <= radius
        })
        .map(|(i, _)| i)
        .collect()
}

/// Shared body of the last-frame and reference-keyframe searches: project the
/// source's map points into `cur` and claim the best descriptor match inside
/// the window. Returns the number of associations kept.
fn search_slots_by_projection(
    cur: &mut Frame,
    src_slots: &[Option<MapPointHandle>],
    src_keypoints: &[crate::frame::KeyPoint],
    src_outlier: Option<&[bool]>,
    map: &MapInner,
    radius: MyFloat,
    orb: &OrbParams,
) -> usize {
    let Some(pose) = cur.pose else {
        return 0;
    };
    let mut hist = RotationHistogram::new();
    let mut matched = 0usize;

    for (i, slot) in src_slots.iter().enumerate() {
        let Some(raw) = *slot else {
            continue;
        };
        if src_outlier.map(|o| o[i]).unwrap_or(false) {
            continue;
        }
        let Some(mp_h) = map.resolve(raw) else {
            continue;
        };
        let Some(mp) = map.mappoint(mp_h) else {
            continue;
        };
        let Some(px) = cur.camera.project(&pose, &mp.position) else {
            continue;
        };
        let level = src_keypoints[i].octave as isize;
        let r = radius * orb.level_scale(level.max(0) as usize);
        let mut best = (DESC_DIST_HIGH + 1, usize::MAX);
        for c in keypoints_in_area(cur, &px.coords, r, level - 1, level + 1) {
            if cur.mappoints[c].is_some() {
                continue;
            }
            let dist = mp.descriptor.distance(&cur.descriptors[c]);
            if dist < best.0 {
                best = (dist, c);
            }
        }
        if best.0 <= DESC_DIST_HIGH {
            cur.mappoints[best.1] = Some(mp_h);
            matched += 1;
            hist.push(best.1, src_keypoints[i].angle, cur.keypoints[best.1].angle);
        }
    }

    for idx in hist.outliers() {
        if cur.mappoints[idx].take().is_some() {
            matched -= 1;
        }
    }
    matched
}

/// Match `cur` against the map points seen in `last`.
pub fn search_frame_by_projection(
    cur: &mut Frame,
    last: &Frame,
    map: &MapInner,
    radius: MyFloat,
    orb: &OrbParams,
) -> usize {
    search_slots_by_projection(
        cur,
        &last.mappoints,
        &last.keypoints,
        Some(&last.outlier),
        map,
        radius,
        orb,
    )
}

/// Match `cur` against the map points of a keyframe (reference tracking and
/// relocalization).
pub fn search_keyframe_by_projection(
    cur: &mut Frame,
    kf: &KeyFrame,
    map: &MapInner,
    radius: MyFloat,
    orb: &OrbParams,
) -> usize {
    search_slots_by_projection(cur, &kf.mappoints, &kf.keypoints, None, map, radius, orb)
}

/// Guided search over frustum-tested local map points. `th` scales the search
/// window on top of the per-candidate viewing-angle base radius.
pub fn search_candidates_by_projection(
    cur: &mut Frame,
    candidates: &[ProjectedCandidate],
    map: &MapInner,
    th: MyFloat,
    orb: &OrbParams,
) -> usize {
    let mut matched = 0usize;
    for cand in candidates {
        let Some(mp) = map.mappoint(cand.handle) else {
            continue;
        };
        if mp.bad {
            continue;
        }
        let base = if cand.view_cos > 0.998 { 2.5 } else { 4.0 };
        let r = th * base * orb.level_scale(cand.level);
        let level = cand.level as isize;
        let mut best = (DESC_DIST_HIGH + 1, usize::MAX);
        let mut second = DESC_DIST_HIGH + 1;
        for c in keypoints_in_area(cur, &cand.proj, r, level - 1, level + 1) {
            if cur.mappoints[c].is_some() {
                continue;
            }
            let dist = mp.descriptor.distance(&cur.descriptors[c]);
            if dist < best.0 {
                second = best.0;
                best = (dist, c);
            } else if dist < second {
                second = dist;
            }
        }
        if best.0 <= DESC_DIST_HIGH
            && (second > DESC_DIST_HIGH || (best.0 as MyFloat) < NN_RATIO * second as MyFloat)
        {
            cur.mappoints[best.1] = Some(cand.handle);
            matched += 1;
        }
    }
    matched
}

/// Bootstrap matching between the two initialization views: ratio test plus
/// orientation consistency, level-0 keypoints only.
pub fn search_for_initialization(
    first: &Frame,
    second: &Frame,
    window: MyFloat,
    ratio: MyFloat,
) -> Vec<(usize, usize)> {
    // best (distance, first_idx) claiming each second-frame keypoint
    let mut claimed: Vec<Option<(u32, usize)>> = vec![None; second.len()];

    for (i1, kp1) in first.keypoints.iter().enumerate() {
        if kp1.octave != 0 {
            continue;
        }
        let mut best = (DESC_DIST_LOW + 1, usize::MAX);
        let mut second_best = DESC_DIST_LOW + 1;
        for c in keypoints_in_area(second, &kp1.pt, window, 0, 0) {
            let dist = first.descriptors[i1].distance(&second.descriptors[c]);
            if dist < best.0 {
                second_best = best.0;
                best = (dist, c);
            } else if dist < second_best {
                second_best = dist;
            }
        }
        if best.1 == usize::MAX || best.0 > DESC_DIST_LOW {
            continue;
        }
        if second_best <= DESC_DIST_LOW && (best.0 as MyFloat) >= ratio * second_best as MyFloat {
            continue;
        }
        match claimed[best.1] {
            Some((prev, _)) if prev <= best.0 => {}
            _ => claimed[best.1] = Some((best.0, i1)),
        }
    }

    let mut hist = RotationHistogram::new();
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for (i2, entry) in claimed.iter().enumerate() {
        if let Some((_, i1)) = entry {
            hist.push(
                pairs.len(),
                first.keypoints[*i1].angle,
                second.keypoints[i2].angle,
            );
            pairs.push((*i1, i2));
        }
    }
    let mut drop: Vec<usize> = hist.outliers();
    drop.sort_unstable_by(|a, b| b.cmp(a));
    for d in drop {
        pairs.swap_remove(d);
    }
    pairs
}
