//! The keyframe admission predicate, kept pure so it can be tested at its
//! boundary values. The tracker gathers the inputs under the map lock and
//! performs the side effects (`interrupt_ba`, `set_not_stop`) itself.

use spoor_types::SensorKind;

/// Snapshot of everything the admission decision depends on. Frame counters
/// are raw frame numbers.
#[derive(Debug, Clone)]
pub struct KeyframeInputs {
    pub sensor: SensorKind,
    pub keyframes_in_map: usize,
    pub current_frame: u64,
    pub last_keyframe_frame: u64,
    pub last_reloc_frame: u64,
    pub max_frames: u64,
    pub min_frames: u64,
    pub matches_inliers: usize,
    /// map points of the reference keyframe with enough observations
    pub ref_tracked_points: usize,
    /// close-depth keypoints currently tracked (depth sensors only)
    pub tracked_close: usize,
    /// close-depth keypoints that could seed new points (depth sensors only)
    pub untracked_close: usize,
    pub mapper_idle: bool,
    pub mapper_stopped: bool,
    pub queue_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeVerdict {
    pub admit: bool,
    /// the mapper is busy and should abandon its current bundle adjustment
    pub interrupt_ba: bool,
}

const NO: KeyframeVerdict = KeyframeVerdict {
    admit: false,
    interrupt_ba: false,
};

pub fn need_new_keyframe(i: &KeyframeInputs) -> KeyframeVerdict {
    if i.mapper_stopped {
        return NO;
    }
    // no insertion right after a relocalization on a mature map
    if i.keyframes_in_map as u64 > i.max_frames
        && i.current_frame < i.last_reloc_frame + i.max_frames
    {
        return NO;
    }

    let need_close = i.sensor.has_depth() && i.tracked_close < 100 && i.untracked_close > 70;

    let c1a = i.current_frame >= i.last_keyframe_frame + i.max_frames;
    let c1b = i.current_frame >= i.last_keyframe_frame + i.min_frames && i.mapper_idle;
    let c1c = i.sensor.has_depth()
        && ((i.matches_inliers as f64) < 0.25 * i.ref_tracked_points as f64 || need_close);

    let th_ref_ratio = match i.sensor {
        SensorKind::Monocular | SensorKind::Fusion => 0.9,
        SensorKind::Rgbd => {
            if i.keyframes_in_map < 2 {
                0.4
            } else {
                0.75
            }
        }
    };
    let c2 = ((i.matches_inliers as f64) < th_ref_ratio * i.ref_tracked_points as f64
        || need_close)
        && i.matches_inliers > 15;

    if !((c1a || c1b || c1c) && c2) {
        return NO;
    }
    if i.mapper_idle {
        return KeyframeVerdict {
            admit: true,
            interrupt_ba: false,
        };
    }
    // mapper busy: ask it to break out of BA; depth sensors may still queue a
    // shallow backlog, monocular defers
    KeyframeVerdict {
        admit: i.sensor.has_depth() && i.queue_len < 3,
        interrupt_ba: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RGBD, busy mapper, shallow queue: admission turns on exactly at
    /// `max_frames` frames since the last keyframe.
    fn busy_rgbd_inputs(frames_since_kf: u64) -> KeyframeInputs {
        KeyframeInputs {
            sensor: SensorKind::Rgbd,
            keyframes_in_map: 10,
            current_frame: 100 + frames_since_kf,
            last_keyframe_frame: 100,
            last_reloc_frame: 0,
            max_frames: 30,
            min_frames: 0,
            matches_inliers: 60,
            ref_tracked_points: 100,
            tracked_close: 200,
            untracked_close: 0,
            mapper_idle: false,
            mapper_stopped: false,
            queue_len: 0,
        }
    }

    #[test]
    fn admission_boundary_at_max_frames() {
        let below = need_new_keyframe(&busy_rgbd_inputs(29));
        assert!(!below.admit);
        let at = need_new_keyframe(&busy_rgbd_inputs(30));
        assert!(at.admit);
        assert!(at.interrupt_ba);
    }

    #[test]
    fn stopped_mapper_suppresses_admission() {
        let mut i = busy_rgbd_inputs(30);
        i.mapper_stopped = true;
        assert_eq!(need_new_keyframe(&i), NO);
    }

    #[test]
    fn relocalization_window_suppresses_admission() {
        let mut i = busy_rgbd_inputs(30);
        i.keyframes_in_map = 40; // mature map
        i.last_reloc_frame = i.current_frame - 10; // relocated recently
        assert_eq!(need_new_keyframe(&i), NO);
    }

    #[test]
    fn strong_tracking_rejects_via_c2() {
        let mut i = busy_rgbd_inputs(30);
        i.matches_inliers = 90; // >= 0.75 * ref_tracked_points
        assert!(!need_new_keyframe(&i).admit);
    }

    #[test]
    fn monocular_defers_when_mapper_is_busy() {
        let mut i = busy_rgbd_inputs(30);
        i.sensor = SensorKind::Monocular;
        let v = need_new_keyframe(&i);
        assert!(!v.admit);
        assert!(v.interrupt_ba);
    }

    #[test]
    fn idle_mapper_admits_without_interrupt() {
        let mut i = busy_rgbd_inputs(5);
        i.mapper_idle = true;
        let v = need_new_keyframe(&i);
        assert!(v.admit);
        assert!(!v.interrupt_ba);
    }

    #[test]
    fn close_point_starvation_forces_admission() {
        let mut i = busy_rgbd_inputs(1);
        i.tracked_close = 50;
        i.untracked_close = 120;
        i.matches_inliers = 80; // would otherwise fail C2
        let v = need_new_keyframe(&i);
        assert!(v.admit || v.interrupt_ba);
        assert!(v.admit); // queue is shallow
    }
}
