use nalgebra::Isometry3;

use spoor_types::MyFloat;

/// Constant-velocity motion model over SE(3).
///
/// The velocity is the relative transform between the two most recent camera
/// poses; prediction composes it once more onto the latest pose.
#[derive(Debug, Clone, Default)]
pub struct ConstantVelocityModel {
    last_pose: Option<Isometry3<MyFloat>>,
    velocity: Option<Isometry3<MyFloat>>,
}

impl ConstantVelocityModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once two poses have been observed and a velocity exists.
    pub fn started(&self) -> bool {
        self.velocity.is_some()
    }

    pub fn restart(&mut self) {
        self.last_pose = None;
        self.velocity = None;
    }

    /// Record the pose estimated for the frame that just finished.
    pub fn update(&mut self, t_cw: &Isometry3<MyFloat>) {
        if let Some(prev) = &self.last_pose {
            self.velocity = Some(t_cw * prev.inverse());
        }
        self.last_pose = Some(*t_cw);
    }

    /// Predict the next world-to-camera transform from the last one.
    ///
    /// A cold model predicts no motion.
    pub fn predict(&self, last_t_cw: &Isometry3<MyFloat>) -> Isometry3<MyFloat> {
        match &self.velocity {
            Some(v) => v * last_t_cw,
            None => *last_t_cw,
        }
    }
}
