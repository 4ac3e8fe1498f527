//! Motion and orientation models for camera pose prediction.
//!
//! Two concrete models feed the tracker's predict step: a constant-velocity
//! model over SE(3) and an IMU-driven model combining a translation EKF with
//! gyro-integrated rotation and a Madgwick orientation filter.

pub mod constant_velocity;
pub mod madgwick;
pub mod motion_model;
pub mod translation_ekf;

pub use constant_velocity::ConstantVelocityModel;
pub use madgwick::MadgwickFilter;
pub use motion_model::{ImuModel, MotionModel};
pub use translation_ekf::{constant_velocity_for_dt, PositionObservationModel};
